//! Echo server
//!
//! Answers locate requests for both session modes, accepts virtual circuits
//! and replies to every well-formed request with the sum of its two operands.
//! All listeners share one queue, so requests are answered strictly in the
//! order they arrive on each subscription.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use rvbench_core::subject::{
    LOCATE_SUBJECT, VC_DISCONNECTED_ADVISORY, VC_LOCATE_SUBJECT, VC_REQUEST_SUBJECT,
};
use rvbench_core::{
    Bus, BusError, DispatchStatus, EventHandle, EventKind, EventQueue, Message, QueueControl,
    VcAcceptor, VirtualCircuit,
};

use crate::config::ServerConfig;
use crate::error::{RunError, RunResult};
use crate::pacer::{FIELD_SUM, FIELD_X, FIELD_Y};

/// Counters reported when the server stops
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub locates: u64,
    pub requests: u64,
    pub malformed: u64,
    pub checksum_mismatches: u64,
    pub circuits_accepted: u64,
    pub circuits_closed: u64,
}

/// Why the serve loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Idle,
    Shutdown,
    QueueClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    DirectLocate,
    CircuitLocate,
    Requests,
    Connects,
    CircuitRequests(u64),
    CircuitAdvisory(u64),
}

struct CircuitEntry {
    circuit: VirtualCircuit,
    requests: EventHandle,
    advisory: EventHandle,
}

// ----------------------------------------------------------------------------
// Echo Server
// ----------------------------------------------------------------------------

pub struct EchoServer {
    bus: Arc<dyn Bus>,
    config: ServerConfig,
}

impl EchoServer {
    pub fn new(bus: Arc<dyn Bus>, config: ServerConfig) -> Self {
        Self { bus, config }
    }

    /// Serve until the idle timeout expires
    pub async fn run(&self) -> RunResult<ServerStats> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves or the idle timeout expires
    pub async fn run_until<F>(&self, shutdown: F) -> RunResult<ServerStats>
    where
        F: Future<Output = ()>,
    {
        self.config.validate()?;
        info!("Server using {}", self.bus.description());

        let mut queue = EventQueue::new("server");
        let control = queue.control();
        let mut state = ServeState {
            bus: Arc::clone(&self.bus),
            config: self.config.clone(),
            control: control.clone(),
            roles: HashMap::new(),
            circuits: HashMap::new(),
            next_circuit: 0,
            inbox: self.bus.create_inbox(),
            acceptor: VcAcceptor::create(Arc::clone(&self.bus)),
            stats: ServerStats::default(),
        };
        state.listen_well_known().await?;

        tokio::pin!(shutdown);
        let result = loop {
            let status = tokio::select! {
                _ = &mut shutdown => break Ok(StopReason::Shutdown),
                status = queue.dispatch(Some(self.config.idle_timeout)) => status,
            };

            match status {
                DispatchStatus::Timeout => break Ok(StopReason::Idle),
                DispatchStatus::Closed => break Ok(StopReason::QueueClosed),
                DispatchStatus::Event(event) => {
                    let Some(role) = state.roles.get(&event.handle).copied() else {
                        continue;
                    };
                    if let EventKind::Message(message) = event.kind {
                        if let Err(e) = state.handle(role, event.handle, message).await {
                            break Err(e);
                        }
                    }
                }
            }
        };

        match &result {
            Ok(StopReason::Idle) => info!(
                "Server exiting after {:?} without requests",
                self.config.idle_timeout
            ),
            Ok(reason) => info!("Server stopping: {:?}", reason),
            Err(e) => warn!("Server stopping on error: {}", e),
        }

        control.destroy_queue();
        drop(queue);
        state.close_circuits().await;

        info!(
            "Server answered {} requests over {} circuits",
            state.stats.requests, state.stats.circuits_accepted
        );
        result.map(|_| state.stats)
    }
}

// ----------------------------------------------------------------------------
// Serve State
// ----------------------------------------------------------------------------

struct ServeState {
    bus: Arc<dyn Bus>,
    config: ServerConfig,
    control: QueueControl,
    roles: HashMap<EventHandle, Role>,
    circuits: HashMap<u64, CircuitEntry>,
    next_circuit: u64,
    inbox: String,
    acceptor: VcAcceptor,
    stats: ServerStats,
}

impl ServeState {
    async fn listen(&mut self, channel: &dyn Bus, subject: &str, role: Role) -> RunResult<EventHandle> {
        let subscription = channel
            .subscribe(subject)
            .await
            .map_err(|e| RunError::setup("subscribing the server", e))?;
        let handle = self
            .control
            .listen(subscription)
            .map_err(|e| RunError::setup("subscribing the server", e))?;
        self.roles.insert(handle, role);
        Ok(handle)
    }

    async fn listen_well_known(&mut self) -> RunResult<()> {
        let bus = Arc::clone(&self.bus);
        if self.config.serve_direct {
            self.listen(bus.as_ref(), LOCATE_SUBJECT, Role::DirectLocate).await?;
            let inbox = self.inbox.clone();
            self.listen(bus.as_ref(), &inbox, Role::Requests).await?;
            info!("Answering requests on {}", self.inbox);
        }
        if self.config.serve_circuits {
            self.listen(bus.as_ref(), VC_LOCATE_SUBJECT, Role::CircuitLocate).await?;
            let connect_subject = self.acceptor.connect_subject().to_string();
            self.listen(bus.as_ref(), &connect_subject, Role::Connects).await?;
            info!("Accepting virtual circuits on {}", connect_subject);
        }
        Ok(())
    }

    async fn handle(&mut self, role: Role, handle: EventHandle, message: Message) -> RunResult<()> {
        match role {
            Role::DirectLocate => {
                info!("Client search message received");
                let address = self.inbox.clone();
                self.answer_locate(&message, address).await;
                Ok(())
            }
            Role::CircuitLocate => {
                info!("Client circuit search message received");
                let address = self.acceptor.connect_subject().to_string();
                self.answer_locate(&message, address).await;
                Ok(())
            }
            Role::Connects => {
                self.accept(&message).await;
                Ok(())
            }
            Role::Requests => {
                let bus = Arc::clone(&self.bus);
                self.answer(bus.as_ref(), message).await
            }
            Role::CircuitRequests(id) => match self.circuits.remove(&id) {
                Some(entry) => {
                    let result = self.answer(&entry.circuit, message).await;
                    self.circuits.insert(id, entry);
                    result
                }
                None => {
                    self.release(handle);
                    Ok(())
                }
            },
            Role::CircuitAdvisory(id) => {
                self.drop_circuit(id);
                Ok(())
            }
        }
    }

    async fn answer_locate(&mut self, request: &Message, address: String) {
        self.stats.locates += 1;
        let reply = Message::new().with_reply_subject(address);
        if let Err(e) = self.bus.send_reply(reply, request).await {
            warn!("Failed to answer search request: {}", e);
        }
    }

    async fn accept(&mut self, request: &Message) {
        let circuit = match self.acceptor.accept(request).await {
            Ok(circuit) => circuit,
            Err(e) => {
                warn!("Rejected circuit connect request: {}", e);
                return;
            }
        };

        let id = self.next_circuit;
        self.next_circuit += 1;

        let requests = self.listen(&circuit, VC_REQUEST_SUBJECT, Role::CircuitRequests(id)).await;
        let advisory = self
            .listen(&circuit, VC_DISCONNECTED_ADVISORY, Role::CircuitAdvisory(id))
            .await;
        match (requests, advisory) {
            (Ok(requests), Ok(advisory)) => {
                self.stats.circuits_accepted += 1;
                info!("Virtual circuit {} accepted from {}", id, circuit.peer_inbox().unwrap_or("?"));
                self.circuits.insert(
                    id,
                    CircuitEntry {
                        circuit,
                        requests,
                        advisory,
                    },
                );
            }
            (requests, advisory) => {
                for handle in [requests, advisory].into_iter().flatten() {
                    self.release(handle);
                }
                warn!("Could not listen on virtual circuit {}", id);
                if let Err(e) = circuit.close().await {
                    debug!("Closing unusable circuit {}: {}", id, e);
                }
            }
        }
    }

    fn release(&mut self, handle: EventHandle) {
        self.roles.remove(&handle);
        self.control.destroy(handle);
    }

    fn drop_circuit(&mut self, id: u64) {
        if let Some(entry) = self.circuits.remove(&id) {
            self.release(entry.requests);
            self.release(entry.advisory);
            self.stats.circuits_closed += 1;
            info!("Virtual circuit {} disconnected", id);
        }
    }

    /// Reply with `sum = x + y` on the request's reply subject
    ///
    /// Malformed requests are skipped. A reply the bus refuses is fatal unless
    /// the circuit it was meant for has already gone away.
    async fn answer(&mut self, channel: &dyn Bus, mut request: Message) -> RunResult<()> {
        let (Some(x), Some(y)) = (request.get_u32(FIELD_X), request.get_u32(FIELD_Y)) else {
            self.stats.malformed += 1;
            warn!("Ignoring request without operands: {}", request);
            return Ok(());
        };

        let sum = x.wrapping_add(y);
        if let Some(claimed) = request.get_u32(FIELD_SUM) {
            if claimed != sum {
                self.stats.checksum_mismatches += 1;
                warn!("Request claims {} + {} = {}, replying {}", x, y, claimed, sum);
            }
        }

        let reply = if self.config.new_message {
            let mut reply = Message::new();
            reply.update_u32(FIELD_SUM, sum);
            reply
        } else {
            request.update_u32(FIELD_SUM, sum);
            request.clone()
        };

        match channel.send_reply(reply, &request).await {
            Ok(()) => {}
            Err(BusError::Disconnected) => {
                debug!("Dropped reply to a disconnected circuit");
                return Ok(());
            }
            Err(BusError::MissingSubject) => {
                self.stats.malformed += 1;
                warn!("Ignoring request without a reply subject");
                return Ok(());
            }
            Err(source) => {
                return Err(RunError::SendFailure {
                    sequence: x,
                    source,
                })
            }
        }

        self.stats.requests += 1;
        let every = u64::from(self.config.status_every);
        if every > 0 && self.stats.requests % every == 0 {
            info!("{} requests answered", self.stats.requests);
        }
        Ok(())
    }

    async fn close_circuits(&mut self) {
        let entries: Vec<CircuitEntry> = self.circuits.drain().map(|(_, entry)| entry).collect();
        if entries.is_empty() {
            return;
        }

        let closes = entries.iter().map(|entry| entry.circuit.close());
        for result in futures::future::join_all(closes).await {
            if let Err(e) = result {
                debug!("Closing circuit: {}", e);
            }
        }
        self.stats.circuits_closed += entries.len() as u64;
    }
}

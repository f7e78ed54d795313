//! Virtual circuits
//!
//! A circuit is a two-endpoint session layered over any `Bus`. Each endpoint
//! owns a private control inbox; the four control operations travel between
//! those inboxes:
//!
//! - `connect` from the connecting side to the acceptor's connect subject
//! - `accept` back to the connecting side, carrying the acceptor's inbox
//! - `data` carrying an application message nested in the `data` field
//! - `disconnect` when either side closes
//!
//! Application data is demultiplexed by its own send subject on an in-process
//! bus, so a circuit is itself a `Bus`. Lifecycle changes are announced on the
//! local side as advisories (`_RV.INFO.SYSTEM.VC.CONNECTED`,
//! `_RV.INFO.SYSTEM.VC.DISCONNECTED`).

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{Bus, Subscription};
use crate::errors::{BusError, BusResult, StateTransitionError};
use crate::memory::MemoryBus;
use crate::message::Message;
use crate::subject::{self, VC_CONNECTED_ADVISORY, VC_DISCONNECTED_INFO};

const OP_FIELD: &str = "op";
const INBOX_FIELD: &str = "inbox";
const DATA_FIELD: &str = "data";
const REASON_FIELD: &str = "reason";

const OP_CONNECT: &str = "connect";
const OP_ACCEPT: &str = "accept";
const OP_DATA: &str = "data";
const OP_DISCONNECT: &str = "disconnect";

// ----------------------------------------------------------------------------
// Lifecycle State Machine
// ----------------------------------------------------------------------------

/// Lifecycle of one circuit endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcState {
    /// Created, no handshake traffic yet
    Initializing,
    /// Connect request sent, waiting for the peer to accept
    Waiting,
    /// Handshake complete, data may flow
    Connected,
    /// Terminal
    Disconnected,
}

/// Inputs that move a circuit between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcEvent {
    ConnectSent,
    Accepted,
    Disconnected,
}

impl VcState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VcState::Initializing => "initializing",
            VcState::Waiting => "waiting",
            VcState::Connected => "connected",
            VcState::Disconnected => "disconnected",
        }
    }

    /// Apply an event; edges the lifecycle does not have are errors
    pub fn transition(self, event: VcEvent) -> Result<VcState, StateTransitionError> {
        match (self, event) {
            (VcState::Initializing, VcEvent::ConnectSent) => Ok(VcState::Waiting),
            (VcState::Waiting, VcEvent::Accepted) => Ok(VcState::Connected),
            // acceptor side goes straight to connected
            (VcState::Initializing, VcEvent::Accepted) => Ok(VcState::Connected),
            (_, VcEvent::Disconnected) => Ok(VcState::Disconnected),
            (from, event) => Err(StateTransitionError::InvalidTransition {
                from_state: from.as_str(),
                event: event.as_str(),
            }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, VcState::Disconnected)
    }
}

impl VcEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            VcEvent::ConnectSent => "connect-sent",
            VcEvent::Accepted => "accepted",
            VcEvent::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for VcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Circuit
// ----------------------------------------------------------------------------

struct CircuitShared {
    bus: Arc<dyn Bus>,
    local_inbox: String,
    peer_inbox: OnceLock<String>,
    state: watch::Sender<VcState>,
    local: MemoryBus,
}

impl CircuitShared {
    fn apply(&self, event: VcEvent) -> Result<VcState, StateTransitionError> {
        let mut result = Ok(VcState::Initializing);
        self.state.send_if_modified(|state| match state.transition(event) {
            Ok(next) => {
                let changed = next != *state;
                *state = next;
                result = Ok(next);
                changed
            }
            Err(error) => {
                result = Err(error);
                false
            }
        });
        result
    }

    /// Move to `Disconnected` and advertise it locally; false if already there
    fn disconnect(&self, reason: &str) -> bool {
        let previous = *self.state.borrow();
        if previous.is_terminal() || self.apply(VcEvent::Disconnected).is_err() {
            return false;
        }

        info!(
            "Virtual circuit {} disconnected ({}) after being {}",
            self.local_inbox, reason, previous
        );
        let mut advisory = Message::to_subject(VC_DISCONNECTED_INFO);
        advisory.update_string(REASON_FIELD, reason);
        if let Err(e) = self.local.deliver(&advisory) {
            warn!("Failed to deliver disconnect advisory: {}", e);
        }
        true
    }

    fn disconnect_notice(&self) -> Option<Message> {
        self.peer_inbox.get().map(|peer| {
            let mut notice = Message::to_subject(peer.as_str());
            notice.update_string(OP_FIELD, OP_DISCONNECT);
            notice
        })
    }
}

/// One endpoint of a virtual circuit
pub struct VirtualCircuit {
    shared: Arc<CircuitShared>,
    pump: JoinHandle<()>,
}

impl VirtualCircuit {
    fn start(bus: Arc<dyn Bus>, local_inbox: String, control: Subscription) -> Self {
        let (state, _) = watch::channel(VcState::Initializing);
        let shared = Arc::new(CircuitShared {
            bus,
            local: MemoryBus::new(&local_inbox),
            local_inbox,
            peer_inbox: OnceLock::new(),
            state,
        });
        let pump = tokio::spawn(pump(Arc::clone(&shared), control));
        Self { shared, pump }
    }

    /// Ask the acceptor listening on `connect_subject` for a circuit
    ///
    /// Returns in `Waiting`; use `await_connected` for the handshake.
    pub async fn connect(bus: Arc<dyn Bus>, connect_subject: &str) -> BusResult<Self> {
        subject::validate_send(connect_subject)?;
        let local_inbox = bus.create_inbox();
        let control = bus.subscribe(&local_inbox).await?;
        let circuit = Self::start(bus, local_inbox, control);

        let mut request = Message::to_subject(connect_subject);
        request.update_string(OP_FIELD, OP_CONNECT);
        request.update_string(INBOX_FIELD, circuit.shared.local_inbox.as_str());
        circuit.shared.apply(VcEvent::ConnectSent)?;
        circuit.shared.bus.publish(request).await?;

        debug!(
            "Virtual circuit {} sent connect to {}",
            circuit.shared.local_inbox, connect_subject
        );
        Ok(circuit)
    }

    /// Wait until the handshake completes
    pub async fn await_connected(&self, timeout: Duration) -> BusResult<()> {
        let mut state = self.shared.state.subscribe();
        let wait = async {
            loop {
                let current = *state.borrow_and_update();
                match current {
                    VcState::Connected => return Ok(()),
                    VcState::Disconnected => return Err(BusError::Disconnected),
                    VcState::Initializing | VcState::Waiting => {}
                }
                if state.changed().await.is_err() {
                    return Err(BusError::Closed);
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| BusError::timeout(timeout))?
    }

    pub fn state(&self) -> VcState {
        *self.shared.state.borrow()
    }

    /// Watch lifecycle changes
    pub fn state_changes(&self) -> watch::Receiver<VcState> {
        self.shared.state.subscribe()
    }

    pub fn local_inbox(&self) -> &str {
        &self.shared.local_inbox
    }

    pub fn peer_inbox(&self) -> Option<&str> {
        self.shared.peer_inbox.get().map(String::as_str)
    }

    /// Deliver `message` to the peer, keeping its own send subject
    pub async fn send(&self, message: Message) -> BusResult<()> {
        match self.state() {
            VcState::Connected => {}
            VcState::Disconnected => return Err(BusError::Disconnected),
            other => {
                return Err(BusError::protocol(format!(
                    "virtual circuit is {}, not connected",
                    other
                )))
            }
        }
        let send_subject = message.send_subject().ok_or(BusError::MissingSubject)?;
        subject::validate_send(send_subject)?;
        let peer = self.shared.peer_inbox.get().ok_or(BusError::Disconnected)?;

        let mut envelope = Message::to_subject(peer.as_str());
        envelope.update_string(OP_FIELD, OP_DATA);
        envelope.update_message(DATA_FIELD, message);
        self.shared.bus.publish(envelope).await
    }

    /// Disconnect and notify the peer; later calls do nothing
    pub async fn close(&self) -> BusResult<()> {
        if !self.shared.disconnect("closed locally") {
            return Ok(());
        }
        self.pump.abort();
        match self.shared.disconnect_notice() {
            Some(notice) => self.shared.bus.publish(notice).await,
            None => Ok(()),
        }
    }
}

impl Drop for VirtualCircuit {
    fn drop(&mut self) {
        self.pump.abort();
        if !self.shared.disconnect("dropped") {
            return;
        }
        let Some(notice) = self.shared.disconnect_notice() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let bus = Arc::clone(&self.shared.bus);
            runtime.spawn(async move {
                let _ = bus.publish(notice).await;
            });
        }
    }
}

impl fmt::Debug for VirtualCircuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualCircuit")
            .field("local_inbox", &self.shared.local_inbox)
            .field("peer_inbox", &self.shared.peer_inbox.get())
            .field("state", &self.state())
            .finish()
    }
}

#[async_trait]
impl Bus for VirtualCircuit {
    async fn publish(&self, message: Message) -> BusResult<()> {
        self.send(message).await
    }

    async fn subscribe(&self, subject: &str) -> BusResult<Subscription> {
        self.shared.local.subscribe(subject).await
    }

    fn description(&self) -> String {
        format!(
            "virtual circuit {} over {}",
            self.shared.local_inbox,
            self.shared.bus.description()
        )
    }
}

/// Handle control traffic for one endpoint until the circuit ends
async fn pump(shared: Arc<CircuitShared>, mut control: Subscription) {
    while let Some(mut message) = control.recv().await {
        let op = message.get_string(OP_FIELD).map(str::to_owned);
        match op.as_deref() {
            Some(OP_DATA) => {
                if *shared.state.borrow() != VcState::Connected {
                    debug!("Virtual circuit {} dropped early data", shared.local_inbox);
                    continue;
                }
                match message.take_message(DATA_FIELD) {
                    Some(inner) => {
                        if let Err(e) = shared.local.deliver(&inner) {
                            debug!("Virtual circuit {} dropped data: {}", shared.local_inbox, e);
                        }
                    }
                    None => debug!("Virtual circuit {} got data without payload", shared.local_inbox),
                }
            }
            Some(OP_ACCEPT) => {
                let Some(peer) = message.get_string(INBOX_FIELD) else {
                    warn!("Virtual circuit {} got accept without inbox", shared.local_inbox);
                    continue;
                };
                if shared.peer_inbox.set(peer.to_string()).is_err() {
                    debug!("Virtual circuit {} ignored repeated accept", shared.local_inbox);
                    continue;
                }
                match shared.apply(VcEvent::Accepted) {
                    Ok(_) => {
                        debug!("Virtual circuit {} connected to {}", shared.local_inbox, peer);
                        let mut advisory = Message::to_subject(VC_CONNECTED_ADVISORY);
                        advisory.update_string(INBOX_FIELD, peer);
                        let _ = shared.local.deliver(&advisory);
                    }
                    Err(e) => warn!("Virtual circuit {} rejected accept: {}", shared.local_inbox, e),
                }
            }
            Some(OP_DISCONNECT) => {
                shared.disconnect("peer disconnected");
                break;
            }
            other => debug!(
                "Virtual circuit {} ignored control op {:?}",
                shared.local_inbox, other
            ),
        }
    }

    // the control route is gone, nothing more can arrive
    shared.disconnect("control channel closed");
}

// ----------------------------------------------------------------------------
// Acceptor
// ----------------------------------------------------------------------------

/// Accepts incoming circuit connect requests
pub struct VcAcceptor {
    bus: Arc<dyn Bus>,
    connect_subject: String,
}

impl VcAcceptor {
    /// Mint a connect subject on `bus`; subscribe to it before advertising it
    pub fn create(bus: Arc<dyn Bus>) -> Self {
        let connect_subject = bus.create_inbox();
        Self {
            bus,
            connect_subject,
        }
    }

    pub fn connect_subject(&self) -> &str {
        &self.connect_subject
    }

    /// Subscribe to connect requests
    pub async fn subscribe(&self) -> BusResult<Subscription> {
        self.bus.subscribe(&self.connect_subject).await
    }

    /// Answer a connect request and return the connected endpoint
    pub async fn accept(&self, request: &Message) -> BusResult<VirtualCircuit> {
        if request.get_string(OP_FIELD) != Some(OP_CONNECT) {
            return Err(BusError::protocol("not a virtual circuit connect request"));
        }
        let peer = request
            .get_string(INBOX_FIELD)
            .ok_or_else(|| BusError::protocol("connect request carries no inbox"))?;
        subject::validate_send(peer)?;

        let local_inbox = self.bus.create_inbox();
        let control = self.bus.subscribe(&local_inbox).await?;
        let circuit = VirtualCircuit::start(Arc::clone(&self.bus), local_inbox, control);
        let _ = circuit.shared.peer_inbox.set(peer.to_string());
        circuit.shared.apply(VcEvent::Accepted)?;

        let mut reply = Message::to_subject(peer);
        reply.update_string(OP_FIELD, OP_ACCEPT);
        reply.update_string(INBOX_FIELD, circuit.shared.local_inbox.as_str());
        self.bus.publish(reply).await?;

        info!(
            "Accepted virtual circuit {} from {}",
            circuit.shared.local_inbox, peer
        );
        Ok(circuit)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::VC_DISCONNECTED_ADVISORY;

    #[test]
    fn test_state_transitions() {
        assert_eq!(
            VcState::Initializing.transition(VcEvent::ConnectSent),
            Ok(VcState::Waiting)
        );
        assert_eq!(
            VcState::Waiting.transition(VcEvent::Accepted),
            Ok(VcState::Connected)
        );
        assert_eq!(
            VcState::Connected.transition(VcEvent::Disconnected),
            Ok(VcState::Disconnected)
        );
        assert!(VcState::Connected.transition(VcEvent::ConnectSent).is_err());
        assert!(VcState::Disconnected.transition(VcEvent::Accepted).is_err());
        assert_eq!(
            VcState::Disconnected.transition(VcEvent::Disconnected),
            Ok(VcState::Disconnected)
        );
    }

    async fn connected_pair(bus: &MemoryBus) -> (VirtualCircuit, VirtualCircuit) {
        let bus: Arc<dyn Bus> = Arc::new(bus.clone());
        let acceptor = VcAcceptor::create(Arc::clone(&bus));
        let mut requests = acceptor.subscribe().await.unwrap();

        let client = VirtualCircuit::connect(bus, acceptor.connect_subject())
            .await
            .unwrap();
        assert_eq!(client.state(), VcState::Waiting);

        let request = requests.recv().await.unwrap();
        let server = acceptor.accept(&request).await.unwrap();
        client
            .await_connected(Duration::from_secs(1))
            .await
            .unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_data_flows_both_ways() {
        let bus = MemoryBus::new("test");
        let (client, server) = connected_pair(&bus).await;

        let mut work = server.subscribe("TIBRV.VC.WORK").await.unwrap();
        let mut replies = client.subscribe("TIBRV.VC.REPLY").await.unwrap();

        let mut request = Message::to_subject("TIBRV.VC.WORK").with_reply_subject("TIBRV.VC.REPLY");
        request.update_u32("x", 2);
        client.send(request).await.unwrap();

        let received = work.recv().await.unwrap();
        assert_eq!(received.get_u32("x"), Some(2));

        let mut reply = Message::new();
        reply.update_u32("sum", 5);
        server.send_reply(reply, &received).await.unwrap();
        assert_eq!(replies.recv().await.unwrap().get_u32("sum"), Some(5));
    }

    #[tokio::test]
    async fn test_close_notifies_peer() {
        let bus = MemoryBus::new("test");
        let (client, server) = connected_pair(&bus).await;
        let mut advisories = client.subscribe(VC_DISCONNECTED_ADVISORY).await.unwrap();

        server.close().await.unwrap();
        server.close().await.unwrap();

        let advisory = tokio::time::timeout(Duration::from_secs(1), advisories.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(advisory.send_subject(), Some(VC_DISCONNECTED_INFO));
        assert_eq!(client.state(), VcState::Disconnected);
        assert!(matches!(
            client.send(Message::to_subject("TIBRV.VC.WORK")).await,
            Err(BusError::Disconnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_connected_times_out_without_acceptor() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new("test"));
        let client = VirtualCircuit::connect(bus, "_INBOX.nobody").await.unwrap();

        let result = client.await_connected(Duration::from_secs(20)).await;
        assert!(matches!(result, Err(ref e) if e.is_timeout()));
        assert_eq!(client.state(), VcState::Waiting);
    }

    #[tokio::test]
    async fn test_send_before_connect_is_rejected() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new("test"));
        let client = VirtualCircuit::connect(bus, "_INBOX.nobody").await.unwrap();

        assert!(matches!(
            client.send(Message::to_subject("TIBRV.VC.WORK")).await,
            Err(BusError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_accept_rejects_malformed_request() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new("test"));
        let acceptor = VcAcceptor::create(bus);

        let mut request = Message::to_subject(acceptor.connect_subject());
        request.update_string(OP_FIELD, OP_CONNECT);
        assert!(acceptor.accept(&request).await.is_err());
        assert!(acceptor.accept(&Message::new()).await.is_err());
    }
}

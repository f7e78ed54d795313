//! Routing daemon
//!
//! Accepts bus client connections and forwards every published message to the
//! matching subscriptions of all connections in the same transport domain,
//! including the publisher's own.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::errors::{BusError, BusResult};
use crate::message::Message;
use crate::net::codec::{read_frame, write_frame, Frame};
use crate::net::domain_of;
use crate::subject;

type ConnectionId = u64;
type RouteKey = (ConnectionId, u64);

struct Route {
    domain: Arc<str>,
    pattern: String,
    outbound: mpsc::UnboundedSender<Frame>,
}

type RouteTable = Arc<DashMap<RouteKey, Route>>;

pub struct Daemon {
    listener: TcpListener,
    routes: RouteTable,
}

impl Daemon {
    pub async fn bind(addr: &str) -> BusResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Daemon listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            routes: Arc::new(DashMap::new()),
        })
    }

    pub fn local_addr(&self) -> BusResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the process ends
    pub async fn run(self) -> BusResult<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then drop every connection
    pub async fn run_until<F>(self, shutdown: F) -> BusResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();
        let mut next_connection: ConnectionId = 0;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Daemon shutting down with {} connection(s)", connections.len());
                    connections.shutdown().await;
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Daemon failed to accept a connection: {}", e);
                            continue;
                        }
                    };
                    next_connection += 1;
                    let connection = next_connection;
                    let routes = Arc::clone(&self.routes);
                    connections.spawn(async move {
                        debug!("Connection {} from {}", connection, peer);
                        if let Err(e) = serve_connection(connection, stream, routes).await {
                            warn!("Connection {} from {} failed: {}", connection, peer, e);
                        }
                        debug!("Connection {} from {} closed", connection, peer);
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    }
}

async fn serve_connection(
    connection: ConnectionId,
    stream: TcpStream,
    routes: RouteTable,
) -> BusResult<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    let domain: Arc<str> = match read_frame(&mut reader).await? {
        Some(Frame::Hello {
            service,
            network,
            description,
        }) => {
            let domain = domain_of(&service, &network);
            info!(
                "Connection {} joined domain {} ({})",
                connection, domain, description
            );
            Arc::from(domain)
        }
        Some(other) => {
            return Err(BusError::protocol(format!(
                "expected hello, got {}",
                other.kind()
            )))
        }
        None => return Ok(()),
    };

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!("Connection {} write failed: {}", connection, e);
                break;
            }
        }
    });
    let _guard = ConnectionGuard {
        connection,
        routes: Arc::clone(&routes),
        writer: writer_task,
    };

    let result: BusResult<()> = async {
        loop {
            match read_frame(&mut reader).await? {
                None => return Ok(()),
                Some(Frame::Subscribe { id, subject }) => {
                    if let Err(e) = subject::validate(&subject) {
                        warn!("Connection {} refused subscription: {}", connection, e);
                        continue;
                    }
                    routes.insert(
                        (connection, id),
                        Route {
                            domain: Arc::clone(&domain),
                            pattern: subject,
                            outbound: outbound.clone(),
                        },
                    );
                    let _ = outbound.send(Frame::Subscribed { id });
                }
                Some(Frame::Unsubscribe { id }) => {
                    routes.remove(&(connection, id));
                }
                Some(Frame::Publish(message)) => {
                    let delivered = route_message(&routes, &domain, &message);
                    debug!(
                        "Connection {} published {:?} to {} route(s)",
                        connection,
                        message.send_subject(),
                        delivered
                    );
                }
                Some(other) => {
                    return Err(BusError::protocol(format!(
                        "unexpected {} frame from client",
                        other.kind()
                    )))
                }
            }
        }
    }
    .await;

    result
}

/// Drops a connection's routes and writer however its task ends
struct ConnectionGuard {
    connection: ConnectionId,
    routes: RouteTable,
    writer: JoinHandle<()>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.writer.abort();
        let connection = self.connection;
        self.routes.retain(|(owner, _), _| *owner != connection);
    }
}

fn route_message(routes: &RouteTable, domain: &str, message: &Message) -> usize {
    let Some(send_subject) = message.send_subject() else {
        return 0;
    };
    if subject::validate_send(send_subject).is_err() {
        return 0;
    }

    let mut delivered = 0;
    for entry in routes.iter() {
        let (_, id) = *entry.key();
        let route = entry.value();
        if &*route.domain == domain && subject::matches(&route.pattern, send_subject) {
            let frame = Frame::Deliver {
                id,
                message: message.clone(),
            };
            if route.outbound.send(frame).is_ok() {
                delivered += 1;
            }
        }
    }
    delivered
}

//! Bus client connected to a routing daemon

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{Bus, Subscription};
use crate::errors::{BusError, BusResult};
use crate::message::Message;
use crate::net::codec::{read_frame, write_frame, Frame};
use crate::net::TransportParams;
use crate::subject;

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Work queued for the writer task
enum Outbound {
    Frame(Frame),
    /// Acknowledged once every frame queued before it has been written
    Flush(oneshot::Sender<()>),
}

type Routes = Arc<DashMap<u64, mpsc::UnboundedSender<Message>>>;
type PendingAcks = Arc<DashMap<u64, oneshot::Sender<()>>>;

/// `Bus` implementation speaking the frame protocol to a daemon
pub struct TcpBus {
    params: TransportParams,
    description: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    routes: Routes,
    pending: PendingAcks,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl TcpBus {
    /// Connect to the daemon named in `params` and join its domain
    pub async fn connect(params: TransportParams, description: &str) -> BusResult<Self> {
        let stream = TcpStream::connect(&params.daemon).await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        write_frame(
            &mut writer,
            &Frame::Hello {
                service: params.service.clone(),
                network: params.network.clone(),
                description: description.to_string(),
            },
        )
        .await?;

        let connected = Arc::new(AtomicBool::new(true));
        // The writer outlives the bus handle and exits once every sender is
        // gone, so frames accepted by `publish` are still written after drop.
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let writer_connected = Arc::clone(&connected);
        tokio::spawn(async move {
            while let Some(work) = outbound_rx.recv().await {
                match work {
                    Outbound::Frame(frame) => {
                        if let Err(e) = write_frame(&mut writer, &frame).await {
                            warn!("Bus connection write failed: {}", e);
                            writer_connected.store(false, Ordering::Release);
                            break;
                        }
                    }
                    Outbound::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        let routes: Routes = Arc::new(DashMap::new());
        let pending: PendingAcks = Arc::new(DashMap::new());
        let reader_routes = Arc::clone(&routes);
        let reader_pending = Arc::clone(&pending);
        let reader_connected = Arc::clone(&connected);
        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(Frame::Deliver { id, message })) => {
                        if let Some(route) = reader_routes.get(&id) {
                            let _ = route.send(message);
                        }
                    }
                    Ok(Some(Frame::Subscribed { id })) => {
                        if let Some((_, ack)) = reader_pending.remove(&id) {
                            let _ = ack.send(());
                        }
                    }
                    Ok(Some(other)) => {
                        debug!("Bus connection ignored {} frame", other.kind());
                    }
                    Ok(None) => {
                        info!("Daemon closed the bus connection");
                        break;
                    }
                    Err(e) => {
                        warn!("Bus connection read failed: {}", e);
                        break;
                    }
                }
            }
            // wake every subscriber with end of stream
            reader_connected.store(false, Ordering::Release);
            reader_routes.clear();
            reader_pending.clear();
        });

        info!(
            "Connected to daemon {} in domain {}",
            params.daemon,
            params.domain()
        );
        Ok(Self {
            params,
            description: description.to_string(),
            outbound,
            routes,
            pending,
            next_id: AtomicU64::new(1),
            connected,
            reader,
        })
    }

    pub fn params(&self) -> &TransportParams {
        &self.params
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Wait until every frame accepted so far has been written to the daemon
    pub async fn flush(&self) -> BusResult<()> {
        let (done, written) = oneshot::channel();
        self.outbound
            .send(Outbound::Flush(done))
            .map_err(|_| BusError::Closed)?;
        match tokio::time::timeout(FLUSH_TIMEOUT, written).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => Err(BusError::timeout(FLUSH_TIMEOUT)),
        }
    }

    /// Flush outstanding frames and refuse further publishes
    pub async fn close(&self) -> BusResult<()> {
        let flushed = self.flush().await;
        self.connected.store(false, Ordering::Release);
        debug!("Closed bus connection to {}", self.params.daemon);
        flushed
    }
}

impl Drop for TcpBus {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl Bus for TcpBus {
    async fn publish(&self, message: Message) -> BusResult<()> {
        let send_subject = message.send_subject().ok_or(BusError::MissingSubject)?;
        subject::validate_send(send_subject)?;
        if !self.is_connected() {
            return Err(BusError::Closed);
        }
        self.outbound
            .send(Outbound::Frame(Frame::Publish(message)))
            .map_err(|_| BusError::Closed)
    }

    /// Returns once the daemon has installed the route
    async fn subscribe(&self, subject: &str) -> BusResult<Subscription> {
        subject::validate(subject)?;
        if !self.is_connected() {
            return Err(BusError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.routes.insert(id, sender);
        self.pending.insert(id, ack_tx);

        let outbound = self.outbound.clone();
        let routes = Arc::clone(&self.routes);
        let subscription = Subscription::new(subject.to_string(), receiver, move || {
            routes.remove(&id);
            let _ = outbound.send(Outbound::Frame(Frame::Unsubscribe { id }));
        });

        let frame = Frame::Subscribe {
            id,
            subject: subject.to_string(),
        };
        if self.outbound.send(Outbound::Frame(frame)).is_err() {
            self.pending.remove(&id);
            return Err(BusError::Closed);
        }

        match tokio::time::timeout(SUBSCRIBE_TIMEOUT, ack_rx).await {
            Ok(Ok(())) => Ok(subscription),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                Err(BusError::timeout(SUBSCRIBE_TIMEOUT))
            }
        }
    }

    fn description(&self) -> String {
        format!(
            "{} on daemon {} (domain {})",
            self.description,
            self.params.daemon,
            self.params.domain()
        )
    }
}

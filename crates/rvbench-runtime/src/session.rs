//! Session establishment
//!
//! Turns a located server address into the channel requests travel on:
//! the shared bus plus a private inbox in direct mode, or a connected virtual
//! circuit.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use rvbench_core::subject::{VC_DISCONNECTED_ADVISORY, VC_REQUEST_SUBJECT, VC_RESPONSE_SUBJECT};
use rvbench_core::{Bus, BusResult, Subscription, VcState, VirtualCircuit};

use crate::config::SessionMode;
use crate::discovery::Located;
use crate::error::{RunError, RunResult};

/// Channel used for point-to-point traffic with one server
pub enum Session {
    Direct {
        bus: Arc<dyn Bus>,
        inbox: String,
        peer: String,
    },
    Circuit {
        circuit: Arc<VirtualCircuit>,
    },
}

impl Session {
    pub fn mode(&self) -> SessionMode {
        match self {
            Session::Direct { .. } => SessionMode::Direct,
            Session::Circuit { .. } => SessionMode::Circuit,
        }
    }

    /// Bus requests are published on and responses arrive from
    pub fn channel(&self) -> Arc<dyn Bus> {
        match self {
            Session::Direct { bus, .. } => Arc::clone(bus),
            Session::Circuit { circuit } => Arc::clone(circuit) as Arc<dyn Bus>,
        }
    }

    /// Subject requests are addressed to
    pub fn request_subject(&self) -> &str {
        match self {
            Session::Direct { peer, .. } => peer,
            Session::Circuit { .. } => VC_REQUEST_SUBJECT,
        }
    }

    /// Subject responses come back on
    pub fn reply_subject(&self) -> &str {
        match self {
            Session::Direct { inbox, .. } => inbox,
            Session::Circuit { .. } => VC_RESPONSE_SUBJECT,
        }
    }

    pub async fn subscribe_responses(&self) -> BusResult<Subscription> {
        self.channel().subscribe(self.reply_subject()).await
    }

    /// Disconnect advisories; direct sessions have none
    pub async fn subscribe_disconnects(&self) -> BusResult<Option<Subscription>> {
        match self {
            Session::Direct { .. } => Ok(None),
            Session::Circuit { circuit } => {
                circuit.subscribe(VC_DISCONNECTED_ADVISORY).await.map(Some)
            }
        }
    }

    pub fn vc_state(&self) -> Option<VcState> {
        match self {
            Session::Direct { .. } => None,
            Session::Circuit { circuit } => Some(circuit.state()),
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.vc_state() == Some(VcState::Disconnected)
    }

    /// Tear the session down; safe to call more than once
    pub async fn close(&self) {
        if let Session::Circuit { circuit } = self {
            if let Err(e) = circuit.close().await {
                warn!("Failed to notify server of circuit close: {}", e);
            }
        }
    }
}

pub struct SessionEstablisher {
    bus: Arc<dyn Bus>,
    mode: SessionMode,
    connect_timeout: Duration,
}

impl SessionEstablisher {
    pub fn new(bus: Arc<dyn Bus>, mode: SessionMode, connect_timeout: Duration) -> Self {
        Self {
            bus,
            mode,
            connect_timeout,
        }
    }

    pub async fn establish(&self, located: &Located) -> RunResult<Session> {
        match self.mode {
            SessionMode::Direct => {
                let inbox = self.bus.create_inbox();
                info!("Requests go to {}, replies to {}", located.peer_subject, inbox);
                Ok(Session::Direct {
                    bus: Arc::clone(&self.bus),
                    inbox,
                    peer: located.peer_subject.clone(),
                })
            }
            SessionMode::Circuit => self.connect_circuit(&located.peer_subject).await,
        }
    }

    async fn connect_circuit(&self, connect_subject: &str) -> RunResult<Session> {
        let circuit = VirtualCircuit::connect(Arc::clone(&self.bus), connect_subject)
            .await
            .map_err(|e| RunError::setup("connecting a virtual circuit", e))?;

        match circuit.await_connected(self.connect_timeout).await {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {
                return Err(RunError::vc_connect_timeout(
                    connect_subject,
                    self.connect_timeout,
                ))
            }
            Err(e) => return Err(RunError::setup("connecting a virtual circuit", e)),
        }

        info!("Virtual circuit {} connected to server", circuit.local_inbox());
        Ok(Session::Circuit {
            circuit: Arc::new(circuit),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvbench_core::{MemoryBus, VcAcceptor};

    #[tokio::test]
    async fn test_direct_session_uses_fresh_inbox() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new("test"));
        let located = Located {
            peer_subject: "_INBOX.server".to_string(),
        };
        let session = SessionEstablisher::new(bus, SessionMode::Direct, Duration::from_secs(1))
            .establish(&located)
            .await
            .unwrap();

        assert_eq!(session.request_subject(), "_INBOX.server");
        assert!(session.reply_subject().starts_with("_INBOX."));
        assert!(session.subscribe_disconnects().await.unwrap().is_none());
        assert!(!session.is_disconnected());
    }

    #[tokio::test]
    async fn test_circuit_session_connects() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new("test"));
        let acceptor = VcAcceptor::create(Arc::clone(&bus));
        let mut connects = acceptor.subscribe().await.unwrap();
        let connect_subject = acceptor.connect_subject().to_string();
        let server = tokio::spawn(async move {
            let request = connects.recv().await.unwrap();
            acceptor.accept(&request).await.unwrap()
        });

        let located = Located {
            peer_subject: connect_subject,
        };
        let session = SessionEstablisher::new(bus, SessionMode::Circuit, Duration::from_secs(1))
            .establish(&located)
            .await
            .unwrap();

        assert_eq!(session.vc_state(), Some(VcState::Connected));
        assert_eq!(session.request_subject(), VC_REQUEST_SUBJECT);
        let _server_side = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_circuit_refused_during_handshake_is_setup_failure() {
        let memory = MemoryBus::new("test");
        let mut connects = memory.subscribe("_INBOX.refuser").await.unwrap();
        let refuser = memory.clone();
        tokio::spawn(async move {
            let request = connects.recv().await.unwrap();
            let inbox = request.get_string("inbox").unwrap().to_string();
            let mut refusal = rvbench_core::Message::to_subject(inbox);
            refusal.update_string("op", "disconnect");
            refuser.publish(refusal).await.unwrap();
        });

        let located = Located {
            peer_subject: "_INBOX.refuser".to_string(),
        };
        let result =
            SessionEstablisher::new(Arc::new(memory), SessionMode::Circuit, Duration::from_secs(5))
                .establish(&located)
                .await;
        assert!(matches!(result, Err(RunError::SetupFailure { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_without_acceptor_times_out() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new("test"));
        let located = Located {
            peer_subject: "_INBOX.gone".to_string(),
        };
        let result = SessionEstablisher::new(bus, SessionMode::Circuit, Duration::from_secs(20))
            .establish(&located)
            .await;
        assert!(matches!(result, Err(RunError::VcConnectTimeout { .. })));
    }
}

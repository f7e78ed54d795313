//! Self-addressed completion signal
//!
//! Completion is announced by publishing `TEST.COMPLETED` on a process-local
//! bus. The main loop listens for it on its wait queue, so whichever task
//! decides the run is over can unblock the main loop with an ordinary
//! message.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use rvbench_core::subject::COMPLETION_SUBJECT;
use rvbench_core::{Bus, BusResult, MemoryBus, Message, Subscription};

#[derive(Clone)]
pub struct CompletionSignal {
    bus: MemoryBus,
    fired: Arc<AtomicBool>,
}

impl CompletionSignal {
    pub fn new(bus: MemoryBus) -> Self {
        Self {
            bus,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Listen for the signal
    pub async fn subscribe(&self) -> BusResult<Subscription> {
        self.bus.subscribe(COMPLETION_SUBJECT).await
    }

    /// Fire once; later calls return false and publish nothing
    pub fn signal(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        match self.bus.deliver(&Message::to_subject(COMPLETION_SUBJECT)) {
            Ok(listeners) => debug!("Completion signalled to {} listener(s)", listeners),
            Err(e) => warn!("Failed to publish completion signal: {}", e),
        }
        true
    }

    pub fn is_signalled(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_fires_once() {
        let signal = CompletionSignal::new(MemoryBus::new("process"));
        let mut listener = signal.subscribe().await.unwrap();

        assert!(signal.signal());
        assert!(!signal.clone().signal());
        assert!(signal.is_signalled());

        assert!(listener.try_recv().is_some());
        assert!(listener.try_recv().is_none());
    }
}

//! Liveness monitor
//!
//! A recurring tick compares the response count with the one seen at the
//! previous tick. Progress moves the baseline; no progress ends the run as
//! timed out. Once the run is over for any reason the monitor retires.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::completion::CompletionSignal;
use crate::counters::{OutcomeCell, Progress, RunCounters, RunOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessVerdict {
    /// Responses moved since the last tick
    Alive,
    /// The run already ended; cancel the timer
    Retire,
    /// No progress; the run has timed out
    Stalled,
}

pub struct LivenessMonitor {
    counters: Arc<RunCounters>,
    outcome: Arc<OutcomeCell>,
    completion: CompletionSignal,
    period: Duration,
}

impl LivenessMonitor {
    pub fn new(
        counters: Arc<RunCounters>,
        outcome: Arc<OutcomeCell>,
        completion: CompletionSignal,
        period: Duration,
    ) -> Self {
        Self {
            counters,
            outcome,
            completion,
            period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn on_tick(&self) -> LivenessVerdict {
        if self.outcome.is_decided() || self.counters.is_complete() {
            return LivenessVerdict::Retire;
        }

        match self.counters.tick() {
            Progress::Advanced { responses } => {
                debug!("Liveness check: {} responses so far", responses);
                LivenessVerdict::Alive
            }
            Progress::Stalled { responses } => {
                if self.outcome.decide(RunOutcome::TimedOut) {
                    warn!(
                        "No responses for {:?}: {} of {} received, {} sent",
                        self.period,
                        responses,
                        self.counters.requested(),
                        self.counters.sent()
                    );
                    self.completion.signal();
                    LivenessVerdict::Stalled
                } else {
                    LivenessVerdict::Retire
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvbench_core::MemoryBus;

    fn monitor(requested: u32) -> (LivenessMonitor, Arc<RunCounters>, Arc<OutcomeCell>) {
        let counters = Arc::new(RunCounters::new(requested));
        let outcome = Arc::new(OutcomeCell::new());
        let monitor = LivenessMonitor::new(
            Arc::clone(&counters),
            Arc::clone(&outcome),
            CompletionSignal::new(MemoryBus::new("process")),
            Duration::from_secs(5),
        );
        (monitor, counters, outcome)
    }

    #[tokio::test]
    async fn test_progress_keeps_run_alive() {
        let (monitor, counters, outcome) = monitor(10);
        counters.claim_send();
        counters.record_response();

        assert_eq!(monitor.on_tick(), LivenessVerdict::Alive);
        assert_eq!(monitor.on_tick(), LivenessVerdict::Stalled);
        assert_eq!(outcome.get(), Some(RunOutcome::TimedOut));
        assert_eq!(monitor.on_tick(), LivenessVerdict::Retire);
    }

    #[tokio::test]
    async fn test_silent_peer_stalls_on_first_tick() {
        let (monitor, counters, _) = monitor(100);
        counters.claim_send();
        assert_eq!(monitor.on_tick(), LivenessVerdict::Stalled);
    }

    #[tokio::test]
    async fn test_finished_run_retires_monitor() {
        let (monitor, _, outcome) = monitor(10);
        outcome.decide(RunOutcome::Disconnected);
        assert_eq!(monitor.on_tick(), LivenessVerdict::Retire);
        assert_eq!(outcome.get(), Some(RunOutcome::Disconnected));
    }
}

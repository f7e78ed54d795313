//! Response correlation

use std::sync::Arc;

use tracing::{debug, info};

use rvbench_core::Message;

use crate::completion::CompletionSignal;
use crate::counters::{OutcomeCell, RunCounters, RunOutcome};
use crate::pacer::StatusReporter;

/// What one inbound response did to the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    Counted(u32),
    /// This response completed the run
    Complete(u32),
    /// Late or excess response, not counted
    Ignored,
}

pub struct Correlator {
    counters: Arc<RunCounters>,
    outcome: Arc<OutcomeCell>,
    completion: CompletionSignal,
    status: StatusReporter,
}

impl Correlator {
    pub fn new(
        counters: Arc<RunCounters>,
        outcome: Arc<OutcomeCell>,
        completion: CompletionSignal,
        status: StatusReporter,
    ) -> Self {
        Self {
            counters,
            outcome,
            completion,
            status,
        }
    }

    /// Whether the run has reached its outcome, by this correlator or not
    pub fn is_settled(&self) -> bool {
        self.outcome.is_decided()
    }

    pub fn on_response(&self, message: &Message) -> Correlation {
        if let Some(outcome) = self.outcome.get() {
            debug!("Ignored response after the run was {}: {}", outcome, message);
            return Correlation::Ignored;
        }

        let Some(responses) = self.counters.record_response() else {
            debug!("Ignored response beyond the requests sent: {}", message);
            return Correlation::Ignored;
        };
        self.status.received(&self.counters);

        if responses < self.counters.requested() {
            return Correlation::Counted(responses);
        }
        if self.outcome.decide(RunOutcome::Completed) {
            info!("Received all {} server replies", responses);
            self.completion.signal();
        }
        Correlation::Complete(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvbench_core::MemoryBus;

    fn correlator(requested: u32) -> (Correlator, Arc<RunCounters>, Arc<OutcomeCell>, CompletionSignal) {
        let counters = Arc::new(RunCounters::new(requested));
        let outcome = Arc::new(OutcomeCell::new());
        let completion = CompletionSignal::new(MemoryBus::new("process"));
        let correlator = Correlator::new(
            Arc::clone(&counters),
            Arc::clone(&outcome),
            completion.clone(),
            StatusReporter::new(0),
        );
        (correlator, counters, outcome, completion)
    }

    #[tokio::test]
    async fn test_last_response_completes() {
        let (correlator, counters, outcome, completion) = correlator(2);
        counters.claim_send();
        counters.claim_send();

        assert_eq!(correlator.on_response(&Message::new()), Correlation::Counted(1));
        assert_eq!(correlator.on_response(&Message::new()), Correlation::Complete(2));
        assert_eq!(outcome.get(), Some(RunOutcome::Completed));
        assert!(completion.is_signalled());
        assert_eq!(correlator.on_response(&Message::new()), Correlation::Ignored);
    }

    #[tokio::test]
    async fn test_responses_after_timeout_are_ignored() {
        let (correlator, counters, outcome, completion) = correlator(2);
        counters.claim_send();
        outcome.decide(RunOutcome::TimedOut);

        assert_eq!(correlator.on_response(&Message::new()), Correlation::Ignored);
        assert_eq!(counters.responses(), 0);
        assert!(!completion.is_signalled());
    }

    #[tokio::test]
    async fn test_stray_response_is_not_counted() {
        let (correlator, counters, _, _) = correlator(5);
        assert_eq!(correlator.on_response(&Message::new()), Correlation::Ignored);
        assert_eq!(counters.responses(), 0);
    }
}

//! Final run report

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::config::SessionMode;
use crate::counters::{CounterSnapshot, RunOutcome};
use crate::error::RunError;

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub mode: SessionMode,
    pub outcome: RunOutcome,
    pub server: String,
    pub requested: u32,
    pub sent: u32,
    pub responses: u32,
    /// Responses already in when the last request went out
    pub responses_while_sending: Option<u32>,
    pub elapsed_secs: f64,
    /// How long the liveness monitor waited between checks
    #[serde(skip)]
    pub liveness_period: Duration,
}

impl RunReport {
    pub fn new(
        mode: SessionMode,
        outcome: RunOutcome,
        server: String,
        counters: CounterSnapshot,
        elapsed: Duration,
    ) -> Self {
        Self {
            mode,
            outcome,
            server,
            requested: counters.requested,
            sent: counters.sent,
            responses: counters.responses,
            responses_while_sending: None,
            elapsed_secs: elapsed.as_secs_f64(),
            liveness_period: Duration::ZERO,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.responses >= self.requested
    }

    /// Request/reply pairs per second over the measured interval
    pub fn rate(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            f64::from(self.responses) / self.elapsed_secs
        } else {
            0.0
        }
    }

    /// Zero only when every requested response arrived
    pub fn exit_code(&self) -> i32 {
        if self.outcome != RunOutcome::SendError && self.is_complete() {
            0
        } else {
            1
        }
    }

    /// The graceful failure this report represents, if any
    pub fn failure(&self) -> Option<RunError> {
        if self.is_complete() {
            return None;
        }
        match self.outcome {
            RunOutcome::TimedOut => Some(RunError::LivenessTimeout {
                idle_ms: self.liveness_period.as_millis() as u64,
                responses: self.responses,
                requested: self.requested,
            }),
            RunOutcome::Disconnected => Some(RunError::Disconnected {
                sent: self.sent,
                responses: self.responses,
            }),
            RunOutcome::Completed | RunOutcome::SendError => None,
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(responses) = self.responses_while_sending {
            writeln!(
                f,
                "{} responses received while sending {} requests.",
                responses, self.sent
            )?;
        }

        if self.is_complete() {
            writeln!(f, "received all {} server replies", self.responses)?;
            writeln!(
                f,
                "{} requests took {:.2} secs to process.",
                self.requested, self.elapsed_secs
            )?;
            write!(
                f,
                "This result implies an effective rate of {:.1} requests/second.",
                self.rate()
            )
        } else {
            write!(
                f,
                "Received {} responses to {} requests ({}).",
                self.responses, self.requested, self.outcome
            )
        }
    }
}

//! Shared run counters and the single terminal outcome
//!
//! The pacer, the response correlator and the liveness monitor all run on
//! different tasks. They share one `RunCounters`, whose updates are atomic
//! and enforce `responses <= sent <= requested`, and one `OutcomeCell`, which
//! accepts exactly one terminal outcome.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use serde::Serialize;
use tokio::time::Instant;

// ----------------------------------------------------------------------------
// Counters
// ----------------------------------------------------------------------------

/// Point-in-time view of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub requested: u32,
    pub sent: u32,
    pub responses: u32,
}

/// What the liveness monitor saw since its previous tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Advanced { responses: u32 },
    Stalled { responses: u32 },
}

#[derive(Debug)]
pub struct RunCounters {
    requested: u32,
    sent: AtomicU32,
    responses: AtomicU32,
    baseline: AtomicU32,
}

impl RunCounters {
    pub fn new(requested: u32) -> Self {
        Self {
            requested,
            sent: AtomicU32::new(0),
            responses: AtomicU32::new(0),
            baseline: AtomicU32::new(0),
        }
    }

    pub fn requested(&self) -> u32 {
        self.requested
    }

    pub fn sent(&self) -> u32 {
        self.sent.load(Ordering::Acquire)
    }

    pub fn responses(&self) -> u32 {
        self.responses.load(Ordering::Acquire)
    }

    /// Claim the next request slot before sending it
    ///
    /// Returns the 1-based sequence number, or `None` once every requested
    /// slot has been claimed.
    pub fn claim_send(&self) -> Option<u32> {
        let requested = self.requested;
        self.sent
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |sent| {
                (sent < requested).then_some(sent + 1)
            })
            .ok()
            .map(|previous| previous + 1)
    }

    /// Give back a claimed slot whose send failed
    pub fn release_send(&self) {
        let _ = self
            .sent
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |sent| {
                let responses = self.responses.load(Ordering::Acquire);
                (sent > responses).then(|| sent - 1)
            });
    }

    /// Count one response; `None` if it would outrun the requests sent
    pub fn record_response(&self) -> Option<u32> {
        self.responses
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |responses| {
                (responses < self.sent.load(Ordering::Acquire)).then_some(responses + 1)
            })
            .ok()
            .map(|previous| previous + 1)
    }

    pub fn all_sent(&self) -> bool {
        self.sent() >= self.requested
    }

    pub fn is_complete(&self) -> bool {
        self.responses() >= self.requested
    }

    /// Compare responses with the previous tick and move the baseline
    pub fn tick(&self) -> Progress {
        let responses = self.responses();
        let previous = self.baseline.swap(responses, Ordering::AcqRel);
        if responses == previous {
            Progress::Stalled { responses }
        } else {
            Progress::Advanced { responses }
        }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        // responses first: sent only grows, so the pair stays ordered
        let responses = self.responses();
        let sent = self.sent();
        CounterSnapshot {
            requested: self.requested,
            sent,
            responses,
        }
    }
}

// ----------------------------------------------------------------------------
// Outcome
// ----------------------------------------------------------------------------

/// Terminal state of a client run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunOutcome {
    Completed,
    TimedOut,
    Disconnected,
    SendError,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::TimedOut => "timed-out",
            RunOutcome::Disconnected => "disconnected",
            RunOutcome::SendError => "send-error",
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write-once holder for the run outcome and when it was reached
#[derive(Debug, Default)]
pub struct OutcomeCell {
    decided: OnceLock<(RunOutcome, Instant)>,
}

impl OutcomeCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `outcome` unless another one was recorded first
    pub fn decide(&self, outcome: RunOutcome) -> bool {
        self.decided.set((outcome, Instant::now())).is_ok()
    }

    pub fn get(&self) -> Option<RunOutcome> {
        self.decided.get().map(|(outcome, _)| *outcome)
    }

    pub fn decided_at(&self) -> Option<Instant> {
        self.decided.get().map(|(_, at)| *at)
    }

    pub fn is_decided(&self) -> bool {
        self.decided.get().is_some()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

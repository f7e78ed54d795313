//! rvbench load-test engine
//!
//! Drives one request/response run against a server found by discovery:
//! session establishment in direct or virtual circuit mode, paced sending,
//! response correlation, liveness checking and the final report. The echo
//! server the runs are measured against lives here too.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod client;
pub mod completion;
pub mod config;
pub mod correlator;
pub mod counters;
pub mod discovery;
pub mod error;
pub mod liveness;
pub mod pacer;
pub mod report;
pub mod server;
pub mod session;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use client::ClientRun;
pub use completion::CompletionSignal;
pub use config::{ClientConfig, PayloadMode, ServerConfig, SessionMode};
pub use correlator::{Correlation, Correlator};
pub use counters::{CounterSnapshot, OutcomeCell, Progress, RunCounters, RunOutcome};
pub use discovery::{Discovery, Located};
pub use error::{RunError, RunResult};
pub use liveness::{LivenessMonitor, LivenessVerdict};
pub use pacer::{Pacer, RequestBuilder, StatusReporter};
pub use report::RunReport;
pub use server::{EchoServer, ServerStats, StopReason};
pub use session::{Session, SessionEstablisher};

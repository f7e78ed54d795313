//! Run error taxonomy

use std::time::Duration;

use rvbench_core::BusError;

/// Ways a client or server run can fail
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("No server answered on {subject} within {timeout_ms}ms")]
    DiscoveryTimeout { subject: String, timeout_ms: u64 },

    #[error("Virtual circuit to {connect_subject} was not accepted within {timeout_ms}ms")]
    VcConnectTimeout {
        connect_subject: String,
        timeout_ms: u64,
    },

    #[error("Failed to send request {sequence}: {source}")]
    SendFailure {
        sequence: u32,
        #[source]
        source: BusError,
    },

    #[error("No progress for {idle_ms}ms with {responses} of {requested} responses received")]
    LivenessTimeout {
        idle_ms: u64,
        responses: u32,
        requested: u32,
    },

    #[error("Virtual circuit disconnected after {sent} requests and {responses} responses")]
    Disconnected { sent: u32, responses: u32 },

    #[error("Setup failed while {stage}: {source}")]
    SetupFailure {
        stage: &'static str,
        #[source]
        source: BusError,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

impl RunError {
    pub fn discovery_timeout(subject: &str, timeout: Duration) -> Self {
        RunError::DiscoveryTimeout {
            subject: subject.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn vc_connect_timeout(connect_subject: &str, timeout: Duration) -> Self {
        RunError::VcConnectTimeout {
            connect_subject: connect_subject.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Wrap a bus failure that happened while building the run
    pub fn setup(stage: &'static str, source: BusError) -> Self {
        RunError::SetupFailure { stage, source }
    }

    pub fn invalid_config<R: Into<String>>(reason: R) -> Self {
        RunError::InvalidConfig {
            reason: reason.into(),
        }
    }
}

pub type RunResult<T> = Result<T, RunError>;

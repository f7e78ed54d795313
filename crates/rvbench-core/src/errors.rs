//! Error types for the rvbench bus layer
//!
//! `BusError` is the status every bus primitive reports. Virtual circuit state
//! machines report `StateTransitionError` when asked to take an edge they do not
//! have.

use std::fmt;

// ----------------------------------------------------------------------------
// Bus Errors
// ----------------------------------------------------------------------------

/// Status returned by bus primitives that did not complete normally
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("Invalid subject '{subject}': {reason}")]
    InvalidSubject { subject: String, reason: String },

    #[error("Message has no send subject")]
    MissingSubject,

    #[error("Handle or queue has been destroyed")]
    Closed,

    #[error("Virtual circuit is disconnected")]
    Disconnected,

    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("State transition error: {0}")]
    StateTransition(#[from] StateTransitionError),
}

impl BusError {
    /// Create a timeout error from the elapsed bound
    pub fn timeout(duration: std::time::Duration) -> Self {
        BusError::Timeout {
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Create an invalid subject error
    pub fn invalid_subject<S: Into<String>, R: Into<String>>(subject: S, reason: R) -> Self {
        BusError::InvalidSubject {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    /// Create a protocol error with a reason
    pub fn protocol<R: Into<String>>(reason: R) -> Self {
        BusError::Protocol {
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error with a reason
    pub fn invalid_argument<R: Into<String>>(reason: R) -> Self {
        BusError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Whether this status is a bounded wait running out
    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout { .. })
    }
}

// ----------------------------------------------------------------------------
// State Transition Errors
// ----------------------------------------------------------------------------

/// Errors raised by the virtual circuit lifecycle state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateTransitionError {
    /// Invalid state transition attempted
    InvalidTransition {
        from_state: &'static str,
        event: &'static str,
    },
}

impl fmt::Display for StateTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateTransitionError::InvalidTransition { from_state, event } => {
                write!(f, "Invalid transition from {} on event {}", from_state, event)
            }
        }
    }
}

impl std::error::Error for StateTransitionError {}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type BusResult<T> = Result<T, BusError>;

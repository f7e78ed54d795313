//! Client and server run settings

use std::time::Duration;

use serde::{Deserialize, Serialize};

use rvbench_core::subject::{LOCATE_SUBJECT, VC_LOCATE_SUBJECT};

use crate::error::{RunError, RunResult};

pub const DEFAULT_REQUESTS: u32 = 10_000;
pub const DEFAULT_DIRECT_SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CIRCUIT_SEARCH_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_VC_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_SERVER_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

// ----------------------------------------------------------------------------
// Modes
// ----------------------------------------------------------------------------

/// How the client reaches the server after discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    /// Requests go straight to the server's inbox
    Direct,
    /// Requests travel over a virtual circuit
    Circuit,
}

impl SessionMode {
    /// Well-known subject servers answer for this mode
    pub fn locate_subject(&self) -> &'static str {
        match self {
            SessionMode::Direct => LOCATE_SUBJECT,
            SessionMode::Circuit => VC_LOCATE_SUBJECT,
        }
    }
}

/// How request payload fields are generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadMode {
    /// Fresh pseudo-random `x` and `y` per request
    Random,
    /// `x = sequence`, `y = sequence + 1`
    Counting,
}

// ----------------------------------------------------------------------------
// Client
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub mode: SessionMode,
    pub requests: u32,
    /// Zero sends in a tight loop, otherwise one request per tick
    pub interval: Duration,
    /// Progress line every N sends and every N responses; zero disables
    pub status_every: u32,
    pub search_timeout: Duration,
    pub vc_connect_timeout: Duration,
    /// Main loop gives up after this long, plus one interval, without traffic
    pub request_timeout: Duration,
    pub idle_grace: Duration,
    pub payload: PayloadMode,
    /// Attach `sum = x + y` to each request
    pub checksum: bool,
    /// Mutate and resend one message instead of building a fresh one
    pub reuse_message: bool,
    /// Drain responses on a dedicated worker instead of the main loop
    pub dedicated_dispatcher: bool,
}

impl ClientConfig {
    pub fn direct() -> Self {
        Self {
            mode: SessionMode::Direct,
            requests: DEFAULT_REQUESTS,
            interval: Duration::ZERO,
            status_every: 0,
            search_timeout: DEFAULT_DIRECT_SEARCH_TIMEOUT,
            vc_connect_timeout: DEFAULT_VC_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            idle_grace: DEFAULT_IDLE_GRACE,
            payload: PayloadMode::Random,
            checksum: false,
            reuse_message: false,
            dedicated_dispatcher: true,
        }
    }

    pub fn circuit() -> Self {
        Self {
            mode: SessionMode::Circuit,
            search_timeout: DEFAULT_CIRCUIT_SEARCH_TIMEOUT,
            checksum: true,
            reuse_message: true,
            ..Self::direct()
        }
    }

    pub fn for_mode(mode: SessionMode) -> Self {
        match mode {
            SessionMode::Direct => Self::direct(),
            SessionMode::Circuit => Self::circuit(),
        }
    }

    pub fn with_requests(mut self, requests: u32) -> Self {
        self.requests = requests;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_status_every(mut self, status_every: u32) -> Self {
        self.status_every = status_every;
        self
    }

    pub fn with_search_timeout(mut self, timeout: Duration) -> Self {
        self.search_timeout = timeout;
        self
    }

    pub fn with_vc_connect_timeout(mut self, timeout: Duration) -> Self {
        self.vc_connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_idle_grace(mut self, grace: Duration) -> Self {
        self.idle_grace = grace;
        self
    }

    pub fn with_payload(mut self, payload: PayloadMode) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_checksum(mut self, checksum: bool) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_reuse_message(mut self, reuse: bool) -> Self {
        self.reuse_message = reuse;
        self
    }

    pub fn with_dedicated_dispatcher(mut self, dedicated: bool) -> Self {
        self.dedicated_dispatcher = dedicated;
        self
    }

    /// Liveness monitor period
    pub fn liveness_period(&self) -> Duration {
        self.idle_grace + self.interval
    }

    /// How long the main loop tolerates no send or response activity
    pub fn idle_limit(&self) -> Duration {
        self.request_timeout + self.interval
    }

    pub fn is_timed(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn validate(&self) -> RunResult<()> {
        let invalid = |reason: &str| Err(RunError::invalid_config(reason));
        if self.search_timeout.is_zero() {
            return invalid("search timeout must be greater than 0");
        }
        if self.mode == SessionMode::Circuit && self.vc_connect_timeout.is_zero() {
            return invalid("circuit connect timeout must be greater than 0");
        }
        if self.request_timeout.is_zero() {
            return invalid("request timeout must be greater than 0");
        }
        if self.liveness_period().is_zero() {
            return invalid("idle grace plus interval must be greater than 0");
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::direct()
    }
}

// ----------------------------------------------------------------------------
// Server
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Progress line every N requests; zero disables
    pub status_every: u32,
    /// Exit after this long without any request
    pub idle_timeout: Duration,
    /// Answer in a fresh message rather than the updated request
    pub new_message: bool,
    /// Answer direct-mode locate requests
    pub serve_direct: bool,
    /// Answer circuit locate requests and accept circuits
    pub serve_circuits: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            status_every: 0,
            idle_timeout: DEFAULT_SERVER_IDLE_TIMEOUT,
            new_message: true,
            serve_direct: true,
            serve_circuits: true,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> RunResult<()> {
        if !self.serve_direct && !self.serve_circuits {
            return Err(RunError::invalid_config(
                "server must serve direct requests, circuits or both",
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(RunError::invalid_config(
                "server idle timeout must be greater than 0",
            ));
        }
        Ok(())
    }
}

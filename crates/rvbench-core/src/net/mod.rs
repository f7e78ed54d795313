//! TCP transport: a routing daemon and the bus client that talks to it
//!
//! Clients open one connection to a daemon, introduce themselves with a
//! `Hello` frame and then subscribe and publish over it. The daemon only
//! routes between connections that share a transport domain, the service
//! port plus network they were created with.

mod client;
mod codec;
mod daemon;

use serde::{Deserialize, Serialize};

pub use client::TcpBus;
pub use codec::{read_frame, write_frame, Frame, MAX_FRAME_LEN};
pub use daemon::Daemon;

/// Default daemon listen address
pub const DEFAULT_DAEMON: &str = "127.0.0.1:7500";

/// Default service when none is given
pub const DEFAULT_SERVICE: &str = "7500";

/// Addressing of a transport: which daemon to use and which domain to join
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportParams {
    /// `<port>` or `<port>:<direct-port>`; only the port selects the domain
    pub service: String,
    /// Network interface, part of the domain as given
    pub network: String,
    /// `host:port` of the routing daemon
    pub daemon: String,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE.to_string(),
            network: String::new(),
            daemon: DEFAULT_DAEMON.to_string(),
        }
    }
}

impl TransportParams {
    pub fn new(service: &str, network: &str, daemon: &str) -> Self {
        Self {
            service: service.to_string(),
            network: network.to_string(),
            daemon: daemon.to_string(),
        }
    }

    /// Routing domain this transport joins
    pub fn domain(&self) -> String {
        domain_of(&self.service, &self.network)
    }
}

pub(crate) fn domain_of(service: &str, network: &str) -> String {
    let port = service.split(':').next().unwrap_or_default().trim();
    let port = if port.is_empty() { DEFAULT_SERVICE } else { port };
    format!("{}/{}", port, network.trim())
}

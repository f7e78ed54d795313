//! Server discovery
//!
//! One bounded locate request on a well-known subject. The first server to
//! answer wins; its reply carries the address to use from then on as the
//! reply subject.

use std::time::Duration;

use tracing::{debug, info};

use rvbench_core::{Bus, BusError, Message};

use crate::error::{RunError, RunResult};

/// Address a located server advertised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    /// Request inbox in direct mode, connect subject in circuit mode
    pub peer_subject: String,
}

pub struct Discovery<'a> {
    bus: &'a dyn Bus,
    subject: &'a str,
    timeout: Duration,
}

impl<'a> Discovery<'a> {
    pub fn new(bus: &'a dyn Bus, subject: &'a str, timeout: Duration) -> Self {
        Self {
            bus,
            subject,
            timeout,
        }
    }

    /// Publish one locate request and wait for the first answer
    pub async fn locate(&self) -> RunResult<Located> {
        info!("Searching for a server on subject {}...", self.subject);

        let reply = match self
            .bus
            .send_request(Message::to_subject(self.subject), self.timeout)
            .await
        {
            Ok(reply) => reply,
            Err(e) if e.is_timeout() => {
                return Err(RunError::discovery_timeout(self.subject, self.timeout))
            }
            Err(e) => return Err(RunError::setup("searching for a server", e)),
        };

        let peer_subject = reply
            .reply_subject()
            .map(str::to_string)
            .ok_or_else(|| {
                RunError::setup(
                    "reading the search reply",
                    BusError::protocol("search reply carries no reply subject"),
                )
            })?;
        debug!("Search reply: {}", reply);

        info!("Successfully located a server: {}", peer_subject);
        Ok(Located { peer_subject })
    }
}

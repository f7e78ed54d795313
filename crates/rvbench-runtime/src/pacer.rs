//! Request building and pacing

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use rvbench_core::{Bus, BusError, Message};

use crate::config::{ClientConfig, PayloadMode};
use crate::counters::RunCounters;
use crate::error::{RunError, RunResult};

pub const FIELD_X: &str = "x";
pub const FIELD_Y: &str = "y";
pub const FIELD_SUM: &str = "sum";

const BURST_YIELD_EVERY: u32 = 256;

// ----------------------------------------------------------------------------
// Status Reporting
// ----------------------------------------------------------------------------

/// Emits a progress line every `every` sends or responses
#[derive(Debug, Clone, Copy)]
pub struct StatusReporter {
    every: u32,
}

impl StatusReporter {
    pub fn new(every: u32) -> Self {
        Self { every }
    }

    fn due(&self, count: u32) -> bool {
        self.every > 0 && count > 0 && count % self.every == 0
    }

    pub fn sent(&self, counters: &RunCounters) {
        let snapshot = counters.snapshot();
        if self.due(snapshot.sent) {
            info!(
                "{} requests sent, {} responses received",
                snapshot.sent, snapshot.responses
            );
        }
    }

    pub fn received(&self, counters: &RunCounters) {
        let snapshot = counters.snapshot();
        if self.due(snapshot.responses) {
            info!("{} server responses received", snapshot.responses);
        }
    }
}

// ----------------------------------------------------------------------------
// Request Builder
// ----------------------------------------------------------------------------

/// Stamps requests with payload and addressing
pub struct RequestBuilder {
    payload: PayloadMode,
    checksum: bool,
    reuse: bool,
    template: Message,
    rng: StdRng,
}

impl RequestBuilder {
    pub fn new(config: &ClientConfig, send_subject: &str, reply_subject: &str) -> Self {
        Self {
            payload: config.payload,
            checksum: config.checksum,
            reuse: config.reuse_message,
            template: Message::to_subject(send_subject).with_reply_subject(reply_subject),
            rng: StdRng::from_entropy(),
        }
    }

    /// Fix the random source, for reproducible payloads
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn values(&mut self, sequence: u32) -> (u32, u32) {
        match self.payload {
            PayloadMode::Random => (self.rng.gen(), self.rng.gen()),
            PayloadMode::Counting => (sequence, sequence.wrapping_add(1)),
        }
    }

    /// Build the request for `sequence`
    pub fn build(&mut self, sequence: u32) -> Message {
        let (x, y) = self.values(sequence);
        let checksum = self.checksum;
        let fill = |request: &mut Message| {
            request.update_u32(FIELD_X, x);
            request.update_u32(FIELD_Y, y);
            if checksum {
                request.update_u32(FIELD_SUM, x.wrapping_add(y));
            }
        };

        if self.reuse {
            fill(&mut self.template);
            self.template.clone()
        } else {
            let mut request = Message::new();
            if let Some(subject) = self.template.send_subject() {
                request.set_send_subject(subject);
            }
            if let Some(subject) = self.template.reply_subject() {
                request.set_reply_subject(subject);
            }
            fill(&mut request);
            request
        }
    }
}

// ----------------------------------------------------------------------------
// Pacer
// ----------------------------------------------------------------------------

/// Sends requests on the session channel, one per call or in a burst
pub struct Pacer {
    channel: Arc<dyn Bus>,
    builder: RequestBuilder,
    counters: Arc<RunCounters>,
    status: StatusReporter,
}

impl Pacer {
    pub fn new(
        channel: Arc<dyn Bus>,
        builder: RequestBuilder,
        counters: Arc<RunCounters>,
        status: StatusReporter,
    ) -> Self {
        Self {
            channel,
            builder,
            counters,
            status,
        }
    }

    /// Send the next request; `None` once every request has been sent
    ///
    /// A circuit that went away mid-send is reported as `Disconnected`, any
    /// other rejection as `SendFailure`.
    pub async fn send_next(&mut self) -> RunResult<Option<u32>> {
        let Some(sequence) = self.counters.claim_send() else {
            return Ok(None);
        };

        let request = self.builder.build(sequence);
        if let Err(source) = self.channel.publish(request).await {
            self.counters.release_send();
            return Err(match source {
                BusError::Disconnected => RunError::Disconnected {
                    sent: self.counters.sent(),
                    responses: self.counters.responses(),
                },
                source => RunError::SendFailure { sequence, source },
            });
        }

        self.status.sent(&self.counters);
        Ok(Some(sequence))
    }

    /// Send back-to-back until done, a send fails, or `stop` says so
    pub async fn burst<F>(&mut self, stop: F) -> RunResult<u32>
    where
        F: Fn() -> bool,
    {
        let mut count = 0;
        while !stop() {
            match self.send_next().await? {
                Some(_) => count += 1,
                None => break,
            }
            if count % BURST_YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }
        Ok(count)
    }

    pub fn counters(&self) -> &RunCounters {
        &self.counters
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

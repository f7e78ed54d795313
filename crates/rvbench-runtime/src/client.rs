//! Client run
//!
//! A run locates a server, opens a session, sends the configured requests
//! either back-to-back or on a timer, and waits until one of the completion
//! paths decides the outcome: every response correlated, the liveness monitor
//! finding no progress, the circuit going away, or a send failing.
//!
//! Responses are counted on a dedicated dispatcher by default so the main
//! task can keep pacing while they arrive. Teardown always runs in the same
//! order: listeners and timers, then the dispatcher, then the queues, and
//! finally the session itself.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use rvbench_core::{
    Bus, BusError, DispatchStatus, Dispatcher, EventHandle, EventHandler, EventKind, EventQueue,
    MemoryBus, QueueControl, QueuedEvent, Subscription,
};

use crate::completion::CompletionSignal;
use crate::config::ClientConfig;
use crate::correlator::{Correlation, Correlator};
use crate::counters::{OutcomeCell, RunCounters, RunOutcome};
use crate::discovery::{Discovery, Located};
use crate::error::{RunError, RunResult};
use crate::liveness::{LivenessMonitor, LivenessVerdict};
use crate::pacer::{Pacer, RequestBuilder, StatusReporter};
use crate::report::RunReport;
use crate::session::{Session, SessionEstablisher};

/// Upper bound on one main-loop wait
const MAIN_LOOP_POLL: Duration = Duration::from_secs(1);

fn setup(stage: &'static str) -> impl Fn(BusError) -> RunError {
    move |e| RunError::setup(stage, e)
}

// ----------------------------------------------------------------------------
// Response Handler
// ----------------------------------------------------------------------------

/// Counts responses and runs the liveness check on the queue it is bound to
struct ResponseHandler {
    responses: EventHandle,
    liveness: EventHandle,
    correlator: Correlator,
    monitor: LivenessMonitor,
}

impl ResponseHandler {
    fn bind(
        queue: &QueueControl,
        responses: Subscription,
        correlator: Correlator,
        monitor: LivenessMonitor,
    ) -> RunResult<Self> {
        let responses = queue
            .listen(responses)
            .map_err(setup("listening for responses"))?;
        let liveness = queue
            .create_timer(monitor.period())
            .map_err(setup("arming the liveness timer"))?;

        Ok(Self {
            responses,
            liveness,
            correlator,
            monitor,
        })
    }

    fn owns(&self, handle: EventHandle) -> bool {
        handle == self.responses || handle == self.liveness
    }

    fn retire(&self, queue: &QueueControl) {
        queue.destroy(self.responses);
        queue.destroy(self.liveness);
    }
}

#[async_trait]
impl EventHandler for ResponseHandler {
    async fn on_event(&mut self, event: QueuedEvent, queue: &QueueControl) -> ControlFlow<()> {
        let finished = match event.kind {
            EventKind::Message(message) if event.handle == self.responses => {
                match self.correlator.on_response(&message) {
                    Correlation::Complete(_) => true,
                    Correlation::Counted(_) => false,
                    Correlation::Ignored => self.correlator.is_settled(),
                }
            }
            EventKind::Timer if event.handle == self.liveness => {
                self.monitor.on_tick() != LivenessVerdict::Alive
            }
            _ => false,
        };

        if finished {
            self.retire(queue);
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

// ----------------------------------------------------------------------------
// Client Run
// ----------------------------------------------------------------------------

/// One discovery, session and request/response cycle against a server
pub struct ClientRun {
    bus: Arc<dyn Bus>,
    config: ClientConfig,
}

impl ClientRun {
    pub fn new(bus: Arc<dyn Bus>, config: ClientConfig) -> Self {
        Self { bus, config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Run to an outcome and report it
    ///
    /// Timeouts and disconnects after the session is up are graceful: they
    /// produce a report whose exit code is non-zero. Setup failures and send
    /// failures are returned as errors.
    pub async fn run(&self) -> RunResult<RunReport> {
        self.config.validate()?;
        info!("Client using {}", self.bus.description());

        let located = Discovery::new(
            self.bus.as_ref(),
            self.config.mode.locate_subject(),
            self.config.search_timeout,
        )
        .locate()
        .await?;

        let session = SessionEstablisher::new(
            Arc::clone(&self.bus),
            self.config.mode,
            self.config.vc_connect_timeout,
        )
        .establish(&located)
        .await?;

        let result = self.drive(&session, &located).await;
        session.close().await;
        result
    }

    async fn drive(&self, session: &Session, located: &Located) -> RunResult<RunReport> {
        let config = &self.config;
        let counters = Arc::new(RunCounters::new(config.requests));
        let outcome = Arc::new(OutcomeCell::new());
        let completion = CompletionSignal::new(MemoryBus::new("process"));
        let status = StatusReporter::new(config.status_every);

        // --- Wait queue: completion signal and circuit advisories ---
        let mut wait_queue = EventQueue::new("main");
        let wait = wait_queue.control();

        let completed = completion
            .subscribe()
            .await
            .and_then(|subscription| wait.listen(subscription))
            .map_err(setup("listening for completion"))?;

        let disconnects = match session
            .subscribe_disconnects()
            .await
            .map_err(setup("listening for disconnects"))?
        {
            Some(subscription) => Some(
                wait.listen(subscription)
                    .map_err(setup("listening for disconnects"))?,
            ),
            None => None,
        };

        // --- Responses and liveness ---
        let responses = session
            .subscribe_responses()
            .await
            .map_err(setup("listening for responses"))?;
        let correlator = Correlator::new(
            Arc::clone(&counters),
            Arc::clone(&outcome),
            completion.clone(),
            status,
        );
        let monitor = LivenessMonitor::new(
            Arc::clone(&counters),
            Arc::clone(&outcome),
            completion.clone(),
            config.liveness_period(),
        );

        let (dispatcher, mut inline) = if config.dedicated_dispatcher {
            let queue = EventQueue::new("responses");
            let handler = ResponseHandler::bind(&queue.control(), responses, correlator, monitor)?;
            (Some(Dispatcher::spawn(queue, handler)), None)
        } else {
            let handler = ResponseHandler::bind(&wait, responses, correlator, monitor)?;
            (None, Some(handler))
        };

        // --- Sending ---
        info!("Starting test...");
        let started = Instant::now();
        if config.requests == 0 && outcome.decide(RunOutcome::Completed) {
            completion.signal();
        }

        let builder = RequestBuilder::new(config, session.request_subject(), session.reply_subject());
        let mut pacer = Pacer::new(session.channel(), builder, Arc::clone(&counters), status);
        let mut while_sending = None;
        let mut failure = None;

        let mut pacer_timer = if config.is_timed() {
            Some(
                wait.create_timer(config.interval)
                    .map_err(setup("arming the pacer"))?,
            )
        } else {
            let stop = || outcome.is_decided() || session.is_disconnected();
            match pacer.burst(stop).await {
                Ok(_) => while_sending = finished_sending(&counters),
                Err(e) => failure = send_failed(e, &outcome, &completion),
            }
            None
        };

        // --- Main loop ---
        let poll = MAIN_LOOP_POLL.min(config.request_timeout);
        let mut last_snapshot = counters.snapshot();
        let mut last_activity = Instant::now();

        while failure.is_none() && !outcome.is_decided() {
            match wait_queue.dispatch(Some(poll)).await {
                DispatchStatus::Closed => break,
                DispatchStatus::Timeout => {}
                DispatchStatus::Event(event) if event.handle == completed => {
                    info!("Test completion message received.");
                }
                DispatchStatus::Event(event) if Some(event.handle) == disconnects => {
                    let snapshot = counters.snapshot();
                    warn!(
                        "Virtual circuit disconnected after {} requests and {} responses",
                        snapshot.sent, snapshot.responses
                    );
                    if outcome.decide(RunOutcome::Disconnected) {
                        completion.signal();
                    }
                }
                DispatchStatus::Event(event) if Some(event.handle) == pacer_timer => {
                    if outcome.is_decided() || session.is_disconnected() {
                        continue;
                    }
                    match pacer.send_next().await {
                        Ok(Some(_)) if counters.all_sent() => {
                            while_sending = finished_sending(&counters);
                            cancel(&wait, &mut pacer_timer);
                        }
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            cancel(&wait, &mut pacer_timer);
                        }
                        Err(e) => {
                            cancel(&wait, &mut pacer_timer);
                            failure = send_failed(e, &outcome, &completion);
                        }
                    }
                }
                DispatchStatus::Event(event) => {
                    if let Some(handler) = inline.as_mut() {
                        if handler.owns(event.handle)
                            && handler.on_event(event, &wait).await.is_break()
                        {
                            inline = None;
                        }
                    }
                }
            }

            let snapshot = counters.snapshot();
            if snapshot != last_snapshot {
                last_snapshot = snapshot;
                last_activity = Instant::now();
            } else if last_activity.elapsed() >= config.idle_limit()
                && outcome.decide(RunOutcome::TimedOut)
            {
                warn!(
                    "No requests or responses for {:?}; giving up",
                    config.idle_limit()
                );
                completion.signal();
            }
        }

        // --- Teardown ---
        cancel(&wait, &mut pacer_timer);
        if let Some(handle) = disconnects {
            wait.destroy(handle);
        }
        wait.destroy(completed);
        if let Some(handler) = inline.take() {
            handler.retire(&wait);
        }
        if let Some(dispatcher) = dispatcher {
            dispatcher.queue().destroy_queue();
            dispatcher.destroy();
            dispatcher.join().await;
        }
        wait.destroy_queue();
        drop(wait_queue);

        if let Some(e) = failure {
            return Err(e);
        }

        outcome.decide(RunOutcome::TimedOut);
        let final_outcome = outcome.get().unwrap_or(RunOutcome::TimedOut);
        let finished_at = outcome.decided_at().unwrap_or_else(Instant::now);
        let elapsed = finished_at.saturating_duration_since(started);

        let mut report = RunReport::new(
            session.mode(),
            final_outcome,
            located.peer_subject.clone(),
            counters.snapshot(),
            elapsed,
        );
        report.responses_while_sending = while_sending;
        report.liveness_period = config.liveness_period();
        debug!("Run finished: {:?}", report);
        Ok(report)
    }
}

fn cancel(queue: &QueueControl, timer: &mut Option<EventHandle>) {
    if let Some(handle) = timer.take() {
        queue.destroy(handle);
    }
}

/// Record how many responses were in when the last request left
fn finished_sending(counters: &RunCounters) -> Option<u32> {
    if !counters.all_sent() {
        return None;
    }
    let snapshot = counters.snapshot();
    info!(
        "{} responses received while sending {} requests.",
        snapshot.responses, snapshot.sent
    );
    Some(snapshot.responses)
}

/// Settle the outcome after a send was rejected
///
/// Returns the error the run should end with, if the rejection is fatal.
fn send_failed(
    e: RunError,
    outcome: &OutcomeCell,
    completion: &CompletionSignal,
) -> Option<RunError> {
    match e {
        RunError::Disconnected { sent, responses } => {
            warn!(
                "Circuit went away while sending: {} sent, {} responses",
                sent, responses
            );
            if outcome.decide(RunOutcome::Disconnected) {
                completion.signal();
            }
            None
        }
        e => {
            error!("{}", e);
            if outcome.decide(RunOutcome::SendError) {
                completion.signal();
            }
            Some(e)
        }
    }
}

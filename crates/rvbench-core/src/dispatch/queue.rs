//! Event queues
//!
//! A queue serialises everything bound to it: listener messages and timer
//! ticks arrive through one channel and are handed out one at a time by
//! `dispatch`. Each binding is a forwarding task registered in the queue's
//! handle table, so destroying a handle stops the task and any event it had
//! already queued is discarded when it reaches the front.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::bus::Subscription;
use crate::dispatch::handle::{EventHandle, HandleTable};
use crate::errors::{BusError, BusResult};
use crate::message::Message;

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// What caused an event
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Message(Message),
    Timer,
}

/// An event together with the listener or timer that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    pub handle: EventHandle,
    pub kind: EventKind,
}

/// Result of one `dispatch` call
#[derive(Debug, PartialEq)]
pub enum DispatchStatus {
    Event(QueuedEvent),
    Timeout,
    Closed,
}

// ----------------------------------------------------------------------------
// Queue Control
// ----------------------------------------------------------------------------

struct QueueShared {
    name: String,
    handles: HandleTable,
    closed: watch::Sender<bool>,
}

/// Cloneable handle for binding to and tearing down a queue
///
/// Handlers receive one of these so they can destroy their own listener or
/// timer from inside a callback.
#[derive(Clone)]
pub struct QueueControl {
    shared: Arc<QueueShared>,
    sender: mpsc::UnboundedSender<QueuedEvent>,
}

impl QueueControl {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Forward every message of `subscription` into this queue
    pub fn listen(&self, mut subscription: Subscription) -> BusResult<EventHandle> {
        let handle = self.shared.handles.insert().ok_or(BusError::Closed)?;
        let sender = self.sender.clone();
        let subject = subscription.subject().to_string();

        let task = tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                let event = QueuedEvent {
                    handle,
                    kind: EventKind::Message(message),
                };
                if sender.send(event).is_err() {
                    break;
                }
            }
        });

        if !self.shared.handles.attach(handle, task.abort_handle()) {
            return Err(BusError::Closed);
        }
        debug!("Queue '{}' listening on {} as {}", self.shared.name, subject, handle);
        Ok(handle)
    }

    /// Deliver a timer event every `period`, first tick one period from now
    pub fn create_timer(&self, period: Duration) -> BusResult<EventHandle> {
        if period.is_zero() {
            return Err(BusError::invalid_argument("timer period must be positive"));
        }
        let handle = self.shared.handles.insert().ok_or(BusError::Closed)?;
        let sender = self.sender.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let event = QueuedEvent {
                    handle,
                    kind: EventKind::Timer,
                };
                if sender.send(event).is_err() {
                    break;
                }
            }
        });

        if !self.shared.handles.attach(handle, task.abort_handle()) {
            return Err(BusError::Closed);
        }
        debug!(
            "Queue '{}' timer {} every {:?}",
            self.shared.name, handle, period
        );
        Ok(handle)
    }

    /// Destroy a listener or timer; false if it was already destroyed
    pub fn destroy(&self, handle: EventHandle) -> bool {
        let removed = self.shared.handles.remove(handle);
        if removed {
            trace!("Queue '{}' destroyed {}", self.shared.name, handle);
        }
        removed
    }

    pub fn is_live(&self, handle: EventHandle) -> bool {
        self.shared.handles.contains(handle)
    }

    /// Revoke every binding and wake any pending `dispatch` with `Closed`
    ///
    /// Returns false if the queue had already been destroyed.
    pub fn destroy_queue(&self) -> bool {
        let first = self.shared.closed.send_if_modified(|closed| {
            let was_closed = *closed;
            *closed = true;
            !was_closed
        });
        if first {
            let revoked = self.shared.handles.close();
            debug!(
                "Queue '{}' destroyed with {} live handle(s)",
                self.shared.name, revoked
            );
        }
        first
    }

    pub fn is_destroyed(&self) -> bool {
        *self.shared.closed.borrow()
    }
}

impl std::fmt::Debug for QueueControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueControl")
            .field("name", &self.shared.name)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Event Queue
// ----------------------------------------------------------------------------

/// Ordered queue of listener and timer events
pub struct EventQueue {
    control: QueueControl,
    receiver: mpsc::UnboundedReceiver<QueuedEvent>,
    closed: watch::Receiver<bool>,
}

impl EventQueue {
    pub fn new(name: &str) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (closed_tx, closed) = watch::channel(false);
        let shared = Arc::new(QueueShared {
            name: name.to_string(),
            handles: HandleTable::new(),
            closed: closed_tx,
        });

        Self {
            control: QueueControl { shared, sender },
            receiver,
            closed,
        }
    }

    pub fn name(&self) -> &str {
        self.control.name()
    }

    pub fn control(&self) -> QueueControl {
        self.control.clone()
    }

    /// Wait for the next live event
    ///
    /// `None` waits without bound. Events whose handle has been destroyed are
    /// skipped. Returns `Closed` as soon as the queue is destroyed.
    pub async fn dispatch(&mut self, timeout: Option<Duration>) -> DispatchStatus {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let closed = *self.closed.borrow_and_update();
            if closed {
                return DispatchStatus::Closed;
            }

            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let event = tokio::select! {
                biased;
                changed = self.closed.changed() => {
                    if changed.is_err() {
                        return DispatchStatus::Closed;
                    }
                    continue;
                }
                event = self.receiver.recv() => match event {
                    Some(event) => event,
                    None => return DispatchStatus::Closed,
                },
                _ = expired => return DispatchStatus::Timeout,
            };

            if self.control.is_live(event.handle) {
                return DispatchStatus::Event(event);
            }
            trace!(
                "Queue '{}' dropped event from destroyed {}",
                self.control.name(),
                event.handle
            );
        }
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.control.destroy_queue();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::memory::MemoryBus;

    fn message_of(status: DispatchStatus) -> Message {
        match status {
            DispatchStatus::Event(QueuedEvent {
                kind: EventKind::Message(message),
                ..
            }) => message,
            other => panic!("expected a message event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_listener_events_arrive_in_order() {
        let bus = MemoryBus::new("test");
        let mut queue = EventQueue::new("responses");
        let handle = queue
            .control()
            .listen(bus.subscribe("A.B").await.unwrap())
            .unwrap();

        for seq in 0..3 {
            let mut message = Message::to_subject("A.B");
            message.update_u32("seq", seq);
            bus.publish(message).await.unwrap();
        }

        for seq in 0..3 {
            let status = queue.dispatch(Some(Duration::from_secs(1))).await;
            assert_eq!(message_of(status).get_u32("seq"), Some(seq));
        }
        assert!(queue.control().is_live(handle));
    }

    #[tokio::test]
    async fn test_destroyed_listener_events_are_dropped() {
        let bus = MemoryBus::new("test");
        let mut queue = EventQueue::new("responses");
        let control = queue.control();
        let handle = control.listen(bus.subscribe("A.B").await.unwrap()).unwrap();

        bus.publish(Message::to_subject("A.B")).await.unwrap();
        bus.publish(Message::to_subject("A.B")).await.unwrap();
        message_of(queue.dispatch(Some(Duration::from_secs(1))).await);

        assert!(control.destroy(handle));
        assert!(!control.destroy(handle));
        assert_eq!(
            queue.dispatch(Some(Duration::from_millis(50))).await,
            DispatchStatus::Timeout
        );
        assert_eq!(bus.route_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_ticks_until_destroyed() {
        let mut queue = EventQueue::new("timers");
        let control = queue.control();
        let timer = control.create_timer(Duration::from_secs(5)).unwrap();

        let started = Instant::now();
        let status = queue.dispatch(None).await;
        assert_eq!(
            status,
            DispatchStatus::Event(QueuedEvent {
                handle: timer,
                kind: EventKind::Timer
            })
        );
        assert!(started.elapsed() >= Duration::from_secs(5));

        control.destroy(timer);
        assert_eq!(
            queue.dispatch(Some(Duration::from_secs(30))).await,
            DispatchStatus::Timeout
        );
    }

    #[tokio::test]
    async fn test_zero_period_timer_is_rejected() {
        let queue = EventQueue::new("timers");
        assert!(matches!(
            queue.control().create_timer(Duration::ZERO),
            Err(BusError::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_destroy_queue_wakes_dispatch() {
        let mut queue = EventQueue::new("wait");
        let control = queue.control();
        let waiter = tokio::spawn(async move { queue.dispatch(None).await });

        tokio::task::yield_now().await;
        assert!(control.destroy_queue());
        assert!(!control.destroy_queue());
        assert_eq!(waiter.await.unwrap(), DispatchStatus::Closed);
    }

    #[tokio::test]
    async fn test_destroyed_queue_refuses_bindings() {
        let bus = MemoryBus::new("test");
        let queue = EventQueue::new("wait");
        let control = queue.control();
        control.destroy_queue();

        assert!(control.is_destroyed());
        assert!(matches!(
            control.listen(bus.subscribe("A.B").await.unwrap()),
            Err(BusError::Closed)
        ));
        assert!(control.create_timer(Duration::from_secs(1)).is_err());
        assert_eq!(bus.route_count(), 0);
    }
}

//! In-process bus
//!
//! Routes live in a shared concurrent map; every clone of a `MemoryBus` sees
//! the same routes. Used as the process-local transport for self-addressed
//! signals and as the bus under test.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;

use crate::bus::{Bus, Subscription};
use crate::errors::{BusError, BusResult};
use crate::message::Message;
use crate::subject;

struct Route {
    pattern: String,
    sender: mpsc::UnboundedSender<Message>,
}

/// Bus whose subscribers all live in this process
#[derive(Clone)]
pub struct MemoryBus {
    name: Arc<str>,
    routes: Arc<DashMap<u64, Route>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryBus {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            routes: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Number of live subscriptions
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Whether any live subscription matches `subject`
    pub fn has_interest(&self, subject: &str) -> bool {
        self.routes
            .iter()
            .any(|route| subject::matches(&route.pattern, subject))
    }

    /// Deliver a message to every matching route; returns the fan-out count
    pub fn deliver(&self, message: &Message) -> BusResult<usize> {
        let send_subject = message.send_subject().ok_or(BusError::MissingSubject)?;
        subject::validate_send(send_subject)?;

        let mut delivered = 0;
        for route in self.routes.iter() {
            if subject::matches(&route.pattern, send_subject)
                && route.sender.send(message.clone()).is_ok()
            {
                delivered += 1;
            }
        }
        trace!("{} delivered {} to {} route(s)", self.name, send_subject, delivered);
        Ok(delivered)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, message: Message) -> BusResult<()> {
        self.deliver(&message).map(|_| ())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<Subscription> {
        subject::validate(subject)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.routes.insert(
            id,
            Route {
                pattern: subject.to_string(),
                sender,
            },
        );

        let routes = Arc::clone(&self.routes);
        Ok(Subscription::new(subject.to_string(), receiver, move || {
            routes.remove(&id);
        }))
    }

    fn description(&self) -> String {
        format!("in-process bus '{}'", self.name)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let bus = MemoryBus::new("test");
        let mut exact = bus.subscribe("TIBRV.LOCATE").await.unwrap();
        let mut wildcard = bus.subscribe("TIBRV.>").await.unwrap();
        let mut other = bus.subscribe("OTHER").await.unwrap();

        assert_ok!(bus.publish(Message::to_subject("TIBRV.LOCATE")).await);

        assert!(exact.try_recv().is_some());
        assert!(wildcard.try_recv().is_some());
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_drop_removes_route() {
        let bus = MemoryBus::new("test");
        let subscription = bus.subscribe("A.B").await.unwrap();
        assert_eq!(bus.route_count(), 1);
        assert!(bus.has_interest("A.B"));

        drop(subscription);
        assert_eq!(bus.route_count(), 0);
        assert_eq!(bus.deliver(&Message::to_subject("A.B")).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = MemoryBus::new("test");
        let mut subscription = bus.subscribe("A.B").await.unwrap();
        subscription.unsubscribe();
        subscription.unsubscribe();

        assert!(!subscription.is_active());
        assert_eq!(bus.route_count(), 0);
        assert!(subscription.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_requires_send_subject() {
        let bus = MemoryBus::new("test");
        assert!(matches!(
            bus.publish(Message::new()).await,
            Err(BusError::MissingSubject)
        ));
        assert_err!(bus.publish(Message::to_subject("A.*")).await);
    }

    #[tokio::test]
    async fn test_send_request_round_trip() {
        let bus = MemoryBus::new("test");
        let mut service = bus.subscribe("SERVICE").await.unwrap();
        let responder = bus.clone();
        tokio::spawn(async move {
            let request = service.recv().await.unwrap();
            let mut reply = Message::new();
            reply.update_u32("ok", 1);
            responder.send_reply(reply, &request).await.unwrap();
        });

        let reply = bus
            .send_request(Message::to_subject("SERVICE"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.get_u32("ok"), Some(1));
        assert_eq!(bus.route_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_request_times_out() {
        let bus = MemoryBus::new("test");
        let result = bus
            .send_request(Message::to_subject("NOBODY"), Duration::from_secs(30))
            .await;

        assert!(matches!(result, Err(ref e) if e.is_timeout()));
        assert_eq!(bus.route_count(), 0);
    }
}

//! Bus abstraction consumed by the harness
//!
//! A `Bus` offers subject-addressed publish, subscribe and a synchronous
//! request primitive. Implementations decide delivery and routing; the harness
//! only relies on per-subscription arrival order.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::{BusError, BusResult};
use crate::message::Message;
use crate::subject;

// ----------------------------------------------------------------------------
// Subscription
// ----------------------------------------------------------------------------

type Unsubscribe = Box<dyn FnOnce() + Send>;

/// A live interest in a subject pattern
///
/// Messages matching the pattern arrive in publish order. Dropping the
/// subscription removes the route from the bus.
pub struct Subscription {
    subject: String,
    receiver: mpsc::UnboundedReceiver<Message>,
    unsubscribe: Option<Unsubscribe>,
}

impl Subscription {
    /// Wrap a receiver together with the action that removes its route
    pub fn new<F>(subject: String, receiver: mpsc::UnboundedReceiver<Message>, unsubscribe: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            subject,
            receiver,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Pattern this subscription was created with
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Wait for the next message; `None` once the route is gone
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Take a message that is already queued, if any
    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }

    /// Remove the route; calling this more than once has no further effect
    pub fn unsubscribe(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
            self.receiver.close();
        }
    }

    pub fn is_active(&self) -> bool {
        self.unsubscribe.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .field("active", &self.is_active())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Bus Trait
// ----------------------------------------------------------------------------

/// Subject-addressed publish/subscribe bus
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a message on its send subject
    async fn publish(&self, message: Message) -> BusResult<()>;

    /// Register interest in a subject pattern
    async fn subscribe(&self, subject: &str) -> BusResult<Subscription>;

    /// Human-readable description of the transport for logging
    fn description(&self) -> String;

    /// Allocate a private, receiver-unique reply address
    fn create_inbox(&self) -> String {
        subject::new_inbox()
    }

    /// Publish `request` with a private reply subject and wait for one reply
    async fn send_request(&self, mut request: Message, timeout: Duration) -> BusResult<Message> {
        let inbox = self.create_inbox();
        let mut replies = self.subscribe(&inbox).await?;
        request.set_reply_subject(inbox);
        self.publish(request).await?;

        let reply = tokio::time::timeout(timeout, replies.recv()).await;
        replies.unsubscribe();
        match reply {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::timeout(timeout)),
        }
    }

    /// Publish `reply` on the reply subject carried by `request`
    async fn send_reply(&self, mut reply: Message, request: &Message) -> BusResult<()> {
        let reply_subject = request.reply_subject().ok_or(BusError::MissingSubject)?;
        reply.set_send_subject(reply_subject);
        self.publish(reply).await
    }
}

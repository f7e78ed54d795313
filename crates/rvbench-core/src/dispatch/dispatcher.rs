//! Dedicated dispatcher worker
//!
//! Drains one queue on its own task so the caller is free to keep pacing or
//! to wait on a different queue.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::dispatch::queue::{DispatchStatus, EventQueue, QueueControl, QueuedEvent};

/// Callback invoked for every live event on a dispatched queue
#[async_trait]
pub trait EventHandler: Send + 'static {
    /// Handle one event; `Break` stops the worker and destroys the queue
    async fn on_event(&mut self, event: QueuedEvent, queue: &QueueControl) -> ControlFlow<()>;
}

/// Background task draining a single queue
pub struct Dispatcher {
    name: String,
    control: QueueControl,
    task: Option<JoinHandle<()>>,
    destroyed: AtomicBool,
}

impl Dispatcher {
    pub fn spawn<H: EventHandler>(mut queue: EventQueue, mut handler: H) -> Self {
        let name = queue.name().to_string();
        let control = queue.control();
        let worker_control = control.clone();
        let worker_name = name.clone();

        let task = tokio::spawn(async move {
            loop {
                match queue.dispatch(None).await {
                    DispatchStatus::Event(event) => {
                        if handler.on_event(event, &worker_control).await.is_break() {
                            worker_control.destroy_queue();
                            break;
                        }
                    }
                    DispatchStatus::Timeout => continue,
                    DispatchStatus::Closed => break,
                }
            }
            debug!("Dispatcher '{}' stopped", worker_name);
        });

        debug!("Dispatcher '{}' started", name);
        Self {
            name,
            control,
            task: Some(task),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Control surface of the queue this worker drains
    pub fn queue(&self) -> &QueueControl {
        &self.control
    }

    /// Stop the worker; false if it had already been destroyed
    pub fn destroy(&self) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(task) = &self.task {
            task.abort();
        }
        debug!("Dispatcher '{}' destroyed", self.name);
        true
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    /// Wait for the worker to stop on its own or after `destroy`
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

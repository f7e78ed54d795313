//! Dispatch runtime: queues, the handle table behind them, and dedicated
//! workers that drain a queue in the background.

mod dispatcher;
mod handle;
mod queue;

pub use dispatcher::{Dispatcher, EventHandler};
pub use handle::{EventHandle, HandleTable};
pub use queue::{DispatchStatus, EventKind, EventQueue, QueueControl, QueuedEvent};

//! rvbench bus layer
//!
//! Subject-addressed publish/subscribe primitives the load-test harness runs
//! on: messages and subjects, the `Bus` trait with an in-process and a TCP
//! implementation, virtual circuits layered on any bus, and the dispatch
//! runtime of queues, timers and dedicated workers.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod bus;
pub mod dispatch;
pub mod errors;
pub mod memory;
pub mod message;
pub mod net;
pub mod subject;
pub mod vc;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use bus::{Bus, Subscription};
pub use dispatch::{
    DispatchStatus, Dispatcher, EventHandle, EventHandler, EventKind, EventQueue, QueueControl,
    QueuedEvent,
};
pub use errors::{BusError, BusResult, StateTransitionError};
pub use memory::MemoryBus;
pub use message::{Field, FieldValue, Message};
pub use net::{Daemon, TcpBus, TransportParams};
pub use vc::{VcAcceptor, VcEvent, VcState, VirtualCircuit};

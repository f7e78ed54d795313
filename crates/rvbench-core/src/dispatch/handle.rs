//! Generational handle table for listeners and timers
//!
//! Every listener or timer bound to a queue owns one slot. Destroying a handle
//! bumps the slot generation, so events already queued under the old handle
//! are recognised as stale and dropped at dispatch time instead of reaching a
//! handler that has been torn down.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::task::AbortHandle;

// ----------------------------------------------------------------------------
// Event Handle
// ----------------------------------------------------------------------------

/// Identifies a listener or timer registered on a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle {
    index: u32,
    generation: u32,
}

impl EventHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for EventHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

// ----------------------------------------------------------------------------
// Handle Table
// ----------------------------------------------------------------------------

enum Slot {
    Occupied {
        generation: u32,
        task: Option<AbortHandle>,
    },
    Free {
        generation: u32,
    },
}

#[derive(Default)]
struct TableInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    closed: bool,
}

/// Slot table with ABA protection and idempotent removal
#[derive(Default)]
pub struct HandleTable {
    inner: Mutex<TableInner>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a slot; `None` once the table has been closed
    pub fn insert(&self) -> Option<EventHandle> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }

        let handle = match inner.free.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index as usize];
                let generation = match slot {
                    Slot::Free { generation } => *generation,
                    Slot::Occupied { generation, .. } => *generation,
                };
                *slot = Slot::Occupied {
                    generation,
                    task: None,
                };
                EventHandle { index, generation }
            }
            None => {
                let index = inner.slots.len() as u32;
                inner.slots.push(Slot::Occupied {
                    generation: 0,
                    task: None,
                });
                EventHandle {
                    index,
                    generation: 0,
                }
            }
        };
        inner.live += 1;
        Some(handle)
    }

    /// Bind the task that feeds a slot
    ///
    /// Returns false and aborts the task if the handle was destroyed before
    /// the task could be attached.
    pub fn attach(&self, handle: EventHandle, task: AbortHandle) -> bool {
        let mut inner = self.lock();
        match inner.slots.get_mut(handle.index as usize) {
            Some(Slot::Occupied {
                generation,
                task: slot_task,
            }) if *generation == handle.generation => {
                *slot_task = Some(task);
                true
            }
            _ => {
                task.abort();
                false
            }
        }
    }

    /// Whether the handle still refers to a live slot
    pub fn contains(&self, handle: EventHandle) -> bool {
        let inner = self.lock();
        matches!(
            inner.slots.get(handle.index as usize),
            Some(Slot::Occupied { generation, .. }) if *generation == handle.generation
        )
    }

    /// Free a slot and abort its task; false if it was already gone
    pub fn remove(&self, handle: EventHandle) -> bool {
        let index = handle.index as usize;
        let mut inner = self.lock();
        let task = match inner.slots.get_mut(index) {
            Some(Slot::Occupied { generation, task }) if *generation == handle.generation => {
                task.take()
            }
            _ => return false,
        };
        inner.slots[index] = Slot::Free {
            generation: handle.generation.wrapping_add(1),
        };
        inner.free.push(handle.index);
        inner.live -= 1;
        drop(inner);

        if let Some(task) = task {
            task.abort();
        }
        true
    }

    /// Free every slot and refuse further inserts; returns how many were live
    pub fn close(&self) -> usize {
        let mut inner = self.lock();
        let mut freed = 0;
        for slot in inner.slots.iter_mut() {
            if let Slot::Occupied { generation, task } = slot {
                if let Some(task) = task.take() {
                    task.abort();
                }
                let next = generation.wrapping_add(1);
                *slot = Slot::Free { generation: next };
                freed += 1;
            }
        }
        inner.free.clear();
        inner.live = 0;
        inner.closed = true;
        freed
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

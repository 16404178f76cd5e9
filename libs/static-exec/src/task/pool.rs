// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::error::SpawnError;
use crate::executor::Executor;
use crate::park::Park;
use crate::task::{TaskRef, TaskStorage};

/// A fixed number of [`TaskStorage`] slots for tasks running the same kind of future.
///
/// This allows more than one instance of a task to be active at the same time without
/// dynamic allocation. Spawning picks the first slot (by index) that is not active.
///
/// ```ignore
/// static WORKERS: TaskPool<Worker, 4> = TaskPool::new();
///
/// WORKERS.spawn(&EXEC, Worker::new(1))?;
/// WORKERS.spawn(&EXEC, Worker::new(2))?;
/// ```
pub struct TaskPool<F, const N: usize> {
    slots: [TaskStorage<F>; N],
}

impl<F, const N: usize> TaskPool<F, N>
where
    F: Future<Output = ()> + Send + 'static,
{
    /// Returns a pool of `N` empty slots.
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            slots: [const { TaskStorage::new() }; N],
        }
    }

    /// Returns a pool of `N` empty slots.
    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| TaskStorage::new()),
        }
    }

    /// Spawns `future` onto `executor` in the first free slot of the pool.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::NoFreeSlot`] if every slot holds an active task.
    pub fn spawn<P: Park>(
        &'static self,
        executor: &'static Executor<P>,
        future: F,
    ) -> Result<TaskRef, SpawnError> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.try_claim().is_ok() {
                tracing::trace!(pool.slot = index, "claimed pool slot");
                // Safety: we just claimed the slot
                return Ok(unsafe { executor.spawn_claimed(slot, future) });
            }
        }

        tracing::debug!(pool.capacity = N, "no free slot in task pool");
        Err(SpawnError::NoFreeSlot)
    }

    /// Returns the number of slots currently holding an active task.
    pub fn active(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_active()).count()
    }

    /// Returns the number of slots in the pool.
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<F, const N: usize> Default for TaskPool<F, N>
where
    F: Future<Output = ()> + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<F, const N: usize> fmt::Debug for TaskPool<F, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("capacity", &N)
            .field("slots", &self.slots)
            .finish()
    }
}

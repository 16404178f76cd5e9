// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Allocation-free cooperative executor for a fixed set of statically allocated tasks.
//!
//! Every task lives in a [`TaskStorage`] (or a slot of a [`TaskPool`]) that is placed in a `static`
//! and never freed. Tasks are woken through ordinary [`core::task::Waker`]s that can be invoked from
//! any context, including interrupt handlers: a wake is a bounded compare-and-swap on the task's state
//! word plus a lock-free push onto the executor's run queue. The [`Executor`] drains that queue, polls
//! every ready task once per pass and parks (see [`park::Park`]) once nothing is left to do.
//!
//! ```ignore
//! static EXEC: Executor<SpinPark> = Executor::new(SpinPark::new());
//! static BLINK: TaskStorage<Blink> = TaskStorage::new();
//!
//! EXEC.spawn(&BLINK, Blink::new())?;
//! EXEC.run();
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]

mod error;
pub mod executor;
mod loom;
pub mod park;
mod run_queue;
pub mod sync;
pub mod task;
#[cfg(test)]
mod test_util;

pub use error::SpawnError;
pub use executor::{Executor, Tick};
pub use task::{TaskPool, TaskRef, TaskState, TaskStorage, yield_now};

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Reasons a task could not be spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// The storage slot still holds a task that has not run to completion.
    AlreadyActive,
    /// Every slot of the [`TaskPool`](crate::TaskPool) is occupied by an active task.
    NoFreeSlot,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::AlreadyActive => f.write_str("task storage is already in use"),
            SpawnError::NoFreeSlot => f.write_str("no free slot left in task pool"),
        }
    }
}

impl core::error::Error for SpawnError {}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Primitives for handing events from interrupt handlers to tasks.

mod signal;
mod wait_cell;

use core::fmt;

pub use signal::Signal;
pub use wait_cell::{PollWaitError, Subscribe, Wait, WaitCell};

/// The primitive was closed and will never produce another wakeup.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Closed(());

impl Closed {
    pub(crate) const fn new() -> Self {
        Self(())
    }
}

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("closed")
    }
}

impl core::error::Error for Closed {}

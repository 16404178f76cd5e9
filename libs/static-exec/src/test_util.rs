// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use tracing::subscriber::DefaultGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

use crate::executor::Executor;
use crate::park::Park;

pub fn init_tracing() -> DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default()
}

/// Moves `value` to the heap for the rest of the test binary, standing in for a `static` whose
/// type can't be named (e.g. task storage for an `async` block).
pub fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// Stops the executor when dropped, so a panicking thread doesn't leave `Executor::run` parked
/// forever.
#[must_use]
pub struct StopOnPanic<P: Park + 'static> {
    exec: &'static Executor<P>,
}

impl<P: Park> StopOnPanic<P> {
    pub fn new(exec: &'static Executor<P>) -> Self {
        Self { exec }
    }
}

impl<P: Park> Drop for StopOnPanic<P> {
    fn drop(&mut self) {
        self.exec.stop();
    }
}

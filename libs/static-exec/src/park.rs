// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Putting the executor to sleep while no task is ready.

use core::fmt;

use crate::loom::loom_const_fn;
use crate::loom::sync::atomic::{AtomicBool, Ordering};

/// Blocks the executor until new work arrives.
///
/// Implementations must have *token* semantics: an [`unpark`](Park::unpark) that happens while the
/// executor is not parked must make the next [`park`](Park::park) return immediately. The executor
/// checks its run queue before parking, so a wake landing between that check and the call to `park`
/// is only seen through the token.
///
/// On a microcontroller this is typically a flag set from interrupt handlers plus a wait-for-interrupt
/// instruction issued with interrupts masked:
///
/// ```ignore
/// impl Park for WfiPark {
///     fn park(&self) {
///         critical_section(|| {
///             if !self.pending.swap(false, Ordering::Acquire) {
///                 // returns once an interrupt is pending, even while masked
///                 wfi();
///             }
///         });
///     }
///
///     fn unpark(&self) {
///         self.pending.store(true, Ordering::Release);
///     }
/// }
/// ```
pub trait Park {
    /// Block until [`Park::unpark`] was called, returning immediately if it was already called
    /// since the last time `park` returned. Spurious returns are allowed.
    fn park(&self);

    /// Wake the executor or, if it isn't parked, make its next call to [`Park::park`] return
    /// immediately.
    ///
    /// This must be safe to call from interrupt handlers: it may not block or allocate.
    fn unpark(&self);
}

/// A portable [`Park`] implementation that spins on an atomic flag.
///
/// Useful on targets without a sleep instruction and for driving an executor from a host
/// thread.
pub struct SpinPark {
    pending: AtomicBool,
}

impl SpinPark {
    loom_const_fn! {
        pub const fn new() -> SpinPark {
            SpinPark {
                pending: AtomicBool::new(false),
            }
        }
    }
}

impl Default for SpinPark {
    fn default() -> Self {
        Self::new()
    }
}

impl Park for SpinPark {
    fn park(&self) {
        while !self.pending.swap(false, Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }

    fn unpark(&self) {
        self.pending.store(true, Ordering::Release);
    }
}

impl fmt::Debug for SpinPark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinPark")
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(any(test, feature = "std"))]
pub use std_park::StdPark;

#[cfg(any(test, feature = "std"))]
mod std_park {
    use core::sync::atomic::{AtomicBool, Ordering, fence};
    use std::sync::OnceLock;
    use std::thread::{self, Thread};

    use super::Park;

    /// Parks the thread running the executor with [`std::thread::park`].
    ///
    /// The executor thread registers itself the first time it parks, so a `StdPark` can be
    /// created in a `static` before that thread exists.
    #[derive(Debug, Default)]
    pub struct StdPark {
        pending: AtomicBool,
        thread: OnceLock<Thread>,
    }

    impl StdPark {
        pub const fn new() -> Self {
            Self {
                pending: AtomicBool::new(false),
                thread: OnceLock::new(),
            }
        }
    }

    impl Park for StdPark {
        fn park(&self) {
            let registered = self.thread.get_or_init(thread::current);
            debug_assert_eq!(
                registered.id(),
                thread::current().id(),
                "StdPark must always be parked from the same thread"
            );

            // pairs with the fence in `unpark`: either we see the token or it sees our thread
            fence(Ordering::SeqCst);

            while !self.pending.swap(false, Ordering::Acquire) {
                tracing::trace!("parking current thread ({registered:?})...");
                thread::park();
            }
        }

        fn unpark(&self) {
            self.pending.store(true, Ordering::Release);
            fence(Ordering::SeqCst);

            if let Some(thread) = self.thread.get() {
                tracing::trace!("unparking thread {thread:?}...");
                thread.unpark();
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn unpark_before_park_is_not_lost() {
        let park = SpinPark::new();
        park.unpark();
        // returns immediately thanks to the token
        park.park();

        let park = StdPark::new();
        park.unpark();
        park.park();
    }

    #[test]
    fn std_park_wakes_from_other_thread() {
        let park = Arc::new(StdPark::new());

        let unparker = std::thread::spawn({
            let park = park.clone();
            move || {
                std::thread::sleep(Duration::from_millis(10));
                park.unpark();
            }
        });

        park.park();
        unparker.join().unwrap();
    }

    #[test]
    fn spin_park_wakes_from_other_thread() {
        let park = Arc::new(SpinPark::new());

        let unparker = std::thread::spawn({
            let park = park.clone();
            move || park.unpark()
        });

        park.park();
        unparker.join().unwrap();
    }
}

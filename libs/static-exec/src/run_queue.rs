// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Intrusive multi-producer, single-consumer queue of ready tasks.
//!
//! Producers (wakers, possibly running in interrupt context) push onto a Treiber stack with a
//! single CAS loop. The executor takes the whole stack with one atomic swap and reverses it, which
//! yields tasks in the order they were pushed. The queue never checks membership: a task's
//! `QUEUED` bit guarantees it is linked at most once.

use core::fmt;
use core::ptr::{self, NonNull};

use crate::loom::loom_const_fn;
use crate::loom::sync::atomic::{AtomicPtr, Ordering};
use crate::task::{Header, TaskRef};

pub(crate) struct RunQueue {
    head: AtomicPtr<Header>,
}

/// The tasks taken from the queue by [`RunQueue::drain`], oldest first.
///
/// The iterator must be exhausted: tasks it still holds are marked `QUEUED` and won't be pushed
/// again by their wakers.
#[must_use = "drained tasks must be polled"]
pub(crate) struct Drain {
    next: Option<NonNull<Header>>,
}

impl RunQueue {
    loom_const_fn! {
        pub(crate) const fn new() -> RunQueue {
            RunQueue {
                head: AtomicPtr::new(ptr::null_mut()),
            }
        }
    }

    /// Links `task` into the queue.
    ///
    /// This is lock-free and may be called from any context, concurrently with other pushes and
    /// with [`Self::drain`].
    pub(crate) fn push(&self, task: TaskRef) {
        let ptr = task.header_ptr();
        let link = task.header().run_link();
        debug_assert!(link.load(Ordering::Relaxed).is_null());

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            tracing::trace!(task.addr=?ptr, ?head, "RunQueue::push");
            link.store(head, Ordering::Relaxed);

            match self.head.compare_exchange_weak(
                head,
                ptr.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Takes every task pushed so far.
    ///
    /// Must only be called by the executor owning this queue.
    pub(crate) fn drain(&self) -> Drain {
        let mut head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);

        // the stack is newest first, reverse it in place
        let mut reversed: *mut Header = ptr::null_mut();
        while let Some(node) = NonNull::new(head) {
            // Safety: linked headers live in `'static` task storage
            let link = unsafe { node.as_ref() }.run_link();
            head = link.load(Ordering::Relaxed);
            link.store(reversed, Ordering::Relaxed);
            reversed = node.as_ptr();
        }

        Drain {
            next: NonNull::new(reversed),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl fmt::Debug for RunQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunQueue")
            .field("head", &self.head.load(Ordering::Relaxed))
            .finish()
    }
}

// === impl Drain ===

impl Iterator for Drain {
    type Item = TaskRef;

    fn next(&mut self) -> Option<Self::Item> {
        let curr = self.next.take()?;
        // Safety: linked headers live in `'static` task storage
        let link = unsafe { curr.as_ref() }.run_link();

        // unlink before handing the task out, it may be pushed again during its poll
        self.next = NonNull::new(link.swap(ptr::null_mut(), Ordering::Relaxed));
        tracing::trace!(task.addr=?curr, next=?self.next, "Drain::next");

        Some(TaskRef::from_header(curr))
    }
}

impl fmt::Debug for Drain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drain").field("next", &self.next).finish()
    }
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ptr::NonNull;

use crate::error::SpawnError;
use crate::loom::loom_const_fn;
#[cfg(feature = "counters")]
use crate::loom::sync::atomic::AtomicUsize;
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::park::Park;
use crate::run_queue::RunQueue;
use crate::task::{PollResult, TaskRef, TaskStorage};

/// Drives a set of statically allocated tasks on a single thread of execution.
///
/// The executor must live for the rest of the program (every spawned task records its address),
/// which is why it is created through a `const fn` and meant to be placed in a `static`:
///
/// ```ignore
/// static EXEC: Executor<SpinPark> = Executor::new(SpinPark::new());
/// ```
#[repr(C)]
pub struct Executor<P> {
    /// This must be the first field of the `Executor` struct!
    scheduler: Scheduler,
    park: P,
}

/// The part of the executor tasks talk to, independent of the [`Park`] implementation.
pub(crate) struct Scheduler {
    run_queue: RunQueue,
    stop: AtomicBool,
    /// Unparks the [`Executor`] this scheduler is embedded in.
    unpark: unsafe fn(NonNull<Scheduler>),
    #[cfg(feature = "counters")]
    spawned: AtomicUsize,
    #[cfg(feature = "counters")]
    woken: AtomicUsize,
}

/// Information about the executor state produced after ticking.
#[derive(Debug)]
#[non_exhaustive]
pub struct Tick {
    /// `true` if the tick completed with tasks remaining in the run queue.
    pub has_remaining: bool,

    /// The total number of tasks polled on this tick.
    pub polled: usize,

    /// The number of polled tasks that *completed* on this tick.
    ///
    /// This is always <= `self.polled`.
    pub completed: usize,

    /// The number of tasks that were spawned since the last tick.
    #[cfg(feature = "counters")]
    pub spawned: usize,

    /// The number of tasks that were woken from outside their own `poll` calls since the last tick.
    #[cfg(feature = "counters")]
    pub woken_external: usize,

    /// The number of tasks that were woken from within their own `poll` calls during this tick.
    #[cfg(feature = "counters")]
    pub woken_internal: usize,
}

// === impl Executor ===

impl<P: Park> Executor<P> {
    loom_const_fn! {
        pub const fn new(park: P) -> Executor<P> {
            Executor {
                scheduler: Scheduler {
                    run_queue: RunQueue::new(),
                    stop: AtomicBool::new(false),
                    unpark: Self::unpark_raw,
                    #[cfg(feature = "counters")]
                    spawned: AtomicUsize::new(0),
                    #[cfg(feature = "counters")]
                    woken: AtomicUsize::new(0),
                },
                park,
            }
        }
    }

    /// Returns the [`Park`] implementation used to put this executor to sleep.
    pub fn park(&self) -> &P {
        &self.park
    }

    /// Spawns `future` into `storage`, queueing it so it is polled on the next tick.
    ///
    /// The slot must be free: either it was never spawned or its previous future has completed.
    /// Respawning a slot bumps its generation, wakers handed out to the previous future panic
    /// when they are used afterward. Wakers only carry the low [`TAG_BITS`] bits of the
    /// generation: one that outlives `2^TAG_BITS` respawns of its slot is not detected and
    /// spuriously wakes the current task instead. [`WaitCell`] and [`Signal`] remove a waiting
    /// task's waker once the wait completes or is dropped, so only wakers stashed elsewhere
    /// can outlive their task.
    ///
    /// [`TAG_BITS`]: crate::task::TAG_BITS
    /// [`WaitCell`]: crate::sync::WaitCell
    /// [`Signal`]: crate::sync::Signal
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::AlreadyActive`] if the slot still holds a future that has not
    /// completed.
    pub fn spawn<F>(
        &'static self,
        storage: &'static TaskStorage<F>,
        future: F,
    ) -> Result<TaskRef, SpawnError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        storage.try_claim()?;
        // Safety: we just claimed the slot
        Ok(unsafe { self.spawn_claimed(storage, future) })
    }

    /// Spawns `future` into a slot the caller already claimed.
    ///
    /// # Safety
    ///
    /// The caller must have claimed `storage` through `TaskStorage::try_claim` and not
    /// initialized it since.
    pub(crate) unsafe fn spawn_claimed<F>(
        &'static self,
        storage: &'static TaskStorage<F>,
        future: F,
    ) -> TaskRef
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // derived from the whole executor, the unpark routine casts it back
        let scheduler = NonNull::from(self).cast::<Scheduler>();
        // Safety: ensured by caller
        let task = unsafe { storage.init(future, scheduler) };

        tracing::trace!(
            task.addr=?task.header_ptr(),
            task.generation=task.generation(),
            "spawned task"
        );

        #[cfg(feature = "counters")]
        self.scheduler.spawned.fetch_add(1, Ordering::Relaxed);

        self.scheduler.run_queue.push(task);
        self.park.unpark();
        task
    }

    /// Polls every task that is ready right now, once.
    ///
    /// Tasks woken during this pass (including tasks waking themselves) are polled on the next
    /// tick, in the order they were woken. This should only ever be called from the thread
    /// that runs the executor.
    pub fn tick(&self) -> Tick {
        let mut tick = Tick {
            has_remaining: false,
            polled: 0,
            completed: 0,
            #[cfg(feature = "counters")]
            spawned: 0,
            #[cfg(feature = "counters")]
            woken_external: 0,
            #[cfg(feature = "counters")]
            woken_internal: 0,
        };

        for task in self.scheduler.run_queue.drain() {
            let _span = tracing::trace_span!(
                "poll",
                task.addr = ?task.header_ptr(),
                task.generation = task.generation(),
            )
            .entered();

            let poll_result = task.poll();

            tick.polled += 1;
            match poll_result {
                PollResult::Ready => tick.completed += 1,
                PollResult::PendingSchedule => {
                    // the executor is awake, no need to unpark
                    self.scheduler.run_queue.push(task);
                    #[cfg(feature = "counters")]
                    {
                        tick.woken_internal += 1;
                    }
                }
                PollResult::Pending => {}
            }
        }

        #[cfg(feature = "counters")]
        {
            tick.spawned = self.scheduler.spawned.swap(0, Ordering::Relaxed);
            tick.woken_external = self.scheduler.woken.swap(0, Ordering::Relaxed);
        }

        tick.has_remaining = !self.scheduler.run_queue.is_empty();
        tracing::debug!(?tick, "executor tick");
        tick
    }

    /// Runs the executor until [`Executor::stop`] is called, parking whenever no task is ready.
    ///
    /// Tasks that are ready when the stop is requested are still polled before this returns.
    pub fn run(&self) {
        let _span = tracing::debug_span!("executor main loop").entered();

        loop {
            // drive the scheduling loop until we're out of work
            if self.tick().has_remaining {
                continue;
            }

            if self.scheduler.stop.load(Ordering::Acquire) {
                tracing::debug!("stop signal received, shutting down");
                break;
            }

            // a wake landing after the emptiness check above leaves an unpark token behind, so
            // this returns right away
            tracing::trace!("going to sleep");
            self.park.park();
            tracing::trace!("woke up");
        }
    }

    /// Makes [`Executor::run`] return once the run queue is empty.
    pub fn stop(&self) {
        self.scheduler.stop.store(true, Ordering::Release);
        self.park.unpark();
    }

    /// Returns `true` if [`Executor::stop`] was called.
    pub fn is_stopped(&self) -> bool {
        self.scheduler.stop.load(Ordering::Acquire)
    }

    /// # Safety
    ///
    /// `ptr` must have been derived from a reference to the whole `Executor<P>`.
    unsafe fn unpark_raw(ptr: NonNull<Scheduler>) {
        // Safety: ensured by caller, `scheduler` is the first field of a `repr(C)` struct
        let this = unsafe { ptr.cast::<Self>().as_ref() };
        this.park.unpark();
    }
}

impl<P: fmt::Debug> fmt::Debug for Executor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("scheduler", &self.scheduler)
            .field("park", &self.park)
            .finish()
    }
}

// === impl Scheduler ===

impl Scheduler {
    /// Queues a task that was woken by its waker and unparks the executor.
    ///
    /// # Safety
    ///
    /// `ptr` must be the scheduler pointer recorded by [`Executor::spawn`].
    pub(crate) unsafe fn wake(ptr: NonNull<Scheduler>, task: TaskRef) {
        // Safety: ensured by caller
        let this = unsafe { ptr.as_ref() };

        #[cfg(feature = "counters")]
        this.woken.fetch_add(1, Ordering::Relaxed);

        this.run_queue.push(task);
        // Safety: ensured by caller
        unsafe { (this.unpark)(ptr) };
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("run_queue", &self.run_queue)
            .field("stop", &self.stop.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod pool;
mod state;
mod yield_now;

use core::fmt;
use core::pin::Pin;
use core::ptr::{self, NonNull};
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

pub use pool::TaskPool;
pub use yield_now::{YieldNow, yield_now};

use crate::error::SpawnError;
use crate::executor::Scheduler;
use crate::loom::cell::UnsafeCell;
use crate::loom::loom_const_fn;
use crate::loom::sync::atomic::{AtomicPtr, Ordering};
use crate::task::state::{StartPollAction, State, WakeAction};

/// Number of low pointer bits every [`Waker`] uses to record the generation of the task it was
/// issued for.
///
/// A waker that survives a respawn of its slot is detected (and panics) as long as the slot was
/// respawned fewer than `2^TAG_BITS` times since the waker was created.
pub const TAG_BITS: u32 = 4;
pub(crate) const TAG_MASK: usize = (1 << TAG_BITS) - 1;

static_assertions::const_assert!(align_of::<Header>() >= 1 << TAG_BITS);

/// Observable scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Neither queued nor running. This is also the state of a task that has completed.
    Idle,
    /// Linked into the executor's run queue, waiting to be polled.
    Queued,
    /// Currently being polled.
    Running,
    /// Currently being polled and woken at least once during the poll. The task is queued again as
    /// soon as the poll returns `Pending`.
    RunningPendingRequeue,
}

/// Outcome of a single poll, telling the executor what to do with the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollResult {
    /// The future completed and has been dropped, the slot is free for a respawn.
    Ready,
    /// The future is waiting on an event, it will be queued by its waker.
    Pending,
    /// The task was woken while it ran and must be pushed onto the run queue again.
    PendingSchedule,
}

/// Metadata embedded in front of every [`TaskStorage`].
#[derive(Debug)]
#[repr(C, align(16))]
pub(crate) struct Header {
    /// The task's state.
    ///
    /// This field is accessed with atomic instructions, so it's always safe to access it.
    state: State,
    /// Intrusive link to the next task in the run queue, null when not queued.
    run_link: AtomicPtr<Header>,
    /// The task vtable for this task.
    vtable: &'static VTable,
    /// The executor this task was last spawned on.
    scheduler: AtomicPtr<Scheduler>,
}

#[derive(Debug)]
struct VTable {
    /// Poll the future once, dropping it in place when it completes.
    poll: unsafe fn(NonNull<Header>, &mut Context<'_>) -> Poll<()>,
}

/// Static storage for a single task running the future `F`.
///
/// A `TaskStorage` is meant to be placed in a `static`. It is never deallocated and can be
/// spawned again once its previous future has run to completion.
///
/// ```ignore
/// static TASK: TaskStorage<Blink> = TaskStorage::new();
/// ```
#[repr(C)]
pub struct TaskStorage<F> {
    /// This must be the first field of the `TaskStorage` struct!
    header: Header,
    future: UnsafeCell<Option<F>>,
}

// Safety: the future is only ever accessed by whoever holds the `RUNNING` bit (the executor) or
// claimed the slot through `SPAWNED`, everything else goes through atomics.
unsafe impl<F: Send> Sync for TaskStorage<F> {}

/// A copyable handle to a spawned task.
///
/// The handle names the storage slot rather than one incarnation of it: once the slot is
/// respawned, an old handle compares equal to the new one and observes (and wakes) the new
/// task. Use [`TaskRef::generation`] to tell incarnations apart.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TaskRef(NonNull<Header>);

// Safety: the handle only points to `'static` task headers whose shared fields are atomics
unsafe impl Send for TaskRef {}
// Safety: the handle only points to `'static` task headers whose shared fields are atomics
unsafe impl Sync for TaskRef {}

// === impl Header ===

static WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(
    Header::clone_waker,
    Header::wake_by_val,
    Header::wake_by_ref,
    Header::drop_waker,
);

impl Header {
    loom_const_fn! {
        const fn new(vtable: &'static VTable) -> Header {
            Header {
                state: State::new(),
                run_link: AtomicPtr::new(ptr::null_mut()),
                vtable,
                scheduler: AtomicPtr::new(ptr::null_mut()),
            }
        }
    }

    #[inline]
    pub(crate) fn run_link(&self) -> &AtomicPtr<Header> {
        &self.run_link
    }

    /// Builds a waker for the task at `ptr`, tagging the pointer with the task generation.
    fn raw_waker(ptr: NonNull<Header>, tag: usize) -> RawWaker {
        debug_assert!(tag <= TAG_MASK);
        let data = ptr.as_ptr().map_addr(|addr| addr | tag);
        RawWaker::new(data.cast_const().cast::<()>(), &WAKER_VTABLE)
    }

    fn untag(data: *const ()) -> (NonNull<Header>, usize) {
        let tag = data.addr() & TAG_MASK;
        let ptr = data.map_addr(|addr| addr & !TAG_MASK).cast::<Header>();
        // Safety: wakers are only ever created from non-null header pointers
        let ptr = unsafe { NonNull::new_unchecked(ptr.cast_mut()) };
        (ptr, tag)
    }

    /// # Safety
    ///
    /// `ptr` must point to a live `Header`.
    unsafe fn wake(ptr: NonNull<Header>, tag: usize) {
        // Safety: ensured by caller
        let this = unsafe { ptr.as_ref() };
        tracing::trace!(task.addr=?ptr, task.tag=tag, "Header::wake");

        match this.state.wake(tag) {
            WakeAction::Enqueue => {
                let Some(scheduler) = NonNull::new(this.scheduler.load(Ordering::Acquire)) else {
                    unreachable!("task {ptr:?} was woken but is not bound to an executor");
                };
                // Safety: executors are `'static` and tasks are only bound to them through `spawn`
                unsafe { Scheduler::wake(scheduler, TaskRef(ptr)) };
            }
            WakeAction::None => {}
            WakeAction::Stale { current } => panic!(
                "stale waker: task {ptr:?} was woken with generation tag {tag} but the slot is at generation {current}"
            ),
        }
    }

    unsafe fn clone_waker(data: *const ()) -> RawWaker {
        tracing::trace!(waker.addr=?data, "Header::clone_waker");
        RawWaker::new(data, &WAKER_VTABLE)
    }

    unsafe fn wake_by_val(data: *const ()) {
        // Safety: called through RawWakerVtable, wakers don't own anything so this is the same as
        // waking by reference
        unsafe { Self::wake_by_ref(data) }
    }

    unsafe fn wake_by_ref(data: *const ()) {
        let (ptr, tag) = Self::untag(data);
        // Safety: called through RawWakerVtable
        unsafe { Self::wake(ptr, tag) }
    }

    unsafe fn drop_waker(_: *const ()) {}
}

// === impl TaskStorage ===

impl<F> TaskStorage<F>
where
    F: Future<Output = ()> + Send + 'static,
{
    const VTABLE: VTable = VTable { poll: Self::poll };

    loom_const_fn! {
        /// Returns an empty, never spawned task slot.
        pub const fn new() -> TaskStorage<F> {
            TaskStorage {
                header: Header::new(&Self::VTABLE),
                future: UnsafeCell::new(None),
            }
        }
    }

    /// Returns the task's current scheduling state.
    pub fn state(&self) -> TaskState {
        self.header.state.load(Ordering::Acquire).task_state()
    }

    /// Returns `true` if the slot holds a future that has not completed yet.
    pub fn is_active(&self) -> bool {
        self.header.state.load(Ordering::Acquire).is_active()
    }

    /// Claims the slot, returning the generation of the new task.
    pub(crate) fn try_claim(&self) -> Result<usize, SpawnError> {
        self.header.state.try_spawn()
    }

    /// Binds the claimed slot to `scheduler` and moves `future` into it.
    ///
    /// # Safety
    ///
    /// The caller must have claimed the slot through [`Self::try_claim`] and must not have pushed
    /// it onto a run queue yet.
    pub(crate) unsafe fn init(&'static self, future: F, scheduler: NonNull<Scheduler>) -> TaskRef {
        self.header
            .scheduler
            .store(scheduler.as_ptr(), Ordering::Release);

        self.future.with_mut(|slot| {
            // Safety: claiming the slot gives us exclusive access to the future until the task is
            // pushed onto the run queue
            unsafe {
                debug_assert!((*slot).is_none());
                *slot = Some(future);
            }
        });

        self.as_task_ref()
    }

    #[inline]
    pub(crate) fn as_task_ref(&'static self) -> TaskRef {
        TaskRef(NonNull::from(&self.header))
    }

    /// Poll the future once.
    ///
    /// This is a type-erased function called through the task's [`VTable`].
    ///
    /// # Safety
    ///
    /// - `ptr` must point to the [`Header`] of a `TaskStorage<F>`
    /// - the caller must hold the `RUNNING` bit of the task
    unsafe fn poll(ptr: NonNull<Header>, cx: &mut Context<'_>) -> Poll<()> {
        // Safety: ensured by caller
        let this = unsafe { ptr.cast::<Self>().as_ref() };

        this.future.with_mut(|slot| {
            // Safety: the `RUNNING` bit grants exclusive access to the future
            let slot = unsafe { &mut *slot };
            let Some(future) = slot.as_mut() else {
                unreachable!("task {ptr:?} was polled without a future");
            };

            // Safety: the storage is `'static` and the future is only ever dropped in place
            let poll = unsafe { Pin::new_unchecked(future) }.poll(cx);

            if poll.is_ready() {
                tracing::trace!(task.addr=?ptr, "task completed, dropping future");
                *slot = None;
            }

            poll
        })
    }
}

impl<F> Default for TaskStorage<F>
where
    F: Future<Output = ()> + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<F> fmt::Debug for TaskStorage<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskStorage")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

// === impl TaskRef ===

impl TaskRef {
    /// Returns the task's current scheduling state.
    pub fn state(self) -> TaskState {
        self.header().state.load(Ordering::Acquire).task_state()
    }

    /// Returns `true` while the task's future has not completed.
    ///
    /// Note that the handle keeps pointing to the same storage slot, so this returns `true` again
    /// once the slot has been respawned.
    pub fn is_active(self) -> bool {
        self.header().state.load(Ordering::Acquire).is_active()
    }

    /// Returns the generation of the slot, incremented every time it is spawned.
    pub fn generation(self) -> usize {
        self.header().state.load(Ordering::Acquire).generation()
    }

    /// Returns a waker for the task currently occupying the slot.
    pub fn waker(self) -> Waker {
        let tag = self.generation() & TAG_MASK;
        // Safety: the vtable functions uphold the `RawWaker` contract for any header pointer
        unsafe { Waker::from_raw(Header::raw_waker(self.0, tag)) }
    }

    /// Wakes the task currently occupying the slot.
    pub fn wake(self) {
        self.waker().wake();
    }

    /// Returns a handle for a header taken from a run queue.
    #[inline]
    pub(crate) fn from_header(ptr: NonNull<Header>) -> TaskRef {
        TaskRef(ptr)
    }

    #[inline]
    pub(crate) fn header_ptr(self) -> NonNull<Header> {
        self.0
    }

    #[inline]
    pub(crate) fn header(self) -> &'static Header {
        // Safety: task headers live in `'static` storage
        unsafe { self.0.as_ref() }
    }

    /// Poll the task once, returning a [`PollResult`] that indicates what the
    /// executor should do with the polled task.
    pub(crate) fn poll(self) -> PollResult {
        let header = self.header();

        let generation = match header.state.start_poll() {
            // Successfully to transitioned to `RUNNING` all is good!
            StartPollAction::Poll { generation } => generation,
            // Something isn't right, we shouldn't poll the task right now...
            StartPollAction::DontPoll => {
                tracing::warn!(task.addr=?self.0, "failed to transition to running");
                return PollResult::Pending;
            }
        };

        // Safety: the vtable functions uphold the `RawWaker` contract for any header pointer
        let waker = unsafe { Waker::from_raw(Header::raw_waker(self.0, generation & TAG_MASK)) };
        let mut cx = Context::from_waker(&waker);

        // Safety: the vtable was chosen by the storage the header is embedded in and we hold the
        // `RUNNING` bit
        let poll = unsafe { (header.vtable.poll)(self.0, &mut cx) };

        let result = header.state.end_poll(poll.is_ready());
        tracing::trace!(?result, "poll finished");
        result
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("addr", &self.0)
            .field("state", &self.header().state)
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::park::SpinPark;
    use crate::sync::WaitCell;
    use crate::test_util::{init_tracing, leak};

    #[test]
    fn waker_carries_generation_tag() {
        let _trace = init_tracing();
        let exec: &'static Executor<SpinPark> = leak(Executor::new(SpinPark::new()));
        let storage: &'static TaskStorage<_> = leak(TaskStorage::new());

        let task = exec.spawn(storage, async {}).unwrap();
        let waker = task.waker();
        let (ptr, tag) = Header::untag(waker.data());

        assert_eq!(ptr, task.header_ptr());
        assert_eq!(tag, task.generation() & TAG_MASK);
        assert!(waker.will_wake(&waker.clone()));
    }

    #[test]
    fn waker_from_poll_matches_task_waker() {
        let _trace = init_tracing();
        let exec: &'static Executor<SpinPark> = leak(Executor::new(SpinPark::new()));
        let storage: &'static TaskStorage<_> = leak(TaskStorage::new());
        let expected: &'static std::sync::Mutex<Option<Waker>> = leak(std::sync::Mutex::new(None));

        let task = exec
            .spawn(
                storage,
                core::future::poll_fn(|cx| {
                    *expected.lock().unwrap() = Some(cx.waker().clone());
                    Poll::Pending
                }),
            )
            .unwrap();

        exec.tick();
        let waker = expected.lock().unwrap().take().unwrap();
        assert!(waker.will_wake(&task.waker()));
        assert_eq!(task.state(), TaskState::Idle);
        assert!(task.is_active());
    }

    #[test]
    fn future_is_dropped_on_completion() {
        struct DropFlag(&'static core::sync::atomic::AtomicBool);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, core::sync::atomic::Ordering::Release);
            }
        }

        let _trace = init_tracing();
        let exec: &'static Executor<SpinPark> = leak(Executor::new(SpinPark::new()));
        let storage: &'static TaskStorage<_> = leak(TaskStorage::new());
        let dropped: &'static core::sync::atomic::AtomicBool =
            leak(core::sync::atomic::AtomicBool::new(false));

        let flag = DropFlag(dropped);
        let task = exec
            .spawn(storage, async move {
                let _flag = flag;
            })
            .unwrap();

        assert!(!dropped.load(core::sync::atomic::Ordering::Acquire));
        exec.tick();
        assert!(dropped.load(core::sync::atomic::Ordering::Acquire));
        assert!(!task.is_active());
    }

    #[test]
    fn handle_follows_the_slot_across_respawns() {
        let _trace = init_tracing();
        let exec: &'static Executor<SpinPark> = leak(Executor::new(SpinPark::new()));
        let cell: &'static WaitCell = leak(WaitCell::new());
        let storage: &'static TaskStorage<_> = leak(TaskStorage::new());
        let make = move || async move {
            cell.wait().await.unwrap();
        };

        let old = exec.spawn(storage, make()).unwrap();
        let old_generation = old.generation();
        exec.tick();
        cell.wake();
        assert_eq!(exec.tick().completed, 1);

        let new = exec.spawn(storage, make()).unwrap();
        exec.tick();
        assert_eq!(new.state(), TaskState::Idle);
        assert_eq!(old, new);
        assert_ne!(old_generation, new.generation());
        assert_eq!(old.generation(), new.generation());

        // the old handle wakes the current incarnation
        old.wake();
        assert_eq!(new.state(), TaskState::Queued);
    }
}

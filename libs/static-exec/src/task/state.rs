// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::error::SpawnError;
use crate::loom::loom_const_fn;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::task::{PollResult, TAG_MASK, TaskState};

/// Task state. Every transition of a task is a single compare-and-swap on this word, which has the
/// following layout:
///
/// ```text
/// | usize::BITS-1      4 | 3       | 2     | 1       | 0      |
/// | generation           | spawned | woken | running | queued |
/// ```
pub(crate) struct State {
    val: AtomicUsize,
}

mycelium_bitfield::bitfield! {
    /// A snapshot of a task's current state.
    #[derive(PartialEq, Eq)]
    pub(crate) struct Snapshot<usize> {
        /// If set, the task is linked into the run queue.
        pub(crate) const QUEUED: bool;
        /// If set, the executor is currently polling the task.
        pub(crate) const RUNNING: bool;
        /// If set, the task was woken while it was running and must be queued again once the poll
        /// returns.
        pub(crate) const WOKEN: bool;
        /// If set, the storage slot holds a future that has not completed yet.
        pub(crate) const SPAWNED: bool;
        /// Incremented every time the slot is (re)spawned. The low bits are mirrored in the waker
        /// pointer tag.
        pub(crate) const GENERATION = ..;
    }
}

#[must_use]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum StartPollAction {
    /// Successful transition, it's okay to poll the task.
    Poll {
        /// The generation the task is polled in, used to tag the waker handed to the future.
        generation: usize,
    },
    /// The task was drained but is not in a pollable state.
    DontPoll,
}

#[must_use]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum WakeAction {
    /// The task should be pushed onto the run queue.
    Enqueue,
    /// The task does not need to be enqueued.
    None,
    /// The waker was issued for an earlier incarnation of this slot.
    Stale {
        /// The generation the slot is currently in.
        current: usize,
    },
}

const GENERATION_MAX: usize = Snapshot::GENERATION.raw_mask() / Snapshot::GENERATION.first_bit();

impl State {
    loom_const_fn! {
        pub(super) const fn new() -> State {
            State {
                val: AtomicUsize::new(0),
            }
        }
    }

    #[inline]
    pub(super) fn load(&self, ordering: Ordering) -> Snapshot {
        Snapshot(self.val.load(ordering))
    }

    /// Claims the slot for a new task, bumping its generation and marking it queued so it is
    /// polled at least once. Returns the new generation.
    pub(super) fn try_spawn(&self) -> Result<usize, SpawnError> {
        self.transition(|s| {
            if s.get(Snapshot::SPAWNED) {
                return Err(SpawnError::AlreadyActive);
            }

            debug_assert!(
                !s.get(Snapshot::QUEUED) && !s.get(Snapshot::RUNNING),
                "inactive task must be neither queued nor running; state={s}"
            );

            let generation = s.get(Snapshot::GENERATION).wrapping_add(1) & GENERATION_MAX;
            s.set(Snapshot::SPAWNED, true)
                .set(Snapshot::QUEUED, true)
                .set(Snapshot::WOKEN, false)
                .set(Snapshot::GENERATION, generation);

            Ok(generation)
        })
    }

    /// Attempt to transition the task from `QUEUED` to `RUNNING`.
    pub(super) fn start_poll(&self) -> StartPollAction {
        self.transition(|s| {
            if !s.get(Snapshot::QUEUED) || s.get(Snapshot::RUNNING) || !s.get(Snapshot::SPAWNED) {
                return StartPollAction::DontPoll;
            }

            s.set(Snapshot::QUEUED, false)
                .set(Snapshot::RUNNING, true)
                .set(Snapshot::WOKEN, false);

            StartPollAction::Poll {
                generation: s.get(Snapshot::GENERATION),
            }
        })
    }

    /// Transition the task out of `RUNNING` once its poll returned.
    ///
    /// A completed task becomes inactive. A task that was woken while it ran goes straight back
    /// to `QUEUED` and the caller is told to push it again.
    pub(super) fn end_poll(&self, completed: bool) -> PollResult {
        self.transition(|s| {
            debug_assert!(s.get(Snapshot::RUNNING), "task must be running; state={s}");
            debug_assert!(!s.get(Snapshot::QUEUED), "running task must not be queued; state={s}");

            s.set(Snapshot::RUNNING, false);

            if completed {
                s.set(Snapshot::WOKEN, false).set(Snapshot::SPAWNED, false);
                return PollResult::Ready;
            }

            if s.get(Snapshot::WOKEN) {
                s.set(Snapshot::WOKEN, false).set(Snapshot::QUEUED, true);
                PollResult::PendingSchedule
            } else {
                PollResult::Pending
            }
        })
    }

    /// Wakes the task on behalf of a waker tagged with `tag`.
    pub(super) fn wake(&self, tag: usize) -> WakeAction {
        self.transition(|s| {
            let generation = s.get(Snapshot::GENERATION);
            if generation & TAG_MASK != tag {
                return WakeAction::Stale {
                    current: generation,
                };
            }

            // completed and not respawned, or already queued
            if !s.get(Snapshot::SPAWNED) || s.get(Snapshot::QUEUED) {
                return WakeAction::None;
            }

            // coalesces with any wake that already arrived during this poll
            if s.get(Snapshot::RUNNING) {
                s.set(Snapshot::WOKEN, true);
                return WakeAction::None;
            }

            s.set(Snapshot::QUEUED, true);
            WakeAction::Enqueue
        })
    }

    fn transition<T>(&self, mut transition: impl FnMut(&mut Snapshot) -> T) -> T {
        let mut current = self.load(Ordering::Acquire);
        loop {
            tracing::trace!("State::transition; current:\n{}", current);
            let mut next = current;
            let res = transition(&mut next);

            if current.0 == next.0 {
                return res;
            }

            tracing::trace!("State::transition; next:\n{}", next);
            match self.val.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return res,
                Err(actual) => current = Snapshot(actual),
            }
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

impl Snapshot {
    pub(crate) fn generation(self) -> usize {
        Snapshot::GENERATION.unpack(self.0)
    }

    pub(crate) fn is_active(self) -> bool {
        self.get(Snapshot::SPAWNED)
    }

    pub(crate) fn task_state(self) -> TaskState {
        match (
            self.get(Snapshot::QUEUED),
            self.get(Snapshot::RUNNING),
            self.get(Snapshot::WOKEN),
        ) {
            (true, _, _) => TaskState::Queued,
            (false, true, true) => TaskState::RunningPendingRequeue,
            (false, true, false) => TaskState::Running,
            (false, false, _) => TaskState::Idle,
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::task::TAG_BITS;

    #[test]
    fn spawn_poll_complete() {
        let state = State::new();
        assert_eq!(state.try_spawn(), Ok(1));
        assert_eq!(state.load(Ordering::Relaxed).task_state(), TaskState::Queued);
        assert_eq!(state.try_spawn(), Err(SpawnError::AlreadyActive));

        assert_eq!(state.start_poll(), StartPollAction::Poll { generation: 1 });
        assert_eq!(state.load(Ordering::Relaxed).task_state(), TaskState::Running);
        assert!(matches!(state.end_poll(true), PollResult::Ready));

        let s = state.load(Ordering::Relaxed);
        assert!(!s.is_active());
        assert_eq!(s.task_state(), TaskState::Idle);
        assert_eq!(s.generation(), 1);
    }

    #[test]
    fn wake_while_idle_enqueues_once() {
        let state = State::new();
        let generation = state.try_spawn().unwrap();
        let _ = state.start_poll();
        assert!(matches!(state.end_poll(false), PollResult::Pending));

        let tag = generation & TAG_MASK;
        assert_eq!(state.wake(tag), WakeAction::Enqueue);
        assert_eq!(state.wake(tag), WakeAction::None);
        assert_eq!(state.wake(tag), WakeAction::None);
        assert_eq!(state.load(Ordering::Relaxed).task_state(), TaskState::Queued);
    }

    #[test]
    fn wake_while_running_requeues_after_poll() {
        let state = State::new();
        let generation = state.try_spawn().unwrap();
        let _ = state.start_poll();

        let tag = generation & TAG_MASK;
        assert_eq!(state.wake(tag), WakeAction::None);
        assert_eq!(state.wake(tag), WakeAction::None);
        assert_eq!(
            state.load(Ordering::Relaxed).task_state(),
            TaskState::RunningPendingRequeue
        );

        assert!(matches!(state.end_poll(false), PollResult::PendingSchedule));
        assert_eq!(state.load(Ordering::Relaxed).task_state(), TaskState::Queued);
    }

    #[test]
    fn wake_after_completion_is_ignored() {
        let state = State::new();
        let generation = state.try_spawn().unwrap();
        let _ = state.start_poll();
        let _ = state.end_poll(true);

        assert_eq!(state.wake(generation & TAG_MASK), WakeAction::None);
        assert_eq!(state.load(Ordering::Relaxed).task_state(), TaskState::Idle);
    }

    #[test]
    fn respawn_makes_old_wakers_stale() {
        let state = State::new();
        let first = state.try_spawn().unwrap();
        let _ = state.start_poll();
        let _ = state.end_poll(true);

        let second = state.try_spawn().unwrap();
        assert_eq!(second, first + 1);
        assert_eq!(
            state.wake(first & TAG_MASK),
            WakeAction::Stale { current: second }
        );
    }

    #[test]
    fn stale_tags_are_detected_within_the_tag_window() {
        let state = State::new();
        let first = state.try_spawn().unwrap();
        let tag = first & TAG_MASK;

        for _ in 1..(1 << TAG_BITS) {
            let _ = state.start_poll();
            let _ = state.end_poll(true);
            let current = state.try_spawn().unwrap();
            assert_eq!(state.wake(tag), WakeAction::Stale { current });
        }

        // one full wrap of the tag later, the old waker aliases the current task
        let _ = state.start_poll();
        let _ = state.end_poll(true);
        let current = state.try_spawn().unwrap();
        assert_eq!(current & TAG_MASK, tag);
        assert_eq!(state.wake(tag), WakeAction::None);
    }

    #[test]
    fn drained_but_inactive_is_not_polled() {
        let state = State::new();
        assert_eq!(state.start_poll(), StartPollAction::DontPoll);
    }
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use bitflags::bitflags;

use crate::loom::cell::UnsafeCell;
use crate::loom::hint;
use crate::loom::loom_const_fn;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::Closed;

/// Hands a single wakeup from an interrupt handler (or any other context) to one task.
///
/// The task registers its [`Waker`] through [`WaitCell::wait`] or [`WaitCell::poll_wait`], the
/// interrupt handler calls [`WaitCell::wake`]. Both sides only ever perform a couple of atomic
/// operations: whoever finds the waker slot locked by the other side leaves a note in the state
/// word, and the side holding the lock picks it up.
///
/// A wakeup with nobody registered is kept until the next wait consumes it, so an interrupt
/// firing between starting a transfer and waiting for its completion is not lost.
///
/// ```ignore
/// static RX_DONE: WaitCell = WaitCell::new();
///
/// fn uart_rx_interrupt() {
///     RX_DONE.wake();
/// }
///
/// async fn read_byte() -> u8 {
///     let wait = RX_DONE.subscribe().await;
///     start_rx();
///     wait.await.unwrap();
///     rx_data()
/// }
/// ```
pub struct WaitCell {
    state: AtomicUsize,
    waker: UnsafeCell<Option<Waker>>,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct State: usize {
        /// A task holds the waker slot to store its waker.
        const REGISTERING = 1 << 0;
        /// `wake` or `close` holds the waker slot to take the waker out.
        const NOTIFYING = 1 << 1;
        /// A wakeup arrived that no wait has consumed yet.
        const NOTIFIED = 1 << 2;
        const CLOSED = 1 << 3;
    }
}

/// Future returned from [`WaitCell::wait`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Wait<'a> {
    cell: &'a WaitCell,
    /// Set when [`Subscribe`] already observed the outcome while registering.
    outcome: Option<Result<(), Closed>>,
    /// The waker this future left in the cell, removed again when it is dropped early.
    registered: Option<Waker>,
}

/// Future returned from [`WaitCell::subscribe`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Subscribe<'a> {
    cell: &'a WaitCell,
}

/// Why [`WaitCell::poll_wait`] did not register a waker.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PollWaitError {
    /// The cell was [closed](WaitCell::close).
    Closed,
    /// Another task is registering its own waker at the same time.
    Busy,
}

// === impl WaitCell ===

impl WaitCell {
    loom_const_fn! {
        pub const fn new() -> WaitCell {
            WaitCell {
                state: AtomicUsize::new(0),
                waker: UnsafeCell::new(None),
            }
        }
    }

    /// Registers the waker from `cx` to be woken by the next [`WaitCell::wake`].
    ///
    /// Returns `Ready(Ok(()))` instead of registering if a wakeup is already pending, consuming
    /// it. Registering a waker for a different task wakes the one it replaces.
    #[tracing::instrument(level = "trace", skip(cx))]
    pub fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<Result<(), PollWaitError>> {
        if let Err(state) = self.cas(State::empty(), State::REGISTERING, Ordering::Acquire) {
            return Poll::Ready(self.consume(state));
        }

        // Safety: we hold REGISTERING
        unsafe { self.store_waker(cx.waker()) };

        match self.cas(State::REGISTERING, State::empty(), Ordering::AcqRel) {
            Ok(_) => Poll::Pending,
            // Safety: we still hold REGISTERING
            Err(state) => Poll::Ready(unsafe { self.notified_while_registering(state) }),
        }
    }

    /// Waits for the next call to [`WaitCell::wake`].
    ///
    /// The waker is only registered on the first poll of the returned future. A wakeup that
    /// happens before that completes the wait only if nobody consumed it in between; use
    /// [`WaitCell::subscribe`] to register before starting the operation that leads to the
    /// wakeup.
    ///
    /// The future resolves to `Err(Closed)` if the cell is or gets [closed](Self::close).
    pub fn wait(&self) -> Wait<'_> {
        Wait {
            cell: self,
            outcome: None,
            registered: None,
        }
    }

    /// Registers the calling task right away, resolving to a [`Wait`] future that completes on
    /// the next wakeup after this point.
    pub fn subscribe(&self) -> Subscribe<'_> {
        Subscribe { cell: self }
    }

    /// Wakes the registered task, or leaves the wakeup in the cell for the next wait.
    ///
    /// This never blocks and is safe to call from interrupt handlers. Returns `true` if a
    /// registered task was woken.
    #[tracing::instrument(level = "trace")]
    pub fn wake(&self) -> bool {
        self.notify(State::empty())
    }

    /// Closes the cell and wakes the registered task.
    ///
    /// Every wait on a closed cell fails with [`Closed`].
    #[tracing::instrument(level = "trace")]
    pub fn close(&self) -> bool {
        self.notify(State::CLOSED)
    }

    /// Returns `true` if the cell was [closed](Self::close).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.load().contains(State::CLOSED)
    }

    /// Waits until `f` returns `true`, re-evaluating it after every wakeup.
    ///
    /// The task subscribes *before* `f` runs, so a wakeup between evaluating the condition and
    /// going to sleep is not lost.
    ///
    /// # Errors
    ///
    /// Returns [`Err`]`(`[`Closed`]`)` if the cell is closed.
    pub async fn wait_for<F: FnMut() -> bool>(&self, mut f: F) -> Result<(), Closed> {
        self.wait_for_value(|| f().then_some(())).await
    }

    /// Waits until `f` returns `Some`, re-evaluating it after every wakeup.
    ///
    /// The registration is removed again before this returns, so the cell never keeps the waker
    /// of a task that has moved on.
    ///
    /// # Errors
    ///
    /// Returns [`Err`]`(`[`Closed`]`)` if the cell is closed.
    pub async fn wait_for_value<T, F: FnMut() -> Option<T>>(&self, mut f: F) -> Result<T, Closed> {
        loop {
            let wait = self.subscribe().await;
            if let Some(value) = f() {
                drop(wait);
                return Ok(value);
            }
            wait.await?;
        }
    }

    /// Outcome of a registration attempt that found the state word non-empty.
    fn consume(&self, state: State) -> Result<(), PollWaitError> {
        if state.contains(State::CLOSED) {
            Err(PollWaitError::Closed)
        } else if state.contains(State::NOTIFIED) {
            self.clear(State::NOTIFIED, Ordering::Release);
            Ok(())
        } else {
            Err(PollWaitError::Busy)
        }
    }

    /// # Safety
    ///
    /// The caller must hold `REGISTERING`.
    unsafe fn store_waker(&self, waker: &Waker) {
        let evicted = self.waker.with_mut(|slot| {
            // Safety: ensured by caller
            let slot = unsafe { &mut *slot };
            match slot {
                Some(registered) if registered.will_wake(waker) => None,
                _ => slot.replace(waker.clone()),
            }
        });

        if let Some(evicted) = evicted {
            tracing::trace!(?evicted, "replaced the waker of another task");
            evicted.wake();
        }
    }

    /// A wakeup (or close) arrived while we held the slot. The registering task completes right
    /// away instead of waiting, so the stored waker is no longer needed.
    ///
    /// # Safety
    ///
    /// The caller must hold `REGISTERING`.
    unsafe fn notified_while_registering(&self, observed: State) -> Result<(), PollWaitError> {
        tracing::trace!(state = ?observed, "notified while registering");

        // Safety: ensured by caller
        drop(self.waker.with_mut(|slot| unsafe { (*slot).take() }));

        // releases the slot and consumes the wakeup, only CLOSED survives
        let state = self.retain(State::CLOSED, Ordering::AcqRel);
        if state.contains(State::CLOSED) {
            Err(PollWaitError::Closed)
        } else {
            Ok(())
        }
    }

    /// Removes `waker` from the slot if it is still the registered one.
    ///
    /// Only spins while another side holds the slot, neither of which ever blocks.
    fn deregister(&self, waker: &Waker) {
        let mut state = self.load();
        loop {
            if state.contains(State::CLOSED) {
                // closing emptied the slot
                return;
            }
            if state.intersects(State::REGISTERING | State::NOTIFYING) {
                hint::spin_loop();
                state = self.load();
                continue;
            }
            match self.cas(state, state | State::REGISTERING, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => state = actual,
            }
        }

        let removed = self.waker.with_mut(|slot| {
            // Safety: we hold REGISTERING
            let slot = unsafe { &mut *slot };
            match slot {
                Some(registered) if registered.will_wake(waker) => slot.take(),
                _ => None,
            }
        });
        self.clear(State::REGISTERING, Ordering::Release);

        if removed.is_some() {
            tracing::trace!(?waker, "deregistered waker");
        }
    }

    fn notify(&self, close: State) -> bool {
        let mut prev = self.load();
        let delivering = loop {
            if prev.contains(State::CLOSED) {
                return false;
            }

            // whoever holds the slot picks the wakeup up from NOTIFIED
            let busy = prev.intersects(State::REGISTERING | State::NOTIFYING);
            let mut next = prev | State::NOTIFIED | close;
            if !busy {
                next |= State::NOTIFYING;
            }

            match self.cas(prev, next, Ordering::AcqRel) {
                Ok(_) => break !busy,
                Err(actual) => prev = actual,
            }
        };

        if !delivering {
            tracing::trace!(state = ?prev, "waker slot busy");
            return false;
        }

        // Safety: we hold NOTIFYING
        let waker = self.waker.with_mut(|slot| unsafe { (*slot).take() });
        self.clear(State::NOTIFYING, Ordering::Release);

        let Some(waker) = waker else {
            return false;
        };
        tracing::trace!(?waker, "waking registered task");
        waker.wake();
        true
    }

    #[inline]
    fn cas(&self, current: State, new: State, success: Ordering) -> Result<State, State> {
        self.state
            .compare_exchange(current.bits(), new.bits(), success, Ordering::Acquire)
            .map(State::from_bits_retain)
            .map_err(State::from_bits_retain)
    }

    #[inline]
    fn clear(&self, bits: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.fetch_and(!bits.bits(), order))
    }

    #[inline]
    fn retain(&self, bits: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.fetch_and(bits.bits(), order))
    }

    #[inline]
    fn load(&self) -> State {
        State::from_bits_retain(self.state.load(Ordering::Acquire))
    }
}

impl Default for WaitCell {
    fn default() -> Self {
        WaitCell::new()
    }
}

// Safety: the waker slot is only accessed while holding REGISTERING or NOTIFYING
unsafe impl Send for WaitCell {}
// Safety: the waker slot is only accessed while holding REGISTERING or NOTIFYING
unsafe impl Sync for WaitCell {}

impl fmt::Debug for WaitCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitCell")
            .field("state", &self.load())
            .finish_non_exhaustive()
    }
}

impl Drop for WaitCell {
    fn drop(&mut self) {
        self.close();
    }
}

// === impl Wait ===

impl Future for Wait<'_> {
    type Output = Result<(), Closed>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.outcome.take() {
            // a completed wait no longer owns a slot in the cell
            self.registered = None;
            return Poll::Ready(outcome);
        }

        match self.cell.poll_wait(cx) {
            Poll::Pending => {
                if !self
                    .registered
                    .as_ref()
                    .is_some_and(|registered| registered.will_wake(cx.waker()))
                {
                    self.registered = Some(cx.waker().clone());
                }
                Poll::Pending
            }
            Poll::Ready(Err(PollWaitError::Busy)) => {
                // try again once the other task is done registering
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Poll::Ready(result) => {
                self.registered = None;
                Poll::Ready(result.map_err(|_| Closed::new()))
            }
        }
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        if let Some(waker) = self.registered.take() {
            self.cell.deregister(&waker);
        }
    }
}

// === impl Subscribe ===

impl<'cell> Future for Subscribe<'cell> {
    type Output = Wait<'cell>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut registered = None;
        let outcome = match self.cell.poll_wait(cx) {
            Poll::Pending => {
                registered = Some(cx.waker().clone());
                None
            }
            Poll::Ready(Ok(())) => Some(Ok(())),
            Poll::Ready(Err(PollWaitError::Closed)) => Some(Err(Closed::new())),
            Poll::Ready(Err(PollWaitError::Busy)) => {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
        };

        Poll::Ready(Wait {
            cell: self.cell,
            outcome,
            registered,
        })
    }
}

#[cfg(all(not(loom), test))]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicU8;

    use tokio_test::{assert_pending, assert_ready_eq, assert_ready_ok, task};

    use super::*;
    use crate::test_util::init_tracing;

    fn waiter(cell: &Arc<WaitCell>) -> task::Spawn<impl Future<Output = Result<(), Closed>>> {
        let cell = cell.clone();
        task::spawn(async move { cell.wait().await })
    }

    #[test]
    fn wake_completes_registered_wait() {
        let _trace = init_tracing();
        let cell = Arc::new(WaitCell::new());
        let mut task = waiter(&cell);

        assert_pending!(task.poll());
        assert_pending!(task.poll(), "polling again keeps the registration");
        assert!(!task.is_woken());

        assert!(cell.wake());
        assert!(task.is_woken());
        assert_ready_ok!(task.poll());
    }

    #[test]
    fn early_wake_is_consumed_once() {
        let _trace = init_tracing();
        let cell = Arc::new(WaitCell::new());

        assert!(!cell.wake(), "nobody is registered yet");

        let mut first = waiter(&cell);
        assert_ready_ok!(first.poll());

        let mut second = waiter(&cell);
        assert_pending!(second.poll());
    }

    #[test]
    fn wakes_are_collapsed() {
        let _trace = init_tracing();
        let cell = Arc::new(WaitCell::new());
        let mut task = waiter(&cell);

        assert_pending!(task.poll());
        assert!(cell.wake());
        assert!(!cell.wake(), "the waker was already taken");
        assert_ready_ok!(task.poll());

        let mut task = waiter(&cell);
        assert_pending!(task.poll(), "both wakes were consumed by the first wait");
    }

    #[test]
    fn new_waiter_evicts_previous_one() {
        let _trace = init_tracing();
        let cell = Arc::new(WaitCell::new());
        let mut first = waiter(&cell);
        let mut second = waiter(&cell);

        assert_pending!(first.poll());
        assert_pending!(second.poll());
        assert!(first.is_woken(), "evicted task must get a chance to re-register");

        assert!(cell.wake());
        assert!(second.is_woken());
        assert_ready_ok!(second.poll());
    }

    #[test]
    fn dropped_wait_takes_its_waker_along() {
        let _trace = init_tracing();
        let cell = Arc::new(WaitCell::new());
        let mut task = waiter(&cell);

        assert_pending!(task.poll());
        drop(task);

        assert!(!cell.wake(), "no task is registered anymore");
    }

    #[test]
    fn dropped_wait_keeps_newer_registration() {
        let _trace = init_tracing();
        let cell = Arc::new(WaitCell::new());
        let mut first = waiter(&cell);
        let mut second = waiter(&cell);

        assert_pending!(first.poll());
        assert_pending!(second.poll());
        drop(first);

        assert!(cell.wake());
        assert!(second.is_woken());
        assert_ready_ok!(second.poll());
    }

    #[test]
    fn satisfied_wait_for_leaves_no_registration() {
        let _trace = init_tracing();
        let cell = Arc::new(WaitCell::new());

        let mut task = task::spawn({
            let cell = cell.clone();
            async move { cell.wait_for(|| true).await }
        });
        assert_ready_ok!(task.poll());
        assert!(!task.is_woken());

        assert!(!cell.wake(), "the subscription was removed on return");
        assert!(!task.is_woken());
    }

    #[test]
    fn subscribe_catches_wake_before_first_poll() {
        let _trace = init_tracing();

        futures::executor::block_on(async {
            let cell = WaitCell::new();
            let wait = cell.subscribe().await;
            assert!(cell.wake());
            assert_eq!(wait.await, Ok(()));
        });
    }

    #[test]
    fn close_fails_current_and_future_waits() {
        let _trace = init_tracing();
        let cell = Arc::new(WaitCell::new());
        let mut task = waiter(&cell);

        assert_pending!(task.poll());
        assert!(cell.close());
        assert!(cell.is_closed());
        assert!(task.is_woken());
        assert_ready_eq!(task.poll(), Err(Closed::new()));

        let mut task = waiter(&cell);
        assert_ready_eq!(task.poll(), Err(Closed::new()));
        assert!(!cell.wake());
    }

    #[test]
    fn wait_for_sleeps_until_condition_holds() {
        let _trace = init_tracing();
        let cell = Arc::new(WaitCell::new());
        let level = Arc::new(AtomicU8::new(0));

        let mut task = task::spawn({
            let cell = cell.clone();
            let level = level.clone();
            async move { cell.wait_for(|| level.load(Ordering::Acquire) >= 2).await }
        });

        assert_pending!(task.poll());

        level.store(1, Ordering::Release);
        cell.wake();
        assert!(task.is_woken());
        assert_pending!(task.poll(), "woken, but the condition does not hold yet");

        level.store(2, Ordering::Release);
        cell.wake();
        assert!(task.is_woken());
        assert_ready_ok!(task.poll());
    }
}

#[cfg(all(loom, test))]
mod loom {
    use super::*;
    use crate::loom::{self, sync::Arc, thread};

    #[test]
    fn wake_races_registration() {
        loom::model(|| {
            let cell = Arc::new(WaitCell::new());

            let interrupt = thread::spawn({
                let cell = cell.clone();
                move || {
                    cell.wake();
                }
            });

            ::loom::future::block_on(cell.wait()).unwrap();
            interrupt.join().unwrap();
        });
    }

    #[test]
    fn close_races_registration() {
        loom::model(|| {
            let cell = Arc::new(WaitCell::new());

            let closer = thread::spawn({
                let cell = cell.clone();
                move || {
                    cell.close();
                }
            });

            let res = ::loom::future::block_on(cell.wait());
            closer.join().unwrap();
            assert_eq!(res, Err(Closed::new()));
        });
    }
}

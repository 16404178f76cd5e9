// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::Cell;
use core::fmt;

use critical_section::Mutex;

use crate::loom::loom_const_fn;
use crate::sync::{Closed, WaitCell};

/// A single-slot mailbox passing the latest value from an interrupt handler (or any other
/// context) to one waiting task.
///
/// Sending overwrites a value that was not received yet, so the receiver always sees the most
/// recent one. The slot is only touched inside a short [critical section](critical_section), so
/// neither sending nor receiving ever fails or waits on the other side.
///
/// A `Signal` has a single receiver: a second task waiting on the same signal would evict the
/// first one's waker.
///
/// ```ignore
/// static BUTTON: Signal<Level> = Signal::new();
///
/// fn gpiote_interrupt() {
///     BUTTON.send(read_pin());
/// }
/// ```
pub struct Signal<T> {
    value: Mutex<Cell<Option<T>>>,
    rx: WaitCell,
}

impl<T> Signal<T> {
    loom_const_fn! {
        pub const fn new() -> Signal<T> {
            Signal {
                value: Mutex::new(Cell::new(None)),
                rx: WaitCell::new(),
            }
        }
    }

    /// Stores `value`, replacing any value that was not received yet, and wakes the receiver.
    pub fn send(&self, value: T) {
        let overwritten = critical_section::with(|cs| self.value.borrow(cs).replace(Some(value)));
        tracing::trace!(overwritten = overwritten.is_some(), "Signal::send");
        drop(overwritten);

        self.rx.wake();
    }

    /// Takes the current value, if any.
    pub fn try_recv(&self) -> Option<T> {
        critical_section::with(|cs| self.value.borrow(cs).take())
    }

    /// Waits for a value to be sent.
    ///
    /// # Errors
    ///
    /// Returns [`Err`]`(`[`Closed`]`)` once the signal was [closed](Self::close) and no value is
    /// left.
    pub async fn recv(&self) -> Result<T, Closed> {
        self.rx.wait_for_value(|| self.try_recv()).await
    }

    /// Closes the signal, failing the pending and all future [`Signal::recv`] calls once the
    /// last value was taken.
    pub fn close(&self) {
        self.rx.close();
    }

    /// Returns `true` if a value is waiting to be received.
    pub fn is_full(&self) -> bool {
        critical_section::with(|cs| {
            let slot = self.value.borrow(cs);
            let value = slot.take();
            let full = value.is_some();
            slot.set(value);
            full
        })
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("full", &self.is_full())
            .field("rx", &self.rx)
            .finish()
    }
}

#[cfg(all(not(loom), test))]
mod tests {
    use std::sync::Arc;

    use tokio_test::{assert_pending, assert_ready_eq, task};

    use super::*;
    use crate::test_util::init_tracing;

    #[test]
    fn send_then_recv() {
        let _trace = init_tracing();
        let signal = Signal::new();

        assert!(!signal.is_full());
        signal.send(1);
        assert!(signal.is_full());
        assert_eq!(signal.try_recv(), Some(1));
        assert_eq!(signal.try_recv(), None);
    }

    #[test]
    fn send_overwrites_unreceived_value() {
        let _trace = init_tracing();
        let signal = Signal::new();

        signal.send("pressed");
        signal.send("released");
        assert_eq!(signal.try_recv(), Some("released"));
    }

    #[test]
    fn recv_waits_for_send() {
        let _trace = init_tracing();
        let signal = Arc::new(Signal::new());

        let mut task = task::spawn({
            let signal = signal.clone();
            async move { signal.recv().await }
        });

        assert_pending!(task.poll());
        assert!(!task.is_woken());

        signal.send(42);
        assert!(task.is_woken());
        assert_ready_eq!(task.poll(), Ok(42));
    }

    #[test]
    fn close_fails_recv() {
        let _trace = init_tracing();
        let signal = Arc::new(Signal::<u32>::new());

        let mut task = task::spawn({
            let signal = signal.clone();
            async move { signal.recv().await }
        });

        assert_pending!(task.poll());
        signal.close();
        assert!(task.is_woken());
        assert_ready_eq!(task.poll(), Err(Closed::new()));
    }

    #[test]
    fn send_from_other_thread() {
        let _trace = init_tracing();
        let signal = Arc::new(Signal::new());

        let sender = std::thread::spawn({
            let signal = signal.clone();
            move || {
                signal.send(7_u8);
            }
        });

        let value = futures::executor::block_on(signal.recv());
        assert_eq!(value, Ok(7));
        sender.join().unwrap();
    }

    #[test]
    fn send_never_loses_to_a_busy_receiver() {
        const LAST: u32 = 100_000;

        let _trace = init_tracing();
        let signal = Arc::new(Signal::new());

        let receiver = std::thread::spawn({
            let signal = signal.clone();
            move || {
                let mut prev = None;
                loop {
                    let Some(value) = signal.try_recv() else {
                        std::hint::spin_loop();
                        continue;
                    };
                    assert!(prev < Some(value), "{value} received after {prev:?}");
                    prev = Some(value);
                    if value == LAST {
                        break;
                    }
                }
            }
        });

        for value in 0..=LAST {
            signal.send(value);
        }
        receiver.join().unwrap();
        assert!(!signal.is_full());
    }
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![cfg(not(loom))]

use std::future::poll_fn;
use std::pin::{Pin, pin};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll, Waker};
use std::thread;

use static_exec::park::SpinPark;
use static_exec::sync::{Signal, WaitCell};
use static_exec::{Executor, SpawnError, TaskPool, TaskState, TaskStorage};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

fn init_tracing() -> DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .set_default()
}

/// Where a task parks its waker, standing in for an interrupt handler's registration.
struct WakerSlot(Mutex<Option<Waker>>);

impl WakerSlot {
    const fn new() -> Self {
        Self(Mutex::new(None))
    }

    fn register(&self, waker: &Waker) {
        *self.0.lock().unwrap() = Some(waker.clone());
    }

    fn take(&self) -> Waker {
        self.0.lock().unwrap().take().expect("no waker registered")
    }
}

/// Registers its waker and stays pending until it has been polled `pending_polls + 1` times.
struct WaitForInterrupt {
    slot: &'static WakerSlot,
    polls: &'static AtomicUsize,
    pending_polls: usize,
}

impl Future for WaitForInterrupt {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let polls = self.polls.fetch_add(1, Ordering::AcqRel);
        if polls >= self.pending_polls {
            return Poll::Ready(());
        }
        self.slot.register(cx.waker());
        Poll::Pending
    }
}

/// Completes on its first poll.
struct Immediate(&'static AtomicUsize);

impl Future for Immediate {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        self.0.fetch_add(1, Ordering::AcqRel);
        Poll::Ready(())
    }
}

#[test]
fn interrupt_wakes_pending_task() {
    static EXEC: Executor<SpinPark> = Executor::new(SpinPark::new());
    static TASK1: TaskStorage<WaitForInterrupt> = TaskStorage::new();
    static TASK2: TaskStorage<Immediate> = TaskStorage::new();
    static SLOT: WakerSlot = WakerSlot::new();
    static TASK1_POLLS: AtomicUsize = AtomicUsize::new(0);
    static TASK2_POLLS: AtomicUsize = AtomicUsize::new(0);

    let _trace = init_tracing();

    let task1 = EXEC
        .spawn(
            &TASK1,
            WaitForInterrupt {
                slot: &SLOT,
                polls: &TASK1_POLLS,
                pending_polls: 1,
            },
        )
        .unwrap();
    let task2 = EXEC.spawn(&TASK2, Immediate(&TASK2_POLLS)).unwrap();

    let tick = EXEC.tick();
    assert_eq!(tick.polled, 2);
    assert_eq!(tick.completed, 1);
    assert!(!tick.has_remaining);

    assert_eq!(task1.state(), TaskState::Idle);
    assert!(task1.is_active());
    assert!(!task2.is_active());
    assert!(!TASK2.is_active());

    // simulated interrupt
    let waker = SLOT.take();
    thread::spawn(move || waker.wake()).join().unwrap();
    assert_eq!(task1.state(), TaskState::Queued);

    let tick = EXEC.tick();
    assert_eq!(tick.polled, 1);
    assert_eq!(tick.completed, 1);
    assert!(!task1.is_active());
    assert_eq!(TASK1_POLLS.load(Ordering::Acquire), 2);
    assert_eq!(TASK2_POLLS.load(Ordering::Acquire), 1);
}

/// Wakes itself during its first poll.
struct SelfWake {
    polls: usize,
}

impl Future for SelfWake {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.polls += 1;
        if self.polls > 1 {
            return Poll::Ready(());
        }
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

#[test]
fn self_wake_requeues_task() {
    static EXEC: Executor<SpinPark> = Executor::new(SpinPark::new());
    static TASK3: TaskStorage<SelfWake> = TaskStorage::new();

    let _trace = init_tracing();

    let task3 = EXEC.spawn(&TASK3, SelfWake { polls: 0 }).unwrap();

    let tick = EXEC.tick();
    assert_eq!(tick.polled, 1);
    assert!(tick.has_remaining);
    assert_eq!(task3.state(), TaskState::Queued);

    let tick = EXEC.tick();
    assert_eq!(tick.polled, 1);
    assert_eq!(tick.completed, 1);
    assert!(!task3.is_active());
}

/// Records its name every time it's polled, then waits for an interrupt.
struct Recorder {
    name: char,
    log: &'static Mutex<Vec<char>>,
    slot: &'static WakerSlot,
}

impl Future for Recorder {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.log.lock().unwrap().push(self.name);
        self.slot.register(cx.waker());
        Poll::Pending
    }
}

#[test]
fn tasks_are_polled_in_wake_order() {
    static EXEC: Executor<SpinPark> = Executor::new(SpinPark::new());
    static TASKS: TaskPool<Recorder, 3> = TaskPool::new();
    static LOG: Mutex<Vec<char>> = Mutex::new(Vec::new());
    static SLOTS: [WakerSlot; 3] = [WakerSlot::new(), WakerSlot::new(), WakerSlot::new()];

    let _trace = init_tracing();

    for (name, slot) in ['A', 'B', 'C'].into_iter().zip(&SLOTS) {
        TASKS
            .spawn(
                &EXEC,
                Recorder {
                    name,
                    log: &LOG,
                    slot,
                },
            )
            .unwrap();
    }

    EXEC.tick();
    assert_eq!(*LOG.lock().unwrap(), ['A', 'B', 'C']);
    LOG.lock().unwrap().clear();

    // C, then A, then B
    for index in [2, 0, 1] {
        SLOTS[index].take().wake();
    }

    assert_eq!(EXEC.tick().polled, 3);
    assert_eq!(*LOG.lock().unwrap(), ['C', 'A', 'B']);
}

#[test]
fn concurrent_wakes_queue_task_once() {
    const THREADS: usize = 8;
    const WAKES: usize = 100;

    static EXEC: Executor<SpinPark> = Executor::new(SpinPark::new());
    static TASK: TaskStorage<WaitForInterrupt> = TaskStorage::new();
    static SLOT: WakerSlot = WakerSlot::new();
    static POLLS: AtomicUsize = AtomicUsize::new(0);

    let _trace = init_tracing();

    let task = EXEC
        .spawn(
            &TASK,
            WaitForInterrupt {
                slot: &SLOT,
                polls: &POLLS,
                pending_polls: 2,
            },
        )
        .unwrap();
    EXEC.tick();
    assert_eq!(task.state(), TaskState::Idle);

    let waker = SLOT.take();
    let threads: Vec<_> = (0..THREADS)
        .map(|_| {
            let waker = waker.clone();
            thread::spawn(move || {
                for _ in 0..WAKES {
                    waker.wake_by_ref();
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(task.state(), TaskState::Queued);
    let tick = EXEC.tick();
    assert_eq!(tick.polled, 1);
    assert!(!tick.has_remaining);
    assert_eq!(POLLS.load(Ordering::Acquire), 2);
}

/// Hands its waker to another thread during its first poll and doesn't return until that
/// thread has woken it.
struct WokenWhileRunning {
    slot: &'static WakerSlot,
    registered: &'static AtomicBool,
    woken: &'static AtomicBool,
    polls: usize,
}

impl Future for WokenWhileRunning {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.polls += 1;
        if self.polls > 1 {
            return Poll::Ready(());
        }

        self.slot.register(cx.waker());
        self.registered.store(true, Ordering::Release);
        while !self.woken.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        Poll::Pending
    }
}

#[test]
fn wake_while_running_is_not_lost() {
    static EXEC: Executor<SpinPark> = Executor::new(SpinPark::new());
    static TASK: TaskStorage<WokenWhileRunning> = TaskStorage::new();
    static SLOT: WakerSlot = WakerSlot::new();
    static REGISTERED: AtomicBool = AtomicBool::new(false);
    static WOKEN: AtomicBool = AtomicBool::new(false);

    let _trace = init_tracing();

    let task = EXEC
        .spawn(
            &TASK,
            WokenWhileRunning {
                slot: &SLOT,
                registered: &REGISTERED,
                woken: &WOKEN,
                polls: 0,
            },
        )
        .unwrap();

    let interrupt = thread::spawn(move || {
        while !REGISTERED.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        let before = task.state();
        SLOT.take().wake();
        let after = task.state();
        WOKEN.store(true, Ordering::Release);

        assert_eq!(before, TaskState::Running);
        assert_eq!(after, TaskState::RunningPendingRequeue);
    });

    let tick = EXEC.tick();
    interrupt.join().unwrap();

    assert!(tick.has_remaining);
    assert_eq!(task.state(), TaskState::Queued);
    assert_eq!(EXEC.tick().completed, 1);
}

#[test]
#[should_panic(expected = "stale waker")]
fn stale_waker_panics_after_respawn() {
    static EXEC: Executor<SpinPark> = Executor::new(SpinPark::new());
    static TASK: TaskStorage<WaitForInterrupt> = TaskStorage::new();
    static SLOT: WakerSlot = WakerSlot::new();
    static POLLS: [AtomicUsize; 2] = [AtomicUsize::new(0), AtomicUsize::new(0)];

    let _trace = init_tracing();

    let spawn = |polls| {
        EXEC.spawn(
            &TASK,
            WaitForInterrupt {
                slot: &SLOT,
                polls,
                pending_polls: 1,
            },
        )
    };

    let task = spawn(&POLLS[0]).unwrap();
    EXEC.tick();

    let stale = SLOT.take();
    stale.wake_by_ref();
    EXEC.tick();
    assert!(!task.is_active());

    // a woken task which completed ignores further wakes until the slot is reused
    stale.wake_by_ref();
    assert_eq!(task.state(), TaskState::Idle);

    let respawned = spawn(&POLLS[1]).unwrap();
    assert_eq!(respawned, task);
    assert_eq!(respawned.generation(), 2);

    stale.wake();
}

fn wait_until_ready(cell: &'static WaitCell) -> impl Future<Output = ()> + Send + 'static {
    async move { cell.wait_for(|| true).await.unwrap() }
}

#[test]
fn interrupt_after_respawn_of_satisfied_waiter() {
    static EXEC: Executor<SpinPark> = Executor::new(SpinPark::new());
    static CELL: WaitCell = WaitCell::new();

    let _trace = init_tracing();
    let storage: &'static TaskStorage<_> = Box::leak(Box::new(TaskStorage::new()));

    EXEC.spawn(storage, wait_until_ready(&CELL)).unwrap();
    assert_eq!(EXEC.tick().completed, 1);

    let respawned = EXEC.spawn(storage, wait_until_ready(&CELL)).unwrap();
    assert_eq!(respawned.generation(), 2);

    // the first incarnation's waker must be gone from the cell
    assert!(!CELL.wake());
    assert_eq!(EXEC.tick().completed, 1);
}

/// Registers with the cell once, then completes without waiting for the wakeup.
fn give_up_waiting(cell: &'static WaitCell) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let mut wait = pin!(cell.wait());
        poll_fn(|cx| {
            assert!(wait.as_mut().poll(cx).is_pending());
            Poll::Ready(())
        })
        .await;
    }
}

#[test]
fn interrupt_after_respawn_of_abandoned_waiter() {
    static EXEC: Executor<SpinPark> = Executor::new(SpinPark::new());
    static CELL: WaitCell = WaitCell::new();

    let _trace = init_tracing();
    let storage: &'static TaskStorage<_> = Box::leak(Box::new(TaskStorage::new()));

    EXEC.spawn(storage, give_up_waiting(&CELL)).unwrap();
    assert_eq!(EXEC.tick().completed, 1);

    // the new incarnation registers, evicting nothing stale
    EXEC.spawn(storage, give_up_waiting(&CELL)).unwrap();
    assert_eq!(EXEC.tick().completed, 1);

    EXEC.spawn(storage, give_up_waiting(&CELL)).unwrap();
    assert!(!CELL.wake());
}

#[test]
fn spawn_errors() {
    static EXEC: Executor<SpinPark> = Executor::new(SpinPark::new());
    static TASK: TaskStorage<WaitForInterrupt> = TaskStorage::new();
    static POOL: TaskPool<WaitForInterrupt, 2> = TaskPool::new();
    static SLOT: WakerSlot = WakerSlot::new();
    static POLLS: AtomicUsize = AtomicUsize::new(0);

    let _trace = init_tracing();

    let future = || WaitForInterrupt {
        slot: &SLOT,
        polls: &POLLS,
        pending_polls: usize::MAX,
    };

    EXEC.spawn(&TASK, future()).unwrap();
    let err = EXEC.spawn(&TASK, future()).unwrap_err();
    assert_eq!(err, SpawnError::AlreadyActive);
    assert_eq!(err.to_string(), "task storage is already in use");

    POOL.spawn(&EXEC, future()).unwrap();
    POOL.spawn(&EXEC, future()).unwrap();
    let err = POOL.spawn(&EXEC, future()).unwrap_err();
    assert_eq!(err, SpawnError::NoFreeSlot);
    assert_eq!(err.to_string(), "no free slot left in task pool");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Button {
    Pressed,
    Released,
}

#[test]
fn button_interrupt_drives_led_task() {
    static EXEC: Executor<SpinPark> = Executor::new(SpinPark::new());
    static BUTTON: Signal<Button> = Signal::new();
    static LED: AtomicBool = AtomicBool::new(false);
    static TOGGLES: AtomicUsize = AtomicUsize::new(0);

    let _trace = init_tracing();

    let led: &'static TaskStorage<_> = Box::leak(Box::new(TaskStorage::new()));
    EXEC.spawn(led, async {
        while let Ok(event) = BUTTON.recv().await {
            LED.store(event == Button::Pressed, Ordering::Release);
            TOGGLES.fetch_add(1, Ordering::AcqRel);
        }
        EXEC.stop();
    })
    .unwrap();

    let interrupts = thread::spawn(|| {
        for event in [Button::Pressed, Button::Released, Button::Pressed] {
            BUTTON.send(event);
            // wait for the LED task to pick it up before the next edge
            while BUTTON.is_full() {
                thread::yield_now();
            }
        }

        // let the last event be processed before closing the channel
        while TOGGLES.load(Ordering::Acquire) < 3 {
            thread::yield_now();
        }
        BUTTON.close();
    });

    EXEC.run();
    interrupts.join().unwrap();

    assert!(LED.load(Ordering::Acquire));
    assert_eq!(TOGGLES.load(Ordering::Acquire), 3);
    assert!(!led.is_active());
}

// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Deadline timers bound to an executor.
//!
//! A [`DeadlineTimer`] is armed with [`expires_from_now`] and waited on with
//! [`async_wait`]; the completion handler is delivered through the timer's
//! executor (via `post`, never inline) with `Ok(())` on expiry or
//! [`FibrioError::Canceled`] if the wait was canceled or superseded by
//! re-arming. Expirations are tracked by a single process-wide driver
//! thread, created on first use and never torn down.
//!
//! [`expires_from_now`]: DeadlineTimer::expires_from_now
//! [`async_wait`]: DeadlineTimer::async_wait

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;

use crate::error::{FibrioError, Result};
use crate::executor::ExecutorHandle;
use crate::handler::SmallFn;

type Waiter = Box<dyn FnOnce(Result<()>) + Send>;

struct TimerState {
    /// Absolute expiry, `None` until the timer is first armed.
    deadline: Option<Instant>,

    /// Bumped on every re-arm and cancel; driver entries carrying a stale
    /// generation are ignored.
    generation: u64,

    waiter: Option<Waiter>,
}

struct TimerShared {
    ex: ExecutorHandle,
    state: Mutex<TimerState>,
}

impl TimerShared {
    /// Delivers `status` to `waiter` through the executor queue.
    fn complete(&self, waiter: Waiter, status: Result<()>) {
        self.ex.post(SmallFn::new(move || waiter(status)));
    }
}

/// A one-shot timer delivering its completion through an executor.
///
/// Holds at most one pending wait at a time, which is all the task runtime
/// needs: a sleeping task re-arms and re-waits the same timer on every
/// [`Task::sleep`](crate::Task::sleep).
pub struct DeadlineTimer {
    shared: Arc<TimerShared>,
}

impl DeadlineTimer {
    /// Creates an unarmed timer bound to `ex`.
    pub fn new(ex: ExecutorHandle) -> DeadlineTimer {
        DeadlineTimer {
            shared: Arc::new(TimerShared {
                ex,
                state: Mutex::new(TimerState {
                    deadline: None,
                    generation: 0,
                    waiter: None,
                }),
            }),
        }
    }

    /// Arms the timer to expire after `duration`, canceling any pending
    /// wait. Returns the number of waits canceled.
    pub fn expires_from_now(&self, duration: Duration) -> usize {
        let canceled = {
            let mut state = self
                .shared
                .state
                .lock()
                .expect("unreachable: poisoned mutex");
            state.generation += 1;
            state.deadline = Some(Instant::now() + duration);
            state.waiter.take()
        };

        match canceled {
            Some(waiter) => {
                self.shared.complete(waiter, Err(FibrioError::Canceled));
                1
            }
            None => 0,
        }
    }

    /// Registers `handler` to run when the timer expires.
    ///
    /// The handler is posted to the timer's executor with `Ok(())` on
    /// expiry, or with [`FibrioError::Canceled`] if [`cancel`] or a re-arm
    /// gets there first. An unarmed timer is treated as already expired.
    ///
    /// # Panics
    ///
    /// Panics if a wait is already pending.
    ///
    /// [`cancel`]: DeadlineTimer::cancel
    pub fn async_wait<H>(&self, handler: H)
    where
        H: FnOnce(Result<()>) + Send + 'static,
    {
        let handler: Waiter = Box::new(handler);
        let registration = {
            let mut state = self
                .shared
                .state
                .lock()
                .expect("unreachable: poisoned mutex");
            assert!(
                state.waiter.is_none(),
                "deadline timer supports a single pending wait"
            );
            match state.deadline {
                Some(when) => {
                    state.waiter = Some(handler);
                    Ok((when, state.generation))
                }
                None => Err(handler),
            }
        };

        match registration {
            Ok((when, generation)) => {
                TIMER_DRIVER.register(when, generation, Arc::downgrade(&self.shared));
            }
            Err(handler) => {
                // Never armed: expiry is in the past.
                self.shared.complete(handler, Ok(()));
            }
        }
    }

    /// Cancels a pending wait, delivering [`FibrioError::Canceled`] to its
    /// handler. Returns the number of waits canceled.
    pub fn cancel(&self) -> usize {
        let canceled = {
            let mut state = self
                .shared
                .state
                .lock()
                .expect("unreachable: poisoned mutex");
            state.generation += 1;
            state.waiter.take()
        };

        match canceled {
            Some(waiter) => {
                self.shared.complete(waiter, Err(FibrioError::Canceled));
                1
            }
            None => 0,
        }
    }
}

impl fmt::Debug for DeadlineTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self
            .shared
            .state
            .lock()
            .expect("unreachable: poisoned mutex");
        f.debug_struct("DeadlineTimer")
            .field("deadline", &state.deadline)
            .field("generation", &state.generation)
            .field("pending_wait", &state.waiter.is_some())
            .finish()
    }
}

struct DriverEntry {
    when: Instant,
    seq: u64,
    generation: u64,
    timer: Weak<TimerShared>,
}

// `BinaryHeap` is a max-heap; reverse the ordering so the earliest deadline
// surfaces first. `seq` breaks ties to keep the order total.
impl Ord for DriverEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for DriverEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DriverEntry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for DriverEntry {}

struct TimerDriver {
    state: Mutex<DriverHeap>,
    wakeup: Condvar,
}

struct DriverHeap {
    entries: BinaryHeap<DriverEntry>,
    next_seq: u64,
}

lazy_static! {
    static ref TIMER_DRIVER: TimerDriver = TimerDriver::start();
}

impl TimerDriver {
    fn start() -> TimerDriver {
        let driver = TimerDriver {
            state: Mutex::new(DriverHeap {
                entries: BinaryHeap::new(),
                next_seq: 0,
            }),
            wakeup: Condvar::new(),
        };

        thread::Builder::new()
            .name("fibrio-timer".to_string())
            .spawn(|| TIMER_DRIVER.run())
            .expect("failed to spawn timer driver thread");

        driver
    }

    fn register(&self, when: Instant, generation: u64, timer: Weak<TimerShared>) {
        let mut state = self.state.lock().expect("unreachable: poisoned mutex");
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push(DriverEntry {
            when,
            seq,
            generation,
            timer,
        });
        self.wakeup.notify_one();
    }

    fn run(&self) {
        let mut state = self.state.lock().expect("unreachable: poisoned mutex");
        loop {
            let now = Instant::now();

            let mut due = Vec::new();
            while state
                .entries
                .peek()
                .map(|e| e.when <= now)
                .unwrap_or(false)
            {
                due.push(state.entries.pop().expect("peeked entry vanished"));
            }

            if !due.is_empty() {
                // Fire outside the lock: posting to an executor may call
                // back into `register`.
                drop(state);
                for entry in due {
                    Self::fire(entry);
                }
                state = self.state.lock().expect("unreachable: poisoned mutex");
                continue;
            }

            let next_deadline = state.entries.peek().map(|e| e.when);
            state = match next_deadline {
                Some(when) => {
                    let timeout = when.saturating_duration_since(now);
                    self.wakeup
                        .wait_timeout(state, timeout)
                        .expect("unreachable: poisoned mutex")
                        .0
                }
                None => self
                    .wakeup
                    .wait(state)
                    .expect("unreachable: poisoned mutex"),
            };
        }
    }

    fn fire(entry: DriverEntry) {
        let shared = match entry.timer.upgrade() {
            Some(shared) => shared,
            // Timer was dropped; nothing to deliver.
            None => return,
        };

        let waiter = {
            let mut state = shared.state.lock().expect("unreachable: poisoned mutex");
            if state.generation == entry.generation {
                state.waiter.take()
            } else {
                // Re-armed or canceled since this entry was queued.
                None
            }
        };

        if let Some(waiter) = waiter {
            shared.complete(waiter, Ok(()));
        }
    }
}

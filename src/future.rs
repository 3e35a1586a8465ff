// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! One-shot promise/future pair used as a completion signal.
//!
//! Unlike `std::future`, this is a callback-style primitive: a waiter
//! registers a handler via [`Future::async_wait`] and the handler fires on
//! whatever thread fulfills the promise (or immediately, if the value is
//! already there). The runtime uses it only as the join signal of a task,
//! but it composes with [`Task::await_with`](crate::Task::await_with) for
//! task-synchronous waiting via [`Future::wait`].

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::task::Task;

struct Shared<T> {
    state: Mutex<State<T>>,
}

enum State<T> {
    Pending(Vec<Box<dyn FnOnce(T) + Send>>),
    Ready(T),
}

/// The producing half: fulfill it once with [`Promise::set_value`].
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

/// The consuming half; cheap to clone, any number of waiters may register.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Creates an unfulfilled promise.
    pub fn new() -> Promise<T> {
        Promise {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending(Vec::new())),
            }),
        }
    }

    /// Returns a [`Future`] observing this promise.
    pub fn future(&self) -> Future<T> {
        Future {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Fulfills the promise, delivering `value` to every registered waiter.
    ///
    /// # Panics
    ///
    /// Panics if the promise was already fulfilled.
    pub fn set_value(&self, value: T) {
        let waiters = {
            let mut state = self.shared.state.lock().expect("unreachable: poisoned mutex");
            match &mut *state {
                State::Ready(_) => panic!("promise fulfilled twice"),
                State::Pending(waiters) => {
                    let waiters = std::mem::take(waiters);
                    *state = State::Ready(value.clone());
                    waiters
                }
            }
        };

        // Handlers run outside the lock; they may register new waiters on
        // sibling futures or drop the last reference to this promise.
        for waiter in waiters {
            waiter(value.clone());
        }
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Promise::new()
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// Registers `handler` to be invoked with the value.
    ///
    /// If the promise is already fulfilled, `handler` runs immediately on
    /// the calling thread; otherwise it runs later on the fulfilling thread.
    /// Each registered handler runs at most once.
    pub fn async_wait<H>(&self, handler: H)
    where
        H: FnOnce(T) + Send + 'static,
    {
        // When the value is already there the handler runs outside the lock,
        // since it may re-enter this future.
        let ready = {
            let mut state = self.shared.state.lock().expect("unreachable: poisoned mutex");
            match &mut *state {
                State::Ready(value) => Some((handler, value.clone())),
                State::Pending(waiters) => {
                    waiters.push(Box::new(handler));
                    None
                }
            }
        };

        if let Some((handler, value)) = ready {
            handler(value);
        }
    }

    /// Returns `true` iff the promise has been fulfilled.
    pub fn is_ready(&self) -> bool {
        matches!(
            &*self.shared.state.lock().expect("unreachable: poisoned mutex"),
            State::Ready(_)
        )
    }

    /// Waits for the value, task-synchronously.
    ///
    /// Inside a task this suspends the task until the promise is fulfilled;
    /// on a bare OS thread it spin-yields.
    pub fn wait(&self) -> T {
        Task::await_with(|h| self.async_wait(move |value| h.complete(value)))
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future").finish_non_exhaustive()
    }
}

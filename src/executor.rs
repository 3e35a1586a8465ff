// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! The executor contract consumed by tasks, and a default thread-pool
//! implementation of it.
//!
//! Tasks never run OS threads of their own; every resumption is handed to
//! an executor as a closure. The contract is deliberately small:
//!
//! * [`Executor::dispatch`] *may* run the closure inline on the calling
//!   thread (cheap when a completion fires on a thread that already belongs
//!   to the executor).
//! * [`Executor::post`] *must* enqueue the closure for later execution,
//!   never running it inline.
//!
//! A [`WorkGuard`] keeps the executor processing while at least one task is
//! alive, and [`ThreadPool::wait_idle`] lets a driver thread block until
//! all guards are gone.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::{cell::Cell, fmt, thread};

use crossbeam::channel::{self, Sender};

use crate::handler::SmallFn;

/// An asynchronous-work driver that tasks schedule their resumptions onto.
///
/// Implementations must be safe to call from any thread.
pub trait Executor: Send + Sync + 'static {
    /// Runs `f` on the executor. May run it inline, on the calling thread,
    /// before returning.
    fn dispatch(&self, f: SmallFn);

    /// Enqueues `f` to run on the executor. Must not run it inline.
    fn post(&self, f: SmallFn);

    /// A unit of outstanding work has been created (see [`WorkGuard`]).
    fn work_started(&self) {}

    /// A unit of outstanding work has finished.
    fn work_finished(&self) {}
}

/// The opaque, shareable handle a [`Task`](crate::Task) stores.
pub type ExecutorHandle = Arc<dyn Executor>;

/// RAII token that marks a unit of outstanding work on an executor.
///
/// Every task holds one for its whole lifetime, so an executor can tell
/// "temporarily empty queue" apart from "no more work will ever arrive".
pub struct WorkGuard {
    ex: ExecutorHandle,
}

impl WorkGuard {
    /// Registers a unit of work with `ex`.
    pub fn new(ex: &ExecutorHandle) -> WorkGuard {
        ex.work_started();
        WorkGuard { ex: Arc::clone(ex) }
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.ex.work_finished();
    }
}

impl fmt::Debug for WorkGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkGuard").finish_non_exhaustive()
    }
}

/// Process-wide source of pool identities, used to detect whether the
/// calling thread belongs to a given pool.
static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// The id of the pool this thread works for, or 0 for non-pool threads.
    static POOL_MEMBERSHIP: Cell<usize> = const { Cell::new(0) };
}

/// A fixed-size pool of worker OS threads draining a shared queue.
///
/// This is the crate's default [`Executor`]. `dispatch` runs the closure
/// inline when called from one of the pool's own workers and enqueues it
/// otherwise; `post` always enqueues.
///
/// Dropping the pool waits for outstanding [`WorkGuard`]s to be released,
/// then drains the queue and joins the workers.
pub struct ThreadPool {
    id: usize,
    tx: Sender<SmallFn>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    work: Mutex<usize>,
    idle: Condvar,
}

impl ThreadPool {
    /// Spawns a pool with `threads` workers.
    pub fn new(threads: usize) -> Arc<ThreadPool> {
        assert!(threads > 0, "a thread pool needs at least one worker");

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = channel::unbounded::<SmallFn>();

        let workers = (0..threads)
            .map(|i| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("fibrio-pool-{}-{}", id, i))
                    .spawn(move || {
                        POOL_MEMBERSHIP.with(|m| m.set(id));
                        while let Ok(f) = rx.recv() {
                            f.invoke();
                        }
                    })
                    .expect("failed to spawn pool worker thread")
            })
            .collect();

        Arc::new(ThreadPool {
            id,
            tx,
            workers: Mutex::new(workers),
            work: Mutex::new(0),
            idle: Condvar::new(),
        })
    }

    /// This pool as a type-erased [`ExecutorHandle`].
    pub fn handle(self: &Arc<Self>) -> ExecutorHandle {
        Arc::clone(self) as ExecutorHandle
    }

    /// Blocks the calling thread until no [`WorkGuard`]s remain.
    ///
    /// Must not be called from one of the pool's own workers.
    pub fn wait_idle(&self) {
        assert_ne!(
            POOL_MEMBERSHIP.with(|m| m.get()),
            self.id,
            "wait_idle called from a pool worker would deadlock"
        );
        let guard = self.work.lock().expect("unreachable: poisoned mutex");
        let _guard = self
            .idle
            .wait_while(guard, |outstanding| *outstanding > 0)
            .expect("unreachable: poisoned mutex");
    }

    fn enqueue(&self, f: SmallFn) {
        // Send can only fail after the workers have exited, which only
        // happens once the pool itself is torn down.
        self.tx.send(f).expect("thread pool has shut down");
    }
}

impl Executor for ThreadPool {
    fn dispatch(&self, f: SmallFn) {
        if POOL_MEMBERSHIP.with(|m| m.get()) == self.id {
            f.invoke();
        } else {
            self.enqueue(f);
        }
    }

    fn post(&self, f: SmallFn) {
        self.enqueue(f);
    }

    fn work_started(&self) {
        *self.work.lock().expect("unreachable: poisoned mutex") += 1;
    }

    fn work_finished(&self) {
        let mut work = self.work.lock().expect("unreachable: poisoned mutex");
        *work -= 1;
        if *work == 0 {
            self.idle.notify_all();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Wait for work guards before disconnecting, so queued resumptions
        // of still-live tasks are not lost.
        {
            let guard = self.work.lock().expect("unreachable: poisoned mutex");
            let _guard = self
                .idle
                .wait_while(guard, |outstanding| *outstanding > 0)
                .expect("unreachable: poisoned mutex");
        }

        // Disconnect the queue; workers exit after draining it.
        let (tx, _rx) = channel::unbounded();
        drop(std::mem::replace(&mut self.tx, tx));

        let workers = std::mem::take(&mut *self.workers.lock().expect("unreachable: poisoned mutex"));
        for worker in workers {
            worker.join().expect("pool worker panicked");
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("id", &self.id)
            .field(
                "outstanding_work",
                &*self.work.lock().expect("unreachable: poisoned mutex"),
            )
            .finish()
    }
}

// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! # Fibrio - stackful cooperative tasks over an asynchronous executor.
//!
//! Fibrio provides lightweight tasks (fibers) that multiplex over a pool of
//! OS threads driven by an external asynchronous executor. Each task owns a
//! private stack and may voluntarily suspend - yielding, sleeping, or
//! awaiting a completion - and later resume, turning callback-style
//! asynchronous operations into straight-line code inside the task body.
//!
//! ```
//! use fibrio::{Task, ThreadPool};
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//!
//! let pool = ThreadPool::new(2);
//! let done = Arc::new(AtomicBool::new(false));
//!
//! let flag = Arc::clone(&done);
//! let task = Task::spawn(&pool.handle(), move || {
//!     flag.store(true, Ordering::SeqCst);
//! })
//! .unwrap();
//!
//! task.join();
//! assert!(done.load(Ordering::SeqCst));
//! ```
//!
//! ## Bridging asynchronous completions
//!
//! [`Task::await_with`] converts any "give me a completion handler"
//! operation into a synchronous call inside a task. The handler may fire on
//! any thread, before or after the task suspends; the task's atomic state
//! word guarantees it resumes exactly once:
//!
//! ```
//! use fibrio::{Task, ThreadPool};
//!
//! let pool = ThreadPool::new(2);
//! let task = Task::spawn(&pool.handle(), || {
//!     let n: u32 = Task::await_with(|h| {
//!         std::thread::spawn(move || h.complete(7));
//!     });
//!     assert_eq!(n, 7);
//! })
//! .unwrap();
//! task.join();
//! ```
//!
//! ## Scheduling
//!
//! Tasks never own OS threads. Every resumption is handed to the bound
//! [`Executor`] either via `dispatch` (which may run inline on the calling
//! thread, saving a queue round-trip when a completion fires on an executor
//! thread) or via `post` (which always enqueues). A per-thread nesting
//! budget of [`MAX_NESTING_DEPTH`] inline dispatches bounds how much a
//! chain of completions can grow the OS stack.
//!
//! ## Diagnostics
//!
//! [`Task::backtrace_all`] dumps the state bits and stack trace of every
//! live task to stderr. Suspended tasks are traced safely: the capture
//! claims a state bit that removes the task from the ready set, resumes the
//! fiber just long enough for it to record its own trace, and re-schedules
//! it through the executor afterwards.

mod error;
mod executor;
mod future;
mod handler;
pub mod task;
mod timer;

pub use crate::error::{FibrioError, Result};
pub use crate::executor::{Executor, ExecutorHandle, ThreadPool, WorkGuard};
pub use crate::future::{Future, Promise};
pub use crate::handler::{SmallFn, HANDLER_MEMORY_BYTES};
pub use crate::task::{SignalHandler, Task, TaskBuilder, DEFAULT_STACK_SIZE, MAX_NESTING_DEPTH};
pub use crate::timer::DeadlineTimer;

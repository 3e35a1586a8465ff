// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Stackful cooperative tasks.
//!
//! A [`Task`] owns a private fiber stack and multiplexes over the OS
//! threads of an [`Executor`](crate::Executor). The body runs straight-line
//! code and suspends only at explicit points: [`Task::yield_now`],
//! [`Task::sleep`], [`Task::await_with`], and the implicit yield when the
//! body returns. Suspension parks the fiber in the task's continuation
//! slot; resumption is scheduled through the executor, with inline
//! `dispatch` bounded by a per-thread nesting budget so that completion
//! chains cannot grow the OS stack without bound.
//!
//! All lifecycle coordination happens through a single atomic state word
//! (see [`state`]): the task's own suspensions, completion handlers firing
//! on arbitrary threads, [`Task::wake`] calls, and diagnostic stack-trace
//! requests all reconcile through compare-exchange transitions on it.

pub(crate) mod debugging;
pub(crate) mod state;
#[cfg(test)]
mod tests;

use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{fmt, hint, mem, thread};

use backtrace::Backtrace;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListAtomicLink, UnsafeRef};
use lazy_static::lazy_static;
use scopeguard::defer;
use smallvec::SmallVec;

use crate::error::Result;
use crate::executor::{ExecutorHandle, WorkGuard};
use crate::future::Promise;
use crate::handler::SmallFn;
use crate::task::state::*;
use crate::timer::DeadlineTimer;

/// The upper bound on [`nesting_depth`]. When scheduling a task to run via
/// `dispatch` would increase the nesting depth on the current thread beyond
/// this bound, `post` is used instead.
pub const MAX_NESTING_DEPTH: usize = 8;

/// Default fiber stack size, in bytes.
pub const DEFAULT_STACK_SIZE: usize = 16 * 1024;

/// Added to the spawning task's priority when none is given explicitly.
const PRIORITY_BUMP: i32 = 100;

/// The continuation of a suspended task: its parked fiber stack.
type Fiber = Coroutine<(), (), ()>;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_THREAD_ID: AtomicI32 = AtomicI32::new(1000);

/// Returns the lowest unused global thread id; repeated calls return
/// monotonically increasing values.
pub(crate) fn next_thread_id() -> i32 {
    NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed)
}

/// The global id of the calling thread, assigned on first use.
pub(crate) fn this_thread_id() -> i32 {
    THIS_THREAD_ID.with(|id| *id)
}

fn next_task_id() -> u64 {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

thread_local! {
    static CURRENT_TASK: Cell<*const Task> = const { Cell::new(ptr::null()) };
    static NESTING_DEPTH: Cell<usize> = const { Cell::new(0) };
    static THIS_THREAD_ID: i32 = next_thread_id();
}

fn current_task_ptr() -> *const Task {
    CURRENT_TASK.with(|c| c.get())
}

/// Thread-local count of in-flight inline dispatches; bounds recursive
/// stack use on the calling OS thread.
pub(crate) fn nesting_depth() -> usize {
    NESTING_DEPTH.with(|d| d.get())
}

intrusive_adapter!(AllTasksAdapter = UnsafeRef<Task>: Task { all_tasks_link: LinkedListAtomicLink });

lazy_static! {
    /// Every live task, linked at construction and unlinked at destruction.
    /// Guarded by its mutex; created on first access, never destroyed.
    static ref ALL_TASKS: Mutex<LinkedList<AllTasksAdapter>> =
        Mutex::new(LinkedList::new(AllTasksAdapter::new()));
}

/// The three events that may affect a task's running/suspended state. See
/// [`Task::handle_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    /// The completion handler of an await has fired.
    HaveSignal,

    /// The task has suspended (or, at construction, starts suspended).
    Suspended,

    /// The task body has returned.
    Terminated,
}

/// A user-space cooperatively scheduled thread of control.
///
/// Constructed with [`Task::spawn`] or [`TaskBuilder::spawn`]; scheduled
/// onto the given executor immediately. The handle is shareable: any thread
/// may [`join`](Task::join), [`wake`](Task::wake), or register
/// [`call_when_done`](Task::call_when_done) callbacks.
///
/// Dropping the last handle to a task that has not yet terminated is a
/// programmer error and panics; keep the handle (or `join` it) until the
/// body has run to completion.
pub struct Task {
    id: u64,
    name: String,
    ex: ExecutorHandle,
    priority: AtomicI32,

    /// The atomic lifecycle bitset; see [`state`].
    state: AtomicU32,

    /// The suspended fiber. Non-empty iff the task is suspended and not
    /// terminal; the thread that transitions the task out of the ready
    /// state (or claims `STACK_TRACE`) has exclusive access.
    fiber: UnsafeCell<Option<Fiber>>,

    /// Pointer to the fiber's yielder: the continuation of whatever context
    /// most recently resumed the task. Non-null exactly while the body can
    /// run (between the prologue and `post_exit`).
    parent: AtomicPtr<Yielder<(), ()>>,

    /// Address captured by the prologue, used to estimate stack depth.
    stack_base: AtomicUsize,

    /// Lazily created on first sleep. Guarded by `SLEEP_TIMER_LOCK`.
    sleep_timer: UnsafeCell<Option<DeadlineTimer>>,

    /// Filled by the fiber during a diagnostic capture; guarded by the
    /// `STACK_TRACE` claim protocol.
    stack_trace: UnsafeCell<Option<Backtrace>>,

    /// Callbacks to run at termination, in registration order. Guarded by
    /// `COMPLETION_HANDLERS_LOCK`.
    completion_handlers: UnsafeCell<SmallVec<[SmallFn; 2]>>,

    /// One-shot join signal, fulfilled when the task reaches the terminal
    /// state.
    promise: Promise<()>,

    all_tasks_link: LinkedListAtomicLink,
}

// SAFETY: the non-`Sync` interior (`fiber`, `sleep_timer`, `stack_trace`,
// `completion_handlers`) is guarded by the state-word protocol: the fiber
// slot is touched only by the single thread that CAS-ed the task out of the
// ready state (or claimed `STACK_TRACE`), and the other cells each have a
// dedicated spin-lock bit. The fiber itself only contains `Send` captures
// (enforced by the `spawn` bounds).
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

/// Raw pointer to a task, passed into its own fiber. The fiber cannot
/// outlive the task that owns it, so dereferencing inside the fiber is
/// sound.
struct TaskPtr(*const Task);
unsafe impl Send for TaskPtr {}

/// Configures and spawns a [`Task`].
///
/// ```
/// use fibrio::{Task, TaskBuilder, ThreadPool};
///
/// let pool = ThreadPool::new(2);
/// let task = TaskBuilder::new()
///     .name("worker")
///     .stack_size(64 * 1024)
///     .spawn(&pool.handle(), || {
///         Task::yield_now();
///     })
///     .unwrap();
/// task.join();
/// ```
#[derive(Debug)]
pub struct TaskBuilder {
    name: String,
    stack_size: usize,
    priority: Option<i32>,
}

impl TaskBuilder {
    /// A builder with the default name, stack size, and priority.
    pub fn new() -> TaskBuilder {
        TaskBuilder {
            name: Task::default_name().to_string(),
            stack_size: DEFAULT_STACK_SIZE,
            priority: None,
        }
    }

    /// Human-readable task name, used in logs and diagnostic dumps.
    pub fn name(mut self, name: impl Into<String>) -> TaskBuilder {
        self.name = name.into();
        self
    }

    /// Fiber stack size in bytes. Defaults to [`DEFAULT_STACK_SIZE`].
    pub fn stack_size(mut self, bytes: usize) -> TaskBuilder {
        self.stack_size = bytes;
        self
    }

    /// Advisory priority. Defaults to the spawning task's priority plus
    /// 100, or 0 when spawned from outside any task.
    pub fn priority(mut self, priority: i32) -> TaskBuilder {
        self.priority = Some(priority);
        self
    }

    /// Allocates the fiber stack, runs the task prologue inside it, links
    /// the task into the global task list, and schedules its first run on
    /// `ex`.
    pub fn spawn<F>(self, ex: &ExecutorHandle, body: F) -> Result<Arc<Task>>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = DefaultStack::new(self.stack_size)?;
        let priority = self
            .priority
            .unwrap_or_else(|| Task::current_priority().saturating_add(PRIORITY_BUMP));

        let task = Arc::new(Task {
            id: next_task_id(),
            name: self.name,
            ex: Arc::clone(ex),
            priority: AtomicI32::new(priority),
            state: AtomicU32::new(SUSPENDED),
            fiber: UnsafeCell::new(None),
            parent: AtomicPtr::new(ptr::null_mut()),
            stack_base: AtomicUsize::new(0),
            sleep_timer: UnsafeCell::new(None),
            stack_trace: UnsafeCell::new(None),
            completion_handlers: UnsafeCell::new(SmallVec::new()),
            promise: Promise::new(),
            all_tasks_link: LinkedListAtomicLink::new(),
        });

        let entry = TaskPtr(Arc::as_ptr(&task));
        let work_ex = Arc::clone(ex);
        let mut fiber: Fiber = Coroutine::with_stack(stack, move |yielder, ()| {
            // Keeps the executor alive and processing while this task is.
            let _work = WorkGuard::new(&work_ex);

            // SAFETY: see `TaskPtr`.
            let task = unsafe { &*entry.0 };
            task.pre_entry(yielder);

            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
                log::warn!(
                    "task fn exited via panic [task='{}']: {}",
                    task.name,
                    panic_payload_text(&payload)
                );
            }

            task.post_exit();
        });

        // Enter the stack once so the prologue runs; the fiber suspends
        // straight back here.
        match fiber.resume(()) {
            CoroutineResult::Yield(()) => {}
            CoroutineResult::Return(()) => unreachable!("task prologue returned without suspending"),
        }

        // SAFETY: no other thread can observe the task yet.
        unsafe { *task.fiber.get() = Some(fiber) };

        {
            let mut all_tasks = ALL_TASKS.lock().expect("unreachable: poisoned mutex");
            // SAFETY: the task unlinks itself (under the same mutex) before
            // its memory is released; see `Drop`.
            all_tasks.push_back(unsafe { UnsafeRef::from_raw(Arc::as_ptr(&task)) });
        }

        task.handle_event(Event::Suspended);

        Ok(task)
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        TaskBuilder::new()
    }
}

impl Task {
    /// Spawns a task with default configuration; see [`TaskBuilder`].
    pub fn spawn<F>(ex: &ExecutorHandle, body: F) -> Result<Arc<Task>>
    where
        F: FnOnce() + Send + 'static,
    {
        TaskBuilder::new().spawn(ex, body)
    }

    /// The name given to tasks that were not named explicitly.
    pub fn default_name() -> &'static str {
        "(anonymous)"
    }

    /// Process-unique monotonic id assigned at construction.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Advisory priority. Not consulted by the scheduler; the executor
    /// decides which ready work runs.
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Updates the advisory priority.
    pub fn set_priority(&self, new_priority: i32) {
        self.priority.store(new_priority, Ordering::Relaxed);
    }

    /// The executor this task schedules its resumptions onto.
    pub fn executor(&self) -> &ExecutorHandle {
        &self.ex
    }

    /// Approximate bytes of fiber stack currently in use. Only meaningful
    /// when called from inside the task.
    pub fn stack_pos(&self) -> usize {
        let probe: u8 = 0;
        let probe = &probe as *const u8 as usize;
        self.stack_base.load(Ordering::Relaxed).abs_diff(probe)
    }

    /// Blocks (task-synchronously) until the task reaches the terminal
    /// state. Inside a task this suspends the caller; on a bare OS thread
    /// it spin-yields.
    pub fn join(&self) {
        self.promise.future().wait();
    }

    /// Cancels an in-progress [`Task::sleep`], causing it to return
    /// [`FibrioError::Canceled`](crate::FibrioError::Canceled).
    ///
    /// Returns `true` iff the task has ever slept (i.e. a sleep timer
    /// exists and accepted the cancellation request).
    pub fn wake(&self) -> bool {
        let _lock = self.spin_lock(SLEEP_TIMER_LOCK);

        // SAFETY: guarded by SLEEP_TIMER_LOCK.
        match unsafe { &*self.sleep_timer.get() } {
            Some(timer) => {
                timer.cancel();
                true
            }
            None => false,
        }
    }

    /// Registers `handler` to run when the task terminates. If the task has
    /// already terminated, `handler` runs immediately on the calling
    /// thread. Handlers run exactly once each, in registration order.
    pub fn call_when_done<H>(&self, handler: H)
    where
        H: FnOnce() + Send + 'static,
    {
        if self.state.load(Ordering::Acquire) & TERMINATED != 0 {
            handler();
            return;
        }

        let run_now = {
            let _lock = self.spin_lock(COMPLETION_HANDLERS_LOCK);

            // Termination publishes TERMINATED while holding this lock, so
            // a set bit here means the handler list has already been
            // drained and this handler must run directly.
            if self.state.load(Ordering::Acquire) & TERMINATED != 0 {
                Some(handler)
            } else {
                // SAFETY: guarded by COMPLETION_HANDLERS_LOCK.
                unsafe { (*self.completion_handlers.get()).push(SmallFn::new(handler)) };
                None
            }
        };

        if let Some(handler) = run_now {
            handler();
        }
    }

    /// The currently running task on this thread, if any.
    pub fn current() -> Option<Arc<Task>> {
        let ptr = current_task_ptr();
        if ptr.is_null() {
            None
        } else {
            // SAFETY: the pointer designates the task running on this
            // thread; it is alive for the duration of its run.
            Some(unsafe { (*ptr).to_arc() })
        }
    }

    /// The priority of the current task, or 0 outside any task.
    pub fn current_priority() -> i32 {
        let ptr = current_task_ptr();
        if ptr.is_null() {
            0
        } else {
            // SAFETY: as in `current`.
            unsafe { (*ptr).priority.load(Ordering::Relaxed) }
        }
    }

    /// Yields control from the current task, allowing other work to run;
    /// outside any task, yields the OS thread.
    pub fn yield_now() {
        let ptr = current_task_ptr();
        if ptr.is_null() {
            thread::yield_now();
            return;
        }
        // SAFETY: as in `current`.
        unsafe { (*ptr).yield_impl() }
    }

    /// Puts the current task to sleep for `duration`.
    ///
    /// Returns `Ok(())` on normal expiry, or
    /// [`FibrioError::Canceled`](crate::FibrioError::Canceled) if another
    /// thread [`wake`](Task::wake)s the task early. Outside any task this
    /// blocks the OS thread and always returns `Ok(())`.
    pub fn sleep(duration: Duration) -> Result<()> {
        let ptr = current_task_ptr();
        if ptr.is_null() {
            thread::sleep(duration);
            return Ok(());
        }
        // SAFETY: as in `current`.
        unsafe { (*ptr).sleep_impl(duration) }
    }

    /// Suspends the current task until an asynchronous event occurs.
    ///
    /// `f` is passed a [`SignalHandler`] that may travel to any thread;
    /// whenever it fires, `await_with` returns the value it was completed
    /// with. The handler may fire before `f` even returns (the completion
    /// may be synchronous), after the task has suspended, or anywhere in
    /// between; the state machine resumes the task exactly once.
    ///
    /// ```
    /// use fibrio::{Task, ThreadPool};
    ///
    /// let pool = ThreadPool::new(1);
    /// let task = Task::spawn(&pool.handle(), || {
    ///     let n = Task::await_with(|h| h.complete(42));
    ///     assert_eq!(n, 42);
    /// })
    /// .unwrap();
    /// task.join();
    /// ```
    ///
    /// On a bare OS thread (no current task), `f` is invoked with a
    /// handler backed by a one-shot slot and the thread spin-yields until
    /// it fires; no task bookkeeping is touched.
    pub fn await_with<R, F>(f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(SignalHandler<R>),
    {
        let ptr = current_task_ptr();
        if !ptr.is_null() {
            // SAFETY: as in `current`.
            return unsafe { (*ptr).await_impl(f) };
        }

        // Generic thread (non-task) implementation.
        let slot = Arc::new(ThreadSlot {
            value: Mutex::new(None),
            ready: std::sync::atomic::AtomicBool::new(false),
        });
        f(SignalHandler {
            inner: HandlerInner::Thread(Arc::clone(&slot)),
        });
        while !slot.ready.load(Ordering::Acquire) {
            thread::yield_now();
        }
        let value = slot
            .value
            .lock()
            .expect("unreachable: poisoned mutex")
            .take();
        value.expect("signal flag raised without a value")
    }

    //==#==========+==+=+=++=+++++++++++-+-+--+----- --- -- -  -  -   -
    // Lifecycle engine.

    /// Recovers an owning handle from a borrow.
    fn to_arc(&self) -> Arc<Task> {
        // SAFETY: tasks are only ever constructed inside an `Arc` (see
        // `TaskBuilder::spawn`), and `self` being alive keeps the strong
        // count nonzero across the increment.
        unsafe {
            Arc::increment_strong_count(self as *const Task);
            Arc::from_raw(self as *const Task)
        }
    }

    /// Invoked inside the fiber before the task body; captures the stack
    /// base, publishes the parent continuation, and suspends so that the
    /// body is first entered via the executor.
    fn pre_entry(&self, yielder: &Yielder<(), ()>) {
        log::trace!(
            "Task{{id={}, name='{}'}} created on thread {}",
            self.id,
            self.name,
            this_thread_id()
        );

        let base: u8 = 0;
        self.stack_base
            .store(&base as *const u8 as usize, Ordering::Relaxed);
        self.parent.store(
            yielder as *const Yielder<(), ()> as *mut Yielder<(), ()>,
            Ordering::Release,
        );

        yielder.suspend(());

        log::trace!(
            "Task{{id={}, name='{}'}} started on thread {}",
            self.id,
            self.name,
            this_thread_id()
        );
    }

    /// Invoked inside the fiber after the task body returns. Drains the
    /// completion handlers, publishes `TERMINATED`, and runs the handlers
    /// on the fiber stack. Returning from here ends the fiber; the final
    /// `Suspended` event (signaled by `run`) completes termination.
    fn post_exit(&self) {
        let handlers = {
            let _lock = self.spin_lock(COMPLETION_HANDLERS_LOCK);

            // TERMINATED is published while the handlers lock is held so a
            // concurrent `call_when_done` either sees the bit or enqueues
            // before the drain below. The task is still running, so this
            // event can produce neither a ready nor a terminal state.
            self.handle_event(Event::Terminated);

            // SAFETY: guarded by COMPLETION_HANDLERS_LOCK.
            unsafe { mem::take(&mut *self.completion_handlers.get()) }
        };

        self.parent.store(ptr::null_mut(), Ordering::Release);

        // A panicking handler would unwind through the fiber's final
        // context switch; contain it and abort instead.
        for handler in handlers {
            if panic::catch_unwind(AssertUnwindSafe(|| handler.invoke())).is_err() {
                log::error!(
                    "completion handler panicked [task='{}']; aborting",
                    self.name
                );
                std::process::abort();
            }
        }
    }

    /// Tells the task to handle an event which may affect its
    /// running/suspended state. Safe to invoke both from inside the task
    /// (typically `Suspended`/`Terminated`) and from arbitrary threads
    /// (typically `HaveSignal`).
    pub(crate) fn handle_event(&self, event: Event) {
        let mask = match event {
            Event::HaveSignal => HAVE_SIGNAL,
            Event::Suspended => SUSPENDED,
            Event::Terminated => TERMINATED,
        };

        let new_state = self.state.fetch_or(mask, Ordering::AcqRel) | mask;

        if is_ready_state(new_state) {
            self.schedule_to_run(new_state, false);
        } else if is_terminal_state(new_state) {
            log::trace!("Task{{id={}, name='{}'}} exiting", self.id, self.name);
            self.promise.set_value(());
            // Nothing may run on the task after the join promise is set:
            // a joiner is now free to destroy it.
        }
    }

    /// Clears `SUSPENDED | NEED_SIGNAL | HAVE_SIGNAL` and resumes the task
    /// via its executor. With `force_post`, the resumption is always
    /// enqueued; otherwise it is dispatched (possibly inline) while the
    /// per-thread nesting depth stays under [`MAX_NESTING_DEPTH`].
    /// `observed_state` is the last observed value of the state word.
    pub(crate) fn schedule_to_run(&self, mut observed_state: u32, force_post: bool) {
        loop {
            if !is_ready_state(observed_state) {
                // Someone else already claimed the resumption.
                return;
            }
            let target_state = observed_state & !(SUSPENDED | NEED_SIGNAL | HAVE_SIGNAL);
            match self.state.compare_exchange_weak(
                observed_state,
                target_state,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => observed_state = actual,
            }
        }

        let this = self.to_arc();
        let activation = SmallFn::new(move || this.run());

        if !force_post && nesting_depth() < MAX_NESTING_DEPTH {
            NESTING_DEPTH.with(|d| d.set(d.get() + 1));
            defer! {
                NESTING_DEPTH.with(|d| d.set(d.get() - 1));
            }
            self.ex.dispatch(activation);
        } else {
            self.ex.post(activation);
        }
    }

    /// Resumes the task once: re-acquires the sleep-timer lock if it was
    /// held across the last suspension, runs the fiber until it suspends
    /// (or returns), parks the lock again if need be, and signals the
    /// suspension.
    fn run(&self) {
        let mut observed_state = self.state.load(Ordering::Acquire);
        if observed_state & SLEEP_TIMER_LOCK_SUSPEND != 0 {
            loop {
                if observed_state & SLEEP_TIMER_LOCK != 0 {
                    // Someone else holds the timer lock right now; wait for
                    // it before resuming the task that logically owns it.
                    hint::spin_loop();
                    observed_state = self.state.load(Ordering::Acquire);
                    continue;
                }
                let target_state =
                    (observed_state & !SLEEP_TIMER_LOCK_SUSPEND) | SLEEP_TIMER_LOCK;
                match self.state.compare_exchange_weak(
                    observed_state,
                    target_state,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => observed_state = actual,
                }
            }
        }

        self.resume_impl();

        // If the task suspended while holding the sleep-timer lock, release
        // it for the duration of the suspension and mark it for
        // re-acquisition.
        let mut observed_state = self.state.load(Ordering::Acquire);
        if observed_state & SLEEP_TIMER_LOCK != 0 {
            loop {
                let target_state = (observed_state & !SLEEP_TIMER_LOCK) | SLEEP_TIMER_LOCK_SUSPEND;
                match self.state.compare_exchange_weak(
                    observed_state,
                    target_state,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => observed_state = actual,
                }
            }
        }

        self.handle_event(Event::Suspended);
    }

    /// Switches the current thread into the task's fiber and back.
    pub(crate) fn resume_impl(&self) {
        let saved_task = CURRENT_TASK.with(|c| c.replace(self as *const Task));
        defer! {
            CURRENT_TASK.with(|c| c.set(saved_task));
        }

        // SAFETY: the caller is the unique thread that transitioned this
        // task out of the ready state (or holds the STACK_TRACE claim), so
        // it has exclusive access to the continuation slot.
        let mut fiber = unsafe { (*self.fiber.get()).take() }
            .expect("resuming a task with no suspended continuation");

        match fiber.resume(()) {
            CoroutineResult::Yield(()) => {
                // SAFETY: as above; still the exclusive owner.
                unsafe { *self.fiber.get() = Some(fiber) };
            }
            CoroutineResult::Return(()) => {
                // The body returned; the slot stays empty and the task will
                // never be resumed again.
            }
        }
    }

    /// Suspends the task, resuming the parent context. Services stack-trace
    /// requests without becoming schedulable.
    fn yield_impl(&self) {
        let parent = self.parent.load(Ordering::Acquire);
        assert!(
            !parent.is_null(),
            "yield from outside the task body; state={}",
            format_state(self.state.load(Ordering::Relaxed))
        );
        // SAFETY: non-null `parent` points at the yielder of this task's
        // live fiber, valid until `post_exit`.
        let yielder = unsafe { &*parent };

        loop {
            yielder.suspend(());

            // If a stack trace has been requested, record it and stay
            // suspended from the scheduler's point of view.
            if self.state.load(Ordering::Acquire) & STACK_TRACE != 0 {
                // SAFETY: published to the requesting thread by the next
                // suspension; see `try_dump_stack_trace`.
                unsafe { *self.stack_trace.get() = Some(Backtrace::new()) };
                continue;
            }
            break;
        }

        assert!(ptr::eq(current_task_ptr(), self));
        assert!(!self.parent.load(Ordering::Acquire).is_null());
    }

    fn await_impl<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(SignalHandler<R>),
    {
        let mut result: Option<R> = None;

        // NEED_SIGNAL must be set before the handler can possibly fire,
        // even synchronously inside `f`.
        let prior_state = self.state.fetch_or(NEED_SIGNAL, Ordering::AcqRel);
        assert_eq!(
            prior_state & HAVE_SIGNAL,
            0,
            "await with a signal already pending; state={}",
            format_state(prior_state)
        );

        f(SignalHandler {
            inner: HandlerInner::Task {
                task: self.to_arc(),
                slot: SlotPtr(NonNull::from(&mut result)),
            },
        });

        // Suspend; the task is not ready until the HAVE_SIGNAL event has
        // been handled.
        self.yield_impl();

        result
            .take()
            .expect("task resumed from await without a signal value")
    }

    fn sleep_impl(&self, duration: Duration) -> Result<()> {
        let _lock = self.spin_lock(SLEEP_TIMER_LOCK);

        // SAFETY: guarded by SLEEP_TIMER_LOCK.
        let timer = unsafe { &mut *self.sleep_timer.get() };
        let timer = timer.get_or_insert_with(|| DeadlineTimer::new(Arc::clone(&self.ex)));

        timer.expires_from_now(duration);

        self.await_impl(|handler| {
            timer.async_wait(move |status| handler.complete(status));
        })
    }

    //==#==========+==+=+=++=+++++++++++-+-+--+----- --- -- -  -  -   -
    // Spin locks.

    /// Acquires a spin lock on the given state bit. `lock_mask` must be
    /// `SLEEP_TIMER_LOCK` or `COMPLETION_HANDLERS_LOCK`; the locks are not
    /// recursive.
    fn spin_lock(&self, lock_mask: u32) -> SpinGuard<'_> {
        debug_assert!(lock_mask == SLEEP_TIMER_LOCK || lock_mask == COMPLETION_HANDLERS_LOCK);
        let mut prior_state = 0;
        while !self.try_spin_lock(lock_mask, &mut prior_state) {
            thread::yield_now();
        }
        SpinGuard {
            task: self,
            mask: lock_mask,
        }
    }

    /// Tries once to acquire the lock; sets `prior_state` to the last
    /// observed state word.
    fn try_spin_lock(&self, lock_mask: u32, prior_state: &mut u32) -> bool {
        *prior_state = self.state.fetch_or(lock_mask, Ordering::AcqRel);
        *prior_state & lock_mask == 0
    }

    fn spin_unlock(&self, lock_mask: u32) {
        self.state.fetch_and(!lock_mask, Ordering::AcqRel);
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        let state = self.state.load(Ordering::Acquire);
        assert!(
            is_terminal_state(state),
            "task destroyed before terminating; state={}",
            format_state(state)
        );
        assert!(self.parent.load(Ordering::Relaxed).is_null());
        // SAFETY: last reference; nothing else can touch the slot.
        assert!(unsafe { (*self.fiber.get()).is_none() });

        if self.all_tasks_link.is_linked() {
            let mut all_tasks = ALL_TASKS.lock().expect("unreachable: poisoned mutex");
            // SAFETY: the link is only ever inserted into ALL_TASKS.
            let mut cursor = unsafe { all_tasks.cursor_mut_from_ptr(self) };
            cursor.remove();
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &format_state(self.state.load(Ordering::Relaxed)))
            .field("priority", &self.priority.load(Ordering::Relaxed))
            .finish()
    }
}

/// Pointer to the `Option<R>` slot in the awaiting frame on the fiber
/// stack.
struct SlotPtr<R>(NonNull<Option<R>>);

// SAFETY: the pointee is only written while the NEED_SIGNAL protocol keeps
// the awaiting frame alive, and `R: Send` is enforced where the handler is
// created.
unsafe impl<R: Send> Send for SlotPtr<R> {}

struct ThreadSlot<R> {
    value: Mutex<Option<R>>,
    ready: std::sync::atomic::AtomicBool,
}

enum HandlerInner<R> {
    /// Wakes a suspended task out of its await.
    Task { task: Arc<Task>, slot: SlotPtr<R> },

    /// Releases a bare OS thread spinning in `await_with`.
    Thread(Arc<ThreadSlot<R>>),
}

/// The completion handler handed to the function passed to
/// [`Task::await_with`].
///
/// May be sent to any thread and fired at any time, including synchronously
/// before `await_with`'s function argument returns. Fires exactly once:
/// [`complete`](SignalHandler::complete) consumes it.
pub struct SignalHandler<R> {
    inner: HandlerInner<R>,
}

impl<R: Send + 'static> SignalHandler<R> {
    /// Delivers `value`, waking the awaiting task (or thread).
    pub fn complete(self, value: R) {
        // The handler has fired; keep `Drop` (the unfired-handler check)
        // from running while `inner` is moved out.
        let this = mem::ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so `inner` is read exactly once.
        let inner = unsafe { ptr::read(&this.inner) };

        match inner {
            HandlerInner::Task { task, slot } => {
                // SAFETY: NEED_SIGNAL was set before this handler was
                // handed out, so the awaiting frame (and the slot within
                // it) stays alive until the HAVE_SIGNAL event resumes the
                // task; the state-word release/acquire pair orders this
                // write before the task reads the slot.
                unsafe { *slot.0.as_ptr() = Some(value) };
                task.handle_event(Event::HaveSignal);
            }
            HandlerInner::Thread(slot) => {
                *slot.value.lock().expect("unreachable: poisoned mutex") = Some(value);
                slot.ready.store(true, Ordering::Release);
            }
        }
    }
}

impl<R> Drop for SignalHandler<R> {
    fn drop(&mut self) {
        // An unfired handler leaves its awaiter suspended forever. Unwinds
        // already in flight get a pass: they drop the handler on the way to
        // their own failure report.
        debug_assert!(
            thread::panicking(),
            "signal handler dropped without completing"
        );
    }
}

impl<R> fmt::Debug for SignalHandler<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.inner {
            HandlerInner::Task { task, .. } => task.name(),
            HandlerInner::Thread(_) => "(thread)",
        };
        f.debug_struct("SignalHandler")
            .field("target", &target)
            .finish()
    }
}

struct SpinGuard<'a> {
    task: &'a Task,
    mask: u32,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.task.spin_unlock(self.mask);
    }
}

fn panic_payload_text(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

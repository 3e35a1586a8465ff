// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Diagnostics that capture the state of in-flight tasks and allow
//! third-party code to introspect into the state of the runtime.
//!
//! The interesting problem here is taking a stack trace of a *suspended*
//! task without racing its scheduler: the capture claims the `STACK_TRACE`
//! bit, which removes the task from the ready set, then resumes the fiber
//! synchronously so it records its own trace and suspends again. From the
//! scheduler's point of view the task never ran.

use std::sync::atomic::Ordering;

use crate::task::state::*;
use crate::task::{Task, ALL_TASKS};

impl Task {
    /// Attempts to collect a stack trace from the task, dumping it to
    /// stderr if successful. Fails if the task is running, ready to run,
    /// terminated, or already being traced. Returns `true` iff successful.
    pub fn try_dump_stack_trace(&self) -> bool {
        let mut observed_state = self.state.load(Ordering::Acquire);
        loop {
            if is_running_state(observed_state)
                || is_ready_state(observed_state)
                || is_terminal_state(observed_state)
                || observed_state & STACK_TRACE != 0
            {
                return false;
            }
            let target_state = observed_state | STACK_TRACE;
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

        eprintln!(
            "(suspended) state={} [timer-susp,hdlr-lock,timer-lock,trace,term,susp,have,need] (0=running)",
            format_state(self.state.load(Ordering::Relaxed))
        );

        // The STACK_TRACE claim gives this thread exclusive access to the
        // fiber: the task is suspended and cannot become ready while the
        // bit is set. The fiber records its trace and suspends again.
        self.resume_impl();

        // SAFETY: the fiber published the trace before suspending back.
        let trace = unsafe { (*self.stack_trace.get()).take() };
        let trace = trace.expect("traced task suspended without recording a stack trace");
        eprintln!("{:?}", trace);

        let after_state = self.state.fetch_and(!STACK_TRACE, Ordering::AcqRel) & !STACK_TRACE;

        // The caller may be holding the global task-list mutex, so the
        // resumption must go through the executor queue rather than run
        // inline.
        self.schedule_to_run(after_state, /*force_post=*/ true);

        true
    }

    /// Dumps stack traces and state bits of all live tasks to stderr.
    /// Returns the number of live tasks.
    pub fn backtrace_all() -> usize {
        let all_tasks = ALL_TASKS.lock().expect("unreachable: poisoned mutex");
        let mut count = 0;
        eprintln!();
        for task in all_tasks.iter() {
            eprintln!(
                "-- Task{{id={}, name='{}'}} -------------",
                task.id(),
                task.name()
            );
            if !task.try_dump_stack_trace() {
                eprintln!("(running)");
            }
            eprintln!();
            count += 1;
        }
        eprintln!("{} tasks are active", count);
        count
    }
}

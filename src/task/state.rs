// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
/// Set when code within the task requests a signal, because it is awaiting
/// some external async event.
///
/// Always set before the completion handler is handed out, so a handler
/// firing early (even inside the function that received it) still pairs
/// correctly with [`HAVE_SIGNAL`].
pub(crate) const NEED_SIGNAL: u32 = 1 << 0;

/// Set when the completion handler generated by an await is invoked.
///
/// A task with both [`NEED_SIGNAL`] and `HAVE_SIGNAL` set has received the
/// event it was waiting for and becomes ready once it is also suspended.
pub(crate) const HAVE_SIGNAL: u32 = 1 << 1;

/// Set when the task is not currently running.
///
/// While this flag is set (and the task has not terminated), the task's
/// suspended stack is parked in its continuation slot. Exactly one thread
/// may clear this flag, via the compare-exchange in `schedule_to_run`; that
/// thread becomes responsible for the next resumption.
pub(crate) const SUSPENDED: u32 = 1 << 2;

/// Indicates the task has finished execution.
///
/// `SUSPENDED | TERMINATED` is the absorbing terminal state: once both are
/// set, the lifecycle bits never change again.
pub(crate) const TERMINATED: u32 = 1 << 3;

/// Set to request that the task collect a stack trace the next time it
/// resumes.
///
/// While set, the task is not ready, so the scheduler leaves it alone and a
/// diagnostic thread can resume it synchronously without racing.
pub(crate) const STACK_TRACE: u32 = 1 << 4;

/// Spin-lock bit serializing access to the sleep timer member of the task.
pub(crate) const SLEEP_TIMER_LOCK: u32 = 1 << 5;

/// Spin-lock bit serializing access to the completion-handlers list.
pub(crate) const COMPLETION_HANDLERS_LOCK: u32 = 1 << 6;

/// Saves the value of the [`SLEEP_TIMER_LOCK`] bit while the task is
/// suspended.
///
/// A task must not hold any spin lock across a suspension. When a task
/// yields while holding the sleep-timer lock, `run` releases the lock and
/// sets this bit instead; the next `run` re-acquires the lock before
/// resuming the task. The two bits are never set simultaneously.
pub(crate) const SLEEP_TIMER_LOCK_SUSPEND: u32 = 1 << 7;

/// The number of state flags defined above.
pub(crate) const NUM_STATE_FLAGS: usize = 8;

/// Returns true iff the given state is *not* a suspended state.
pub(crate) const fn is_running_state(state: u32) -> bool {
    state & SUSPENDED == 0
}

/// Returns true iff the task is not currently running, but is ready to be
/// resumed.
pub(crate) const fn is_ready_state(state: u32) -> bool {
    // Suspended, not terminated...
    (state & (SUSPENDED | TERMINATED)) == SUSPENDED

        // ...either not waiting for a signal, or the signal has arrived...
        && ((state & (NEED_SIGNAL | HAVE_SIGNAL)) == 0
            || (state & (NEED_SIGNAL | HAVE_SIGNAL)) == (NEED_SIGNAL | HAVE_SIGNAL))

        // ...and no stack trace has been requested.
        && (state & STACK_TRACE) == 0
}

/// Returns true iff the passed state represents a fully terminated task.
pub(crate) const fn is_terminal_state(state: u32) -> bool {
    state & (SUSPENDED | TERMINATED) == (SUSPENDED | TERMINATED)
}

/// Renders the low [`NUM_STATE_FLAGS`] bits of `state` for diagnostics,
/// most significant first: timer-suspend, handlers-lock, timer-lock, trace,
/// terminated, suspended, have-signal, need-signal.
pub(crate) fn format_state(state: u32) -> String {
    format!(
        "{:0width$b}",
        state & ((1 << NUM_STATE_FLAGS) - 1),
        width = NUM_STATE_FLAGS
    )
}

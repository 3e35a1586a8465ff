// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::state::*;
use super::{nesting_depth, Task, TaskBuilder, MAX_NESTING_DEPTH};
use crate::executor::ThreadPool;
use crate::future::Promise;
use crate::FibrioError;

fn init_logger() {
    pretty_env_logger::try_init().ok();
}

#[test]
fn hello_task() {
    init_logger();
    let pool = ThreadPool::new(2);
    let done = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&done);
    let task = Task::spawn(&pool.handle(), move || {
        flag.store(true, Ordering::SeqCst);
    })
    .unwrap();

    task.join();
    assert!(done.load(Ordering::SeqCst));
    assert!(is_terminal_state(task.state.load(Ordering::SeqCst)));
}

#[test]
fn terminal_state_is_absorbing() {
    init_logger();
    let pool = ThreadPool::new(2);
    let task = Task::spawn(&pool.handle(), || {}).unwrap();
    task.join();

    // Poke at the task after termination; the lifecycle bits must not move.
    assert!(!task.wake());
    task.set_priority(7);
    for _ in 0..100 {
        let state = task.state.load(Ordering::SeqCst);
        assert!(is_terminal_state(state), "state={}", format_state(state));
    }
}

#[test]
fn body_runs_as_the_current_task() {
    init_logger();
    let pool = ThreadPool::new(1);
    let seen_id = Arc::new(AtomicUsize::new(0));

    let slot = Arc::clone(&seen_id);
    let task = Task::spawn(&pool.handle(), move || {
        let current = Task::current().expect("no current task inside a task body");
        slot.store(current.id() as usize, Ordering::SeqCst);
    })
    .unwrap();

    task.join();
    assert_eq!(seen_id.load(Ordering::SeqCst), task.id() as usize);
}

#[test]
fn ping_pong() {
    init_logger();
    let pool = ThreadPool::new(2);
    let ex = pool.handle();

    let count_a = Arc::new(AtomicUsize::new(0));
    let count_b = Arc::new(AtomicUsize::new(0));

    let spawn_yielder = |count: Arc<AtomicUsize>| {
        Task::spawn(&ex, move || {
            count.fetch_add(1, Ordering::SeqCst);
            for _ in 0..100 {
                Task::yield_now();
                count.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap()
    };

    let a = spawn_yielder(Arc::clone(&count_a));
    let b = spawn_yielder(Arc::clone(&count_b));

    a.join();
    b.join();
    assert_eq!(count_a.load(Ordering::SeqCst), 101);
    assert_eq!(count_b.load(Ordering::SeqCst), 101);
}

#[test]
fn synchronous_await() {
    init_logger();
    let pool = ThreadPool::new(1);
    let fired = Arc::new(AtomicUsize::new(0));

    let fires = Arc::clone(&fired);
    let task = Task::spawn(&pool.handle(), move || {
        let n: i32 = Task::await_with(|h| {
            fires.fetch_add(1, Ordering::SeqCst);
            h.complete(42);
        });
        assert_eq!(n, 42);
    })
    .unwrap();

    task.join();
    // The handler fired exactly once, before the await returned.
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn asynchronous_await() {
    init_logger();
    let pool = ThreadPool::new(2);

    let task = Task::spawn(&pool.handle(), || {
        let n: i32 = Task::await_with(|h| {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                h.complete(7);
            });
        });
        assert_eq!(n, 7);

        // The completion arrived from a foreign thread, so the resumption
        // went through the executor queue back onto a pool worker.
        let name = thread::current().name().unwrap_or("").to_string();
        assert!(name.starts_with("fibrio-pool-"), "resumed on '{}'", name);
    })
    .unwrap();

    task.join();
}

#[test]
fn await_outside_any_task() {
    init_logger();
    let n: u32 = Task::await_with(|h| {
        thread::spawn(move || h.complete(19));
    });
    assert_eq!(n, 19);
}

#[test]
fn nesting_depth_stays_bounded() {
    init_logger();
    let pool = ThreadPool::new(1);
    let max_seen = Arc::new(AtomicUsize::new(0));

    let max = Arc::clone(&max_seen);
    let task = Task::spawn(&pool.handle(), move || {
        // Synchronously completed awaits re-dispatch inline, nesting the
        // scheduler on the worker's OS stack until the budget runs out.
        for _ in 0..100 {
            let _: u8 = Task::await_with(|h| h.complete(1));
            max.fetch_max(nesting_depth(), Ordering::SeqCst);
        }
    })
    .unwrap();

    task.join();
    assert!(max_seen.load(Ordering::SeqCst) <= MAX_NESTING_DEPTH);
}

#[test]
fn sleep_then_wake() {
    init_logger();
    let pool = ThreadPool::new(2);
    let outcome = Arc::new(Mutex::new(None));

    let slot = Arc::clone(&outcome);
    let sleeper = Task::spawn(&pool.handle(), move || {
        let res = Task::sleep(Duration::from_secs(10));
        *slot.lock().unwrap() = Some(res);
    })
    .unwrap();

    let started = Instant::now();
    thread::sleep(Duration::from_millis(10));

    // The sleeper may not have reached its first sleep yet, in which case
    // there is no timer to cancel; retry until the wake lands.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !sleeper.wake() {
        assert!(Instant::now() < deadline, "sleeper never created its timer");
        thread::yield_now();
    }

    sleeper.join();
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "wake did not interrupt the sleep"
    );
    let res = outcome.lock().unwrap().take().expect("sleeper never ran");
    assert!(matches!(res, Err(FibrioError::Canceled)));
}

#[test]
fn sleep_expires_normally() {
    init_logger();
    let pool = ThreadPool::new(1);
    let outcome = Arc::new(Mutex::new(None));

    let slot = Arc::clone(&outcome);
    let task = Task::spawn(&pool.handle(), move || {
        let started = Instant::now();
        let res = Task::sleep(Duration::from_millis(20));
        *slot.lock().unwrap() = Some((res, started.elapsed()));
    })
    .unwrap();

    task.join();
    let (res, elapsed) = outcome.lock().unwrap().take().unwrap();
    assert!(res.is_ok());
    assert!(elapsed >= Duration::from_millis(20));
}

#[test]
fn wake_before_any_sleep_reports_no_timer() {
    init_logger();
    let pool = ThreadPool::new(2);
    let release = Arc::new(AtomicBool::new(false));

    let gate = Arc::clone(&release);
    let task = Task::spawn(&pool.handle(), move || {
        while !gate.load(Ordering::SeqCst) {
            Task::yield_now();
        }
    })
    .unwrap();

    assert!(!task.wake());
    release.store(true, Ordering::SeqCst);
    task.join();
}

#[test]
fn no_spin_lock_held_across_sleep_suspension() {
    init_logger();
    let pool = ThreadPool::new(2);

    let sleeper = Task::spawn(&pool.handle(), || {
        let _ = Task::sleep(Duration::from_secs(10));
    })
    .unwrap();

    // Wait until the sleeper has parked with its timer lock converted to
    // the suspend marker.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let state = sleeper.state.load(Ordering::SeqCst);
        assert_ne!(
            state & (SLEEP_TIMER_LOCK | SLEEP_TIMER_LOCK_SUSPEND),
            SLEEP_TIMER_LOCK | SLEEP_TIMER_LOCK_SUSPEND,
            "both timer lock bits set at once; state={}",
            format_state(state)
        );
        if state & SLEEP_TIMER_LOCK_SUSPEND != 0 && state & SUSPENDED != 0 {
            assert_eq!(
                state & SLEEP_TIMER_LOCK,
                0,
                "timer lock observable across a suspension; state={}",
                format_state(state)
            );
            break;
        }
        assert!(Instant::now() < deadline, "sleeper never parked");
        thread::yield_now();
    }

    assert!(sleeper.wake());
    sleeper.join();
}

#[test]
fn join_storm() {
    init_logger();
    let pool = ThreadPool::new(4);
    let ex = pool.handle();

    let release = Arc::new(AtomicBool::new(false));
    let gate = Arc::clone(&release);
    let target = Task::spawn(&ex, move || {
        while !gate.load(Ordering::SeqCst) {
            Task::yield_now();
        }
    })
    .unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let watchers: Vec<_> = (0..10)
        .map(|_| {
            let target = Arc::clone(&target);
            let fired = Arc::clone(&fired);
            Task::spawn(&ex, move || {
                let fired = Arc::clone(&fired);
                target.call_when_done(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                });
            })
            .unwrap()
        })
        .collect();

    for watcher in &watchers {
        watcher.join();
    }

    release.store(true, Ordering::SeqCst);
    target.join();

    // Termination drained the handler list exactly once.
    let deadline = Instant::now() + Duration::from_secs(5);
    while fired.load(Ordering::SeqCst) < 10 {
        assert!(Instant::now() < deadline, "completion handlers missing");
        thread::yield_now();
    }
    assert_eq!(fired.load(Ordering::SeqCst), 10);
}

#[test]
fn completion_handlers_run_in_registration_order() {
    init_logger();
    let pool = ThreadPool::new(2);

    let release = Arc::new(AtomicBool::new(false));
    let gate = Arc::clone(&release);
    let task = Task::spawn(&pool.handle(), move || {
        while !gate.load(Ordering::SeqCst) {
            Task::yield_now();
        }
    })
    .unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..5 {
        let order = Arc::clone(&order);
        task.call_when_done(move || {
            order.lock().unwrap().push(i);
        });
    }

    release.store(true, Ordering::SeqCst);
    task.join();

    let deadline = Instant::now() + Duration::from_secs(5);
    while order.lock().unwrap().len() < 5 {
        assert!(Instant::now() < deadline, "completion handlers missing");
        thread::yield_now();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn call_when_done_after_termination_runs_immediately() {
    init_logger();
    let pool = ThreadPool::new(1);
    let task = Task::spawn(&pool.handle(), || {}).unwrap();
    task.join();

    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    task.call_when_done(move || {
        flag.store(true, Ordering::SeqCst);
    });
    assert!(fired.load(Ordering::SeqCst));
}

#[test]
fn panicking_body_still_terminates_cleanly() {
    init_logger();
    let pool = ThreadPool::new(1);

    let task = Task::spawn(&pool.handle(), || {
        panic!("boom");
    })
    .unwrap();

    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    task.call_when_done(move || {
        flag.store(true, Ordering::SeqCst);
    });

    task.join();
    assert!(fired.load(Ordering::SeqCst));
    assert!(is_terminal_state(task.state.load(Ordering::SeqCst)));
}

#[test]
fn join_from_another_task() {
    init_logger();
    let pool = ThreadPool::new(2);
    let ex = pool.handle();

    let first = Task::spawn(&ex, || {
        for _ in 0..10 {
            Task::yield_now();
        }
    })
    .unwrap();

    let joined = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&joined);
    let watcher = Arc::clone(&first);
    let second = Task::spawn(&ex, move || {
        watcher.join();
        flag.store(true, Ordering::SeqCst);
    })
    .unwrap();

    second.join();
    assert!(joined.load(Ordering::SeqCst));
    first.join();
}

#[test]
fn future_wait_inside_a_task() {
    init_logger();
    let pool = ThreadPool::new(2);

    let promise = Promise::<u32>::new();
    let future = promise.future();

    let task = Task::spawn(&pool.handle(), move || {
        assert_eq!(future.wait(), 23);
    })
    .unwrap();

    thread::sleep(Duration::from_millis(10));
    promise.set_value(23);
    task.join();
}

#[test]
fn default_priority_bumps_from_parent() {
    init_logger();
    let pool = ThreadPool::new(1);
    let ex = pool.handle();

    // Spawned from outside any task, the parent priority is 0.
    let outer = TaskBuilder::new().priority(5).spawn(&ex, || {}).unwrap();
    assert_eq!(outer.priority(), 5);
    outer.join();

    let child_priority = Arc::new(AtomicUsize::new(0));
    let slot = Arc::clone(&child_priority);
    let inner_ex = Arc::clone(&ex);
    let parent = TaskBuilder::new()
        .priority(5)
        .spawn(&ex, move || {
            let child = Task::spawn(&inner_ex, || {}).unwrap();
            slot.store(child.priority() as usize, Ordering::SeqCst);
            child.join();
        })
        .unwrap();
    parent.join();
    assert_eq!(child_priority.load(Ordering::SeqCst), 105);

    let top = Task::spawn(&ex, || {}).unwrap();
    assert_eq!(top.priority(), 100);
    top.join();
}

#[test]
fn metadata_accessors() {
    init_logger();
    let pool = ThreadPool::new(1);

    let named = TaskBuilder::new()
        .name("metadata")
        .spawn(&pool.handle(), || {})
        .unwrap();
    assert_eq!(named.name(), "metadata");
    assert!(named.id() > 0);
    named.set_priority(-3);
    assert_eq!(named.priority(), -3);
    named.join();

    let anonymous = Task::spawn(&pool.handle(), || {}).unwrap();
    assert_eq!(anonymous.name(), Task::default_name());
    assert!(anonymous.id() > named.id());
    anonymous.join();
}

#[test]
fn stack_pos_reflects_use() {
    init_logger();
    let pool = ThreadPool::new(1);
    let measured = Arc::new(AtomicUsize::new(0));

    let slot = Arc::clone(&measured);
    let task = TaskBuilder::new()
        .stack_size(64 * 1024)
        .spawn(&pool.handle(), move || {
            let current = Task::current().unwrap();
            slot.store(current.stack_pos(), Ordering::SeqCst);
        })
        .unwrap();

    task.join();
    let pos = measured.load(Ordering::SeqCst);
    assert!(pos > 0);
    assert!(pos < 64 * 1024);
}

#[test]
fn yield_and_sleep_work_outside_tasks() {
    init_logger();
    Task::yield_now();

    let started = Instant::now();
    assert!(Task::sleep(Duration::from_millis(15)).is_ok());
    assert!(started.elapsed() >= Duration::from_millis(15));

    assert!(Task::current().is_none());
    assert_eq!(Task::current_priority(), 0);
}

#[test]
fn backtrace_of_a_sleeping_task() {
    init_logger();
    let pool = ThreadPool::new(2);

    let sleeper = TaskBuilder::new()
        .name("sleeper")
        .spawn(&pool.handle(), || {
            let _ = Task::sleep(Duration::from_secs(10));
        })
        .unwrap();

    // Wait for the task to park in its sleep.
    let deadline = Instant::now() + Duration::from_secs(5);
    while sleeper.state.load(Ordering::SeqCst) & SLEEP_TIMER_LOCK_SUSPEND == 0 {
        assert!(Instant::now() < deadline, "sleeper never parked");
        thread::yield_now();
    }

    assert!(Task::backtrace_all() >= 1);

    // The traced task must still be wakeable and able to finish.
    assert!(sleeper.wake());
    sleeper.join();
    assert!(!sleeper.try_dump_stack_trace());
}

#[test]
fn spawning_from_inside_a_task() {
    init_logger();
    let pool = ThreadPool::new(2);
    let ex = pool.handle();

    let total = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&total);
    let inner_ex = Arc::clone(&ex);
    let outer = Task::spawn(&ex, move || {
        let children: Vec<_> = (0..4)
            .map(|_| {
                let count = Arc::clone(&count);
                Task::spawn(&inner_ex, move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();
        for child in children {
            child.join();
        }
    })
    .unwrap();

    outer.join();
    assert_eq!(total.load(Ordering::SeqCst), 4);
}

mod common;

use common::{init_logging, spawn_loop, wait_until};
use netloop::EventLoop;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn quit_from_another_thread_returns_promptly() {
    init_logging();
    let (handle, join) = spawn_loop(|_| {});

    // Give the loop time to block in poll with no descriptors ready.
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    handle.quit();
    join.join().expect("loop thread panicked");

    // Without the wakeup descriptor the poll would block indefinitely.
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn quit_is_idempotent() {
    init_logging();
    let (handle, join) = spawn_loop(|_| {});

    handle.quit();
    handle.quit();
    handle.quit();
    join.join().expect("loop thread panicked");
}

#[test]
fn quit_before_run_exits_immediately() {
    init_logging();
    let mut event_loop = EventLoop::new();
    event_loop.quit();
    event_loop.run();
}

#[test]
fn run_in_loop_executes_inline_on_owning_thread() {
    init_logging();
    let event_loop = EventLoop::new();
    let ran = Arc::new(AtomicUsize::new(0));

    let ran_clone = ran.clone();
    event_loop.run_in_loop(move || {
        ran_clone.fetch_add(1, Ordering::SeqCst);
    });

    // Synchronous: the task completed before run_in_loop returned, without
    // the loop ever running.
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(event_loop.handle().queue_size(), 0);
}

#[test]
fn cross_thread_task_runs_exactly_once_on_owning_thread() {
    init_logging();
    let (handle, join) = spawn_loop(|_| {});

    let count = Arc::new(AtomicUsize::new(0));
    let ran_on = Arc::new(Mutex::new(None));

    let count_clone = count.clone();
    let ran_on_clone = ran_on.clone();
    handle.run_in_loop(move || {
        count_clone.fetch_add(1, Ordering::SeqCst);
        *ran_on_clone.lock().unwrap() = Some(thread::current().id());
    });

    assert!(wait_until(Duration::from_secs(2), || {
        count.load(Ordering::SeqCst) == 1
    }));

    let loop_thread_id = join.thread().id();
    assert_eq!(*ran_on.lock().unwrap(), Some(loop_thread_id));

    thread::sleep(Duration::from_millis(50));
    assert_eq!(count.load(Ordering::SeqCst), 1, "task ran more than once");

    handle.quit();
    join.join().expect("loop thread panicked");
}

#[test]
fn task_queued_during_drain_runs_before_next_poll() {
    init_logging();
    let (handle, join) = spawn_loop(|_| {});

    let order = Arc::new(Mutex::new(Vec::new()));

    let order_outer = order.clone();
    let handle_outer = handle.clone();
    handle.queue_in_loop(move || {
        order_outer.lock().unwrap().push("first");
        let order_inner = order_outer.clone();
        let handle_inner = handle_outer.clone();
        // Queued while the drain itself is running. If this were deferred
        // to the next poll the loop would block forever (no descriptor
        // ever becomes ready) and the join below would hang.
        handle_outer.queue_in_loop(move || {
            order_inner.lock().unwrap().push("second");
            handle_inner.quit();
        });
    });

    join.join().expect("loop thread panicked");
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
}

#[test]
fn tasks_run_in_fifo_order() {
    init_logging();
    let (handle, join) = spawn_loop(|_| {});

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..10 {
        let order = order.clone();
        handle.queue_in_loop(move || order.lock().unwrap().push(i));
    }
    handle.quit();
    join.join().expect("loop thread panicked");

    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn is_in_loop_thread_distinguishes_threads() {
    init_logging();
    let (handle, join) = spawn_loop(|event_loop| {
        assert!(event_loop.is_in_loop_thread());
        event_loop.quit();
    });

    assert!(!handle.is_in_loop_thread());
    join.join().expect("loop thread panicked");
}

#[test]
#[should_panic(expected = "affinity")]
fn assert_in_loop_thread_panics_off_thread() {
    let (handle, join) = spawn_loop(|_| {});
    handle.quit();
    join.join().expect("loop thread panicked");

    handle.assert_in_loop_thread();
}

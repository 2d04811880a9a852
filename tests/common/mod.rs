#![allow(dead_code)]

use netloop::{EventLoop, LoopHandle};

use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Spawns a dedicated loop thread: creates the `EventLoop` there, hands its
/// handle back, runs `setup` on the owning thread, then enters the loop.
pub fn spawn_loop<F>(setup: F) -> (LoopHandle, JoinHandle<()>)
where
    F: FnOnce(&EventLoop) + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let join = std::thread::spawn(move || {
        let mut event_loop = EventLoop::new();
        tx.send(event_loop.handle()).unwrap();
        setup(&event_loop);
        event_loop.run();
    });
    (rx.recv().expect("loop thread handle"), join)
}

/// Polls `condition` every few milliseconds until it holds or the timeout
/// elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

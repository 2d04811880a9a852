//! The single-threaded event loop at the heart of the reactor.
//!
//! One thread owns one [`EventLoop`]: all readiness dispatch, registration
//! changes, and connection state transitions happen on that thread. Other
//! threads interact only through a [`LoopHandle`], which either runs a task
//! inline (when already on the owning thread) or enqueues it and wakes the
//! loop through a dedicated eventfd.
//!
//! The loop cycle is: poll the multiplexer with no timeout, dispatch each
//! ready channel in kernel-delivery order, then drain the pending-task
//! queue. The only blocking call anywhere in the reactor is the poll; the
//! eventfd wakeup is what forces it to return promptly after a cross-thread
//! enqueue or quit.

use crate::net::socket;
use crate::reactor::channel::Channel;
use crate::reactor::poller::Poller;

use log::{debug, error, trace};
use std::cell::Cell;
use std::io;
use std::marker::PhantomData;
use std::mem;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, ThreadId};

/// A deferred task, executed on the owning loop thread in FIFO order.
type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    /// One event loop per thread, enforced at construction.
    static LOOP_IN_THIS_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Writes to a closed connection must surface as write errors, not kill the
/// process.
static IGNORE_SIGPIPE: Once = Once::new();

// State shared between the loop thread and every handle.
pub(crate) struct LoopShared {
    quit: AtomicBool,
    thread_id: ThreadId,
    wakeup_fd: RawFd,
    calling_pending: AtomicBool,
    pending: Mutex<Vec<Task>>,
    /// Touched only from the owning thread; the mutex is a `Sync` wrapper
    /// enforced by the thread-affinity assertions, never a contended lock.
    poller: Mutex<Poller>,
}

/// A cheap, clonable, `Send + Sync` reference to an event loop.
///
/// This is how everything that is not the loop thread talks to the loop:
/// [`quit`](Self::quit), [`run_in_loop`](Self::run_in_loop) and
/// [`queue_in_loop`](Self::queue_in_loop) are safe from any thread. The
/// channel-registration entry points are crate-internal and assert that the
/// caller is the owning thread.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Whether the calling thread is the one that constructed the loop.
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    /// Asserts loop-thread affinity.
    ///
    /// # Panics
    /// Panics when called from any other thread. Mismatches are defects,
    /// not runtime conditions: callers must marshal through
    /// [`run_in_loop`](Self::run_in_loop) instead.
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "loop-thread affinity violated: loop was created on {:?}, current thread is {:?}",
                self.shared.thread_id,
                thread::current().id()
            );
        }
    }

    /// Requests the loop to exit.
    ///
    /// Settable from any thread and idempotent. When called off-thread the
    /// loop is woken so a blocked poll returns promptly instead of waiting
    /// for the next unrelated readiness event.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Runs `task` on the loop thread.
    ///
    /// Executes synchronously when already on the owning thread (minimal
    /// latency), otherwise behaves as [`queue_in_loop`](Self::queue_in_loop).
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Appends `task` to the pending queue.
    ///
    /// The lock is held only for the append. The loop is woken when the
    /// caller is off-thread, or when the loop is currently draining its
    /// queue, so a task queued during a drain is never starved until the
    /// next readiness event.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.push(Box::new(task));
        }
        if !self.is_in_loop_thread() || self.shared.calling_pending.load(Ordering::SeqCst) {
            self.wakeup();
        }
    }

    /// Number of tasks currently queued.
    pub fn queue_size(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    /// Forces a blocked poll to return by writing one 8-byte value to the
    /// loop's eventfd.
    pub fn wakeup(&self) {
        let one: u64 = 1;
        match socket::write(self.shared.wakeup_fd, &one.to_ne_bytes()) {
            Ok(8) => {}
            Ok(n) => error!("LoopHandle::wakeup wrote {} bytes instead of 8", n),
            Err(err) => error!("LoopHandle::wakeup failed: {}", err),
        }
    }

    /// Pushes a channel's interest mask into the multiplexer.
    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.shared.poller.lock().unwrap().update_channel(channel);
    }

    /// Deregisters a channel from the multiplexer.
    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.shared.poller.lock().unwrap().remove_channel(channel);
    }

    /// Whether the multiplexer currently tracks this channel. Used for
    /// invariant checks; owning thread only.
    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.assert_in_loop_thread();
        self.shared.poller.lock().unwrap().has_channel(channel)
    }
}

/// The reactor's wait/dispatch/drain cycle, owned by exactly one thread.
///
/// Construct the loop on the thread that will run it; the constructing
/// thread's identity is the affinity checked by every mutating entry point.
/// `EventLoop` is deliberately not `Send`; other threads get
/// [`LoopHandle`]s instead.
pub struct EventLoop {
    shared: Arc<LoopShared>,
    wakeup_channel: Arc<Channel>,
    looping: bool,
    ran: bool,
    active_channels: Vec<Arc<Channel>>,
    _not_send: PhantomData<*const ()>,
}

impl EventLoop {
    /// Creates an event loop owned by the current thread.
    ///
    /// Sets up the epoll multiplexer, the eventfd wakeup descriptor and its
    /// channel, and ignores `SIGPIPE` process-wide (once).
    ///
    /// # Panics
    /// Panics if this thread already owns an event loop.
    pub fn new() -> Self {
        IGNORE_SIGPIPE.call_once(|| unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        });

        LOOP_IN_THIS_THREAD.with(|slot| {
            if slot.get() {
                panic!("another EventLoop already exists in this thread");
            }
            slot.set(true);
        });

        let wakeup_fd = create_eventfd();
        let shared = Arc::new(LoopShared {
            quit: AtomicBool::new(false),
            thread_id: thread::current().id(),
            wakeup_fd,
            calling_pending: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            poller: Mutex::new(Poller::new()),
        });

        debug!(
            "EventLoop created in thread {:?}",
            thread::current().id()
        );

        let wakeup_channel = Channel::new(LoopHandle { shared: shared.clone() }, wakeup_fd);
        wakeup_channel.set_read_callback(move || {
            let mut one = [0u8; 8];
            match socket::read(wakeup_fd, &mut one) {
                Ok(8) => {}
                Ok(n) => error!("EventLoop wakeup read {} bytes instead of 8", n),
                Err(err) => error!("EventLoop wakeup read failed: {}", err),
            }
        });
        wakeup_channel.enable_reading();

        Self {
            shared,
            wakeup_channel,
            looping: false,
            ran: false,
            active_channels: Vec::new(),
            _not_send: PhantomData,
        }
    }

    /// Returns a clonable cross-thread handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Runs the wait/dispatch/drain cycle until [`quit`](LoopHandle::quit).
    ///
    /// Callable exactly once per instance, only from the owning thread.
    /// Each iteration clears the previous active-channel list, blocks on
    /// the multiplexer with an indefinite timeout, dispatches every ready
    /// channel, then drains the pending-task queue. The quit flag is
    /// observed at the top of the cycle.
    pub fn run(&mut self) {
        assert!(!self.looping, "EventLoop::run called re-entrantly");
        assert!(!self.ran, "EventLoop::run is callable only once");
        self.handle().assert_in_loop_thread();
        self.looping = true;
        self.ran = true;

        while !self.shared.quit.load(Ordering::SeqCst) {
            self.active_channels.clear();
            self.shared
                .poller
                .lock()
                .unwrap()
                .poll(-1, &mut self.active_channels);
            for channel in &self.active_channels {
                channel.handle_event();
            }
            self.do_pending_tasks();
        }

        debug!("EventLoop stopped looping");
        self.looping = false;
    }

    /// See [`LoopHandle::quit`].
    pub fn quit(&self) {
        self.handle().quit();
    }

    /// See [`LoopHandle::run_in_loop`].
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle().run_in_loop(task);
    }

    /// See [`LoopHandle::queue_in_loop`].
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle().queue_in_loop(task);
    }

    /// See [`LoopHandle::is_in_loop_thread`].
    pub fn is_in_loop_thread(&self) -> bool {
        self.handle().is_in_loop_thread()
    }

    /// See [`LoopHandle::assert_in_loop_thread`].
    pub fn assert_in_loop_thread(&self) {
        self.handle().assert_in_loop_thread();
    }

    /// See [`LoopHandle::has_channel`].
    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.handle().has_channel(channel)
    }

    // Swap-and-clear under a short-held lock, then execute outside it. The
    // drain repeats until a swap comes back empty, so a task queued during
    // the drain (from the owning thread) still runs before the next poll.
    fn do_pending_tasks(&mut self) {
        self.shared.calling_pending.store(true, Ordering::SeqCst);
        loop {
            let tasks = {
                let mut pending = self.shared.pending.lock().unwrap();
                mem::take(&mut *pending)
            };
            if tasks.is_empty() {
                break;
            }
            trace!("draining {} pending tasks", tasks.len());
            for task in tasks {
                task();
            }
        }
        self.shared.calling_pending.store(false, Ordering::SeqCst);
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        debug!(
            "EventLoop of thread {:?} destructs",
            self.shared.thread_id
        );
        self.wakeup_channel.disable_all();
        self.wakeup_channel.remove();
        socket::close(self.shared.wakeup_fd);
        LOOP_IN_THIS_THREAD.with(|slot| slot.set(false));
    }
}

fn create_eventfd() -> RawFd {
    let event_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if event_fd < 0 {
        panic!(
            "EventLoop failed to create eventfd: {}",
            io::Error::last_os_error()
        );
    }
    event_fd
}

//! Per-descriptor event interest and dispatch.
//!
//! A [`Channel`] binds one descriptor to an interest mask and four callback
//! slots (readable, writable, closed, error). It never owns the descriptor:
//! the acceptor or connection that created the descriptor controls its
//! lifetime, and the channel only describes what readiness events the owner
//! wants and how to react to them.
//!
//! All interest mutations go through the owning loop, which pushes them into
//! the multiplexer. Mutating a channel from any other thread is a fatal
//! programming error, caught by the loop's thread-affinity assertion.

use crate::reactor::event_loop::LoopHandle;
use crate::reactor::poller::Registration;

use log::trace;
use std::any::Any;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, Weak};

pub(crate) const NONE_EVENT: u32 = 0;
pub(crate) const READ_EVENT: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
pub(crate) const WRITE_EVENT: u32 = libc::EPOLLOUT as u32;

/// Callback invoked when the channel's descriptor becomes ready.
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

struct ChannelState {
    /// Requested interest mask.
    events: u32,
    /// Last mask observed by the multiplexer.
    revents: u32,
    /// Registration state inside the multiplexer.
    registration: Registration,
    /// Weak liveness marker back to the owning object, see [`Channel::tie`].
    tie: Option<Weak<dyn Any + Send + Sync>>,
    event_handling: bool,
    added_to_loop: bool,
    read_callback: Option<EventCallback>,
    write_callback: Option<EventCallback>,
    close_callback: Option<EventCallback>,
    error_callback: Option<EventCallback>,
}

/// Event-interest-and-dispatch handle for one descriptor.
///
/// Channels are shared as `Arc<Channel>`: the owner keeps one strong
/// reference, and the multiplexer keeps another while the channel is
/// registered. The interior mutex exists only to make the type `Sync`; every
/// mutating entry point runs on the owning loop thread, so it is never
/// contended.
pub struct Channel {
    handle: LoopHandle,
    file_descriptor: RawFd,
    /// Self reference so `&self` methods can hand the poller an owning
    /// pointer, set by [`Arc::new_cyclic`] at construction.
    self_ref: Weak<Channel>,
    state: Mutex<ChannelState>,
}

impl Channel {
    /// Creates a channel for `file_descriptor` on the given loop.
    ///
    /// The channel starts with no requested events and nothing registered in
    /// the multiplexer.
    pub fn new(handle: LoopHandle, file_descriptor: RawFd) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            handle,
            file_descriptor,
            self_ref: self_ref.clone(),
            state: Mutex::new(ChannelState {
                events: NONE_EVENT,
                revents: NONE_EVENT,
                registration: Registration::New,
                tie: None,
                event_handling: false,
                added_to_loop: false,
                read_callback: None,
                write_callback: None,
                close_callback: None,
                error_callback: None,
            }),
        })
    }

    /// The descriptor this channel watches. Borrowed, never closed here.
    pub fn fd(&self) -> RawFd {
        self.file_descriptor
    }

    /// Installs the readable callback.
    pub fn set_read_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.state.lock().unwrap().read_callback = Some(Arc::new(callback));
    }

    /// Installs the writable callback.
    pub fn set_write_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.state.lock().unwrap().write_callback = Some(Arc::new(callback));
    }

    /// Installs the closed callback.
    pub fn set_close_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.state.lock().unwrap().close_callback = Some(Arc::new(callback));
    }

    /// Installs the error callback.
    pub fn set_error_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.state.lock().unwrap().error_callback = Some(Arc::new(callback));
    }

    /// Ties the channel to its owning object.
    ///
    /// Once tied, [`handle_event`](Self::handle_event) resolves the weak
    /// reference before dispatching and silently drops the event if the
    /// owner has already been destroyed. This is what makes a readiness
    /// event that was queued before teardown began safe to deliver.
    pub fn tie<T: Send + Sync + 'static>(&self, owner: &Arc<T>) {
        let weak = Arc::downgrade(owner);
        let weak: Weak<dyn Any + Send + Sync> = weak;
        self.state.lock().unwrap().tie = Some(weak);
    }

    /// Requests read-interest and pushes the change to the multiplexer.
    pub fn enable_reading(&self) {
        self.state.lock().unwrap().events |= READ_EVENT;
        self.update();
    }

    /// Drops read-interest and pushes the change to the multiplexer.
    pub fn disable_reading(&self) {
        self.state.lock().unwrap().events &= !READ_EVENT;
        self.update();
    }

    /// Requests write-interest and pushes the change to the multiplexer.
    pub fn enable_writing(&self) {
        self.state.lock().unwrap().events |= WRITE_EVENT;
        self.update();
    }

    /// Drops write-interest and pushes the change to the multiplexer.
    pub fn disable_writing(&self) {
        self.state.lock().unwrap().events &= !WRITE_EVENT;
        self.update();
    }

    /// Drops all interest and pushes the change to the multiplexer.
    pub fn disable_all(&self) {
        self.state.lock().unwrap().events = NONE_EVENT;
        self.update();
    }

    /// Whether read-interest is currently requested.
    pub fn is_reading(&self) -> bool {
        self.state.lock().unwrap().events & READ_EVENT != 0
    }

    /// Whether write-interest is currently requested.
    pub fn is_writing(&self) -> bool {
        self.state.lock().unwrap().events & WRITE_EVENT != 0
    }

    /// Whether the requested-event mask is empty.
    pub fn is_none_event(&self) -> bool {
        self.state.lock().unwrap().events == NONE_EVENT
    }

    /// Deregisters the channel from the multiplexer.
    ///
    /// # Panics
    /// The requested-event mask must already be empty; removing a channel
    /// that still wants events is a programming error.
    pub fn remove(&self) {
        assert!(self.is_none_event(), "Channel::remove with non-empty mask");
        self.state.lock().unwrap().added_to_loop = false;
        let channel = self.self_ref.upgrade().expect("channel self reference");
        self.handle.remove_channel(&channel);
    }

    /// Dispatches the last-observed events to the installed callbacks.
    ///
    /// If the channel is tied, the weak owner reference is resolved first
    /// and a dead owner turns the dispatch into a no-op.
    pub(crate) fn handle_event(&self) {
        let guard = {
            let state = self.state.lock().unwrap();
            match &state.tie {
                Some(tie) => match tie.upgrade() {
                    Some(owner) => Some(owner),
                    // Owner already destroyed: drop the event.
                    None => return,
                },
                None => None,
            }
        };
        self.handle_event_with_guard();
        drop(guard);
    }

    // Dispatch order matters: close on hang-up-without-readable first, then
    // error, then read (so a simultaneous hang-up still drains pending
    // input), then write. Callback handles are cloned out of the lock so no
    // lock is held across user code.
    fn handle_event_with_guard(&self) {
        let (revents, read_cb, write_cb, close_cb, error_cb) = {
            let mut state = self.state.lock().unwrap();
            state.event_handling = true;
            (
                state.revents,
                state.read_callback.clone(),
                state.write_callback.clone(),
                state.close_callback.clone(),
                state.error_callback.clone(),
            )
        };

        trace!("{}", events_to_string(self.file_descriptor, revents));

        let hup = libc::EPOLLHUP as u32;
        let input = libc::EPOLLIN as u32;
        let rdhup = libc::EPOLLRDHUP as u32;
        let err = libc::EPOLLERR as u32;

        if revents & hup != 0 && revents & input == 0 {
            if let Some(callback) = &close_cb {
                callback();
            }
        }
        if revents & err != 0 {
            if let Some(callback) = &error_cb {
                callback();
            }
        }
        if revents & (READ_EVENT | rdhup) != 0 {
            if let Some(callback) = &read_cb {
                callback();
            }
        }
        if revents & WRITE_EVENT != 0 {
            if let Some(callback) = &write_cb {
                callback();
            }
        }

        self.state.lock().unwrap().event_handling = false;
    }

    /// Debug rendering of the requested-event mask.
    pub fn events_to_string(&self) -> String {
        events_to_string(self.file_descriptor, self.state.lock().unwrap().events)
    }

    /// Debug rendering of the last-observed-event mask.
    pub fn revents_to_string(&self) -> String {
        events_to_string(self.file_descriptor, self.state.lock().unwrap().revents)
    }

    pub(crate) fn events(&self) -> u32 {
        self.state.lock().unwrap().events
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.state.lock().unwrap().revents = revents;
    }

    pub(crate) fn registration(&self) -> Registration {
        self.state.lock().unwrap().registration
    }

    pub(crate) fn set_registration(&self, registration: Registration) {
        self.state.lock().unwrap().registration = registration;
    }

    fn update(&self) {
        self.state.lock().unwrap().added_to_loop = true;
        let channel = self.self_ref.upgrade().expect("channel self reference");
        self.handle.update_channel(&channel);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap();
        debug_assert!(!state.event_handling, "channel destroyed mid-dispatch");
        debug_assert!(!state.added_to_loop, "channel destroyed while registered");
    }
}

fn events_to_string(file_descriptor: RawFd, events: u32) -> String {
    let mut out = format!("{}: ", file_descriptor);
    if events & libc::EPOLLIN as u32 != 0 {
        out.push_str("IN ");
    }
    if events & libc::EPOLLPRI as u32 != 0 {
        out.push_str("PRI ");
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        out.push_str("OUT ");
    }
    if events & libc::EPOLLHUP as u32 != 0 {
        out.push_str("HUP ");
    }
    if events & libc::EPOLLRDHUP as u32 != 0 {
        out.push_str("RDHUP ");
    }
    if events & libc::EPOLLERR as u32 != 0 {
        out.push_str("ERR ");
    }
    out
}

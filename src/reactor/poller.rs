//! epoll-backed readiness multiplexer.
//!
//! The poller owns the kernel epoll descriptor and the map from watched
//! descriptor to its [`Channel`]. One blocking `epoll_wait` per loop
//! iteration returns the ready set in kernel-delivery order; registration
//! changes go through [`update_channel`](Poller::update_channel) and
//! [`remove_channel`](Poller::remove_channel).
//!
//! Every channel carries a registration tag tracking its relationship with
//! the kernel object: `New` (never registered), `Added` (in the kernel
//! set), `Deleted` (bookkeeping entry kept, pulled out of the kernel set
//! because interest went empty). Keeping `Deleted` entries around makes
//! toggling interest on a temporarily-idle descriptor a single `ADD`
//! instead of a full removal and reinsertion, which pays off when
//! write-interest flips on and off while an output buffer drains.

use crate::reactor::channel::Channel;

use log::{debug, error, trace};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Initial capacity of the kernel event buffer.
const INIT_EVENT_LIST_SIZE: usize = 16;

/// A channel's registration state inside the poller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Registration {
    /// Never registered; no map entry exists.
    New,
    /// Registered in the kernel object.
    Added,
    /// Map entry kept, but pulled from the kernel object because the
    /// requested-event mask is empty.
    Deleted,
}

/// Kernel-assisted readiness multiplexing over a dynamic descriptor set.
pub(crate) struct Poller {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl Poller {
    /// Creates the kernel epoll object.
    ///
    /// # Panics
    /// Failing to create the epoll descriptor leaves the loop unable to
    /// function at all, so it is fatal.
    pub(crate) fn new() -> Self {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            panic!(
                "Poller::new epoll_create1 failed: {}",
                io::Error::last_os_error()
            );
        }
        Self {
            epoll_fd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        }
    }

    /// Blocks until readiness, filling `active` with ready channels.
    ///
    /// Each ready channel gets the observed-event mask stamped onto it and
    /// is appended in kernel-delivery order. A zero-event return is an idle
    /// timeout, not an error. An `EINTR` is swallowed (the caller simply
    /// polls again); any other error is logged and surfaces no channels.
    /// When a poll fills the event buffer completely it is doubled,
    /// anticipating more events on the next call.
    pub(crate) fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) {
        let num_events = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };

        if num_events > 0 {
            trace!("{} events happened", num_events);
            for event in &self.events[..num_events as usize] {
                let revents = event.events;
                let file_descriptor = event.u64 as RawFd;
                if let Some(channel) = self.channels.get(&file_descriptor) {
                    channel.set_revents(revents);
                    active.push(channel.clone());
                }
            }
            if num_events as usize == self.events.len() {
                self.events
                    .resize(self.events.len() * 2, libc::epoll_event { events: 0, u64: 0 });
            }
        } else if num_events == 0 {
            trace!("nothing happened");
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!("Poller::poll failed: {}", err);
            }
        }
    }

    /// Applies a channel's current interest mask to the kernel object.
    ///
    /// `New` and `Deleted` channels are (re-)added; an `Added` channel
    /// whose mask went empty is pulled from the kernel set but keeps its
    /// map entry, otherwise it is modified in place.
    pub(crate) fn update_channel(&mut self, channel: &Arc<Channel>) {
        let registration = channel.registration();
        trace!(
            "fd = {} events = {{{}}} registration = {:?}",
            channel.fd(),
            channel.events_to_string(),
            registration
        );
        match registration {
            Registration::New | Registration::Deleted => {
                let file_descriptor = channel.fd();
                if registration == Registration::New {
                    assert!(!self.channels.contains_key(&file_descriptor));
                    self.channels.insert(file_descriptor, channel.clone());
                } else {
                    assert!(self.channels.contains_key(&file_descriptor));
                }
                channel.set_registration(Registration::Added);
                self.update(libc::EPOLL_CTL_ADD, channel);
            }
            Registration::Added => {
                if channel.is_none_event() {
                    self.update(libc::EPOLL_CTL_DEL, channel);
                    channel.set_registration(Registration::Deleted);
                } else {
                    self.update(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    /// Erases a channel from the descriptor map.
    ///
    /// The channel's requested mask must already be empty (asserted in
    /// `Channel::remove`). An `Added` channel is pulled from the kernel
    /// set first; the registration tag resets to `New` so the channel
    /// could be registered again from scratch.
    pub(crate) fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let file_descriptor = channel.fd();
        trace!("fd = {}", file_descriptor);
        assert!(channel.is_none_event());

        self.channels.remove(&file_descriptor);
        if channel.registration() == Registration::Added {
            self.update(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_registration(Registration::New);
    }

    /// Membership query by descriptor and channel identity.
    pub(crate) fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|entry| Arc::ptr_eq(entry, channel))
    }

    // epoll_ctl wrapper. A failed DEL is tolerated at debug level (the
    // descriptor may already be gone from the kernel set); other failures
    // are logged and the operation abandoned.
    fn update(&self, operation: i32, channel: &Arc<Channel>) {
        let file_descriptor = channel.fd();
        let mut event = libc::epoll_event {
            events: channel.events(),
            u64: file_descriptor as u64,
        };
        trace!(
            "epoll_ctl op = {} fd = {} event = {{{}}}",
            operation_to_string(operation),
            file_descriptor,
            channel.events_to_string()
        );
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, operation, file_descriptor, &mut event) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if operation == libc::EPOLL_CTL_DEL {
                debug!(
                    "epoll_ctl op = DEL fd = {} failed: {}",
                    file_descriptor, err
                );
            } else {
                error!(
                    "epoll_ctl op = {} fd = {} failed: {}",
                    operation_to_string(operation),
                    file_descriptor,
                    err
                );
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

fn operation_to_string(operation: i32) -> &'static str {
    match operation {
        libc::EPOLL_CTL_ADD => "ADD",
        libc::EPOLL_CTL_DEL => "DEL",
        libc::EPOLL_CTL_MOD => "MOD",
        _ => "UNKNOWN",
    }
}

//! Event-driven I/O reactor module.
//!
//! This module provides the core event-driven I/O handling using epoll on
//! Linux. It includes:
//! - [`event_loop`]: The per-thread wait/dispatch/drain cycle and its
//!   cross-thread handle
//! - [`poller`]: The epoll multiplexer and its registration state machine
//! - [`channel`]: The per-descriptor event-interest-and-dispatch abstraction

pub mod channel;
pub mod event_loop;
pub mod poller;

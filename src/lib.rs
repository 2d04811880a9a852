//! Event-driven TCP networking core following the single-threaded reactor
//! pattern.
//!
//! One thread owns an I/O multiplexer, and all socket readiness
//! notifications, connection lifecycle transitions, and cross-thread task
//! submissions flow through that one thread.
//!
//! # Architecture
//!
//! - **EventLoop**: the per-thread wait/dispatch/drain cycle; other threads
//!   reach it through a clonable [`LoopHandle`]
//! - **Poller**: epoll wrapper returning ready channels in kernel-delivery
//!   order
//! - **Channel**: per-descriptor event interest and callback dispatch
//! - **Acceptor**: turns accept-readiness into new connection descriptors
//! - **TcpConnection**: per-connection state machine with graceful and
//!   forced close, write back-pressure, and half-close
//! - **Buffer**: append-then-drain byte staging, one per direction per
//!   connection

pub mod buffer;
pub mod net;
pub mod protocol;
pub mod reactor;

pub use buffer::Buffer;
pub use net::acceptor::Acceptor;
pub use net::connection::{TcpConnection, TcpConnectionPtr};
pub use reactor::channel::Channel;
pub use reactor::event_loop::{EventLoop, LoopHandle};

//! TCP networking components built on the reactor.
//!
//! This module provides the connection-facing half of the core:
//! - [`socket`]: raw descriptor operations and the owning [`Socket`] wrapper
//! - [`acceptor`]: [`Acceptor`] turning accept-readiness into new descriptors
//! - [`connection`]: [`TcpConnection`], the per-connection state machine
//!
//! plus the callback aliases shared by all of them.
//!
//! [`Socket`]: socket::Socket
//! [`Acceptor`]: acceptor::Acceptor
//! [`TcpConnection`]: connection::TcpConnection

pub mod acceptor;
pub mod connection;
pub mod socket;

use crate::buffer::Buffer;
use crate::net::connection::TcpConnectionPtr;

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Fired when a connection is established and again when it is destroyed.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Fired when bytes arrive; receives the connection and its input buffer.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer) + Send + Sync>;

/// Fired when the output buffer has fully drained.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Fired when the output buffer crosses the configured threshold; receives
/// the queued byte count.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;

/// Fired by the acceptor with each accepted descriptor and peer address.
pub type NewConnectionCallback = Arc<dyn Fn(RawFd, SocketAddr) + Send + Sync>;

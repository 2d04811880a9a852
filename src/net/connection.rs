//! Per-connection state machine riding on a channel and two buffers.
//!
//! A [`TcpConnection`] exclusively owns its descriptor (through a
//! [`Socket`]) and its [`Channel`], stages incoming bytes in an input
//! [`Buffer`] and unwritten outgoing bytes in an output [`Buffer`], and
//! walks the state machine
//! `connecting -> connected -> disconnecting -> disconnected`.
//!
//! The channel is tied (weak liveness reference) back to the connection, so
//! a readiness event already queued when the connection begins destruction
//! resolves to "owner gone" and is dropped instead of touching freed state.
//!
//! Connections are shared as [`TcpConnectionPtr`]. The interior mutex only
//! makes the type `Sync`: every state transition happens on the loop
//! thread, and no lock is ever held across a user callback.

use crate::buffer::Buffer;
use crate::net::socket::{self, Socket};
use crate::net::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, WriteCompleteCallback,
};
use crate::reactor::channel::Channel;
use crate::reactor::event_loop::LoopHandle;

use log::{debug, error, trace, warn};
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, Weak};

/// Shared pointer to a connection, handed to every callback.
pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Default output-buffer size above which the high-water-mark callback
/// fires: 64 MiB.
const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

struct ConnectionState {
    state: State,
    reading: bool,
    /// Guards the close path so peer close and force-close cannot both
    /// dispatch it.
    close_handled: bool,
    input: Buffer,
    output: Buffer,
    high_water_mark: usize,
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    /// Internal: lets the owning collaborator remove the connection from
    /// its registry before scheduling `connect_destroyed`.
    close: Option<ConnectionCallback>,
}

/// One established TCP connection owned by an event loop.
pub struct TcpConnection {
    handle: LoopHandle,
    name: String,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    self_ref: Weak<TcpConnection>,
    state: Mutex<ConnectionState>,
    callbacks: Mutex<Callbacks>,
}

impl TcpConnection {
    /// Wraps an already-accepted (or connected) descriptor.
    ///
    /// The connection starts in the connecting state; the owner must call
    /// [`connect_established`](Self::connect_established) exactly once
    /// after installing its callbacks.
    pub fn new(
        handle: LoopHandle,
        name: impl Into<String>,
        file_descriptor: RawFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        let name = name.into();
        debug!(
            "TcpConnection::new [{}] fd = {} peer = {}",
            name, file_descriptor, peer_addr
        );

        Arc::new_cyclic(|self_ref: &Weak<TcpConnection>| {
            let channel = Channel::new(handle.clone(), file_descriptor);

            let weak = self_ref.clone();
            channel.set_read_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read();
                }
            });
            let weak = self_ref.clone();
            channel.set_write_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            });
            let weak = self_ref.clone();
            channel.set_close_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            });
            let weak = self_ref.clone();
            channel.set_error_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_error();
                }
            });

            let connection_socket = Socket::from_raw(file_descriptor);
            connection_socket.set_keep_alive(true);

            TcpConnection {
                handle,
                name,
                socket: connection_socket,
                channel,
                local_addr,
                peer_addr,
                self_ref: self_ref.clone(),
                state: Mutex::new(ConnectionState {
                    state: State::Connecting,
                    reading: true,
                    close_handled: false,
                    input: Buffer::new(),
                    output: Buffer::new(),
                    high_water_mark: DEFAULT_HIGH_WATER_MARK,
                }),
                callbacks: Mutex::new(Callbacks::default()),
            }
        })
    }

    /// Stable name given by the owner, for logging and registry keys.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the local end of the connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Handle to the owning loop.
    pub fn loop_handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Whether the connection is currently in the connected state.
    pub fn connected(&self) -> bool {
        self.state.lock().unwrap().state == State::Connected
    }

    /// Whether the connection has reached its terminal state.
    pub fn disconnected(&self) -> bool {
        self.state.lock().unwrap().state == State::Disconnected
    }

    /// Whether read-interest is currently enabled.
    pub fn is_reading(&self) -> bool {
        self.state.lock().unwrap().reading
    }

    /// Installs the callback fired on establishment and on teardown.
    pub fn set_connection_callback(
        &self,
        callback: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().unwrap().connection = Some(Arc::new(callback));
    }

    /// Installs the callback fired when bytes arrive in the input buffer.
    pub fn set_message_callback(
        &self,
        callback: impl Fn(&TcpConnectionPtr, &mut Buffer) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().unwrap().message = Some(Arc::new(callback));
    }

    /// Installs the callback fired when the output buffer fully drains.
    pub fn set_write_complete_callback(
        &self,
        callback: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().unwrap().write_complete = Some(Arc::new(callback));
    }

    /// Installs the back-pressure callback and its threshold in bytes.
    pub fn set_high_water_mark_callback(
        &self,
        callback: impl Fn(&TcpConnectionPtr, usize) + Send + Sync + 'static,
        high_water_mark: usize,
    ) {
        self.callbacks.lock().unwrap().high_water_mark = Some(Arc::new(callback));
        self.state.lock().unwrap().high_water_mark = high_water_mark;
    }

    /// Installs the internal close callback. For the owning collaborator
    /// only: it must remove the connection from its registry and schedule
    /// [`connect_destroyed`](Self::connect_destroyed).
    pub fn set_close_callback(
        &self,
        callback: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().unwrap().close = Some(Arc::new(callback));
    }

    /// Enables or disables `TCP_NODELAY` on the underlying socket.
    pub fn set_tcp_no_delay(&self, on: bool) {
        self.socket.set_tcp_no_delay(on);
    }

    /// Completes establishment: connecting becomes connected, the channel
    /// is tied to this connection and read-interest enabled, and the
    /// connection callback fires.
    ///
    /// Called exactly once by the owner, on the loop thread.
    pub fn connect_established(&self) {
        self.handle.assert_in_loop_thread();
        {
            let mut state = self.state.lock().unwrap();
            assert_eq!(state.state, State::Connecting);
            state.state = State::Connected;
        }
        let conn = self.upgrade();
        self.channel.tie(&conn);
        self.channel.enable_reading();

        if let Some(callback) = self.connection_callback() {
            callback(&conn);
        }
    }

    /// Final teardown, called exactly once by the owning collaborator after
    /// it has removed this connection from its registry.
    ///
    /// Disables all channel interest, transitions to disconnected, fires
    /// the connection callback one last time, and deregisters the channel.
    pub fn connect_destroyed(&self) {
        self.handle.assert_in_loop_thread();
        let was_active = {
            let mut state = self.state.lock().unwrap();
            let was_active =
                state.state == State::Connected || state.state == State::Disconnecting;
            state.state = State::Disconnected;
            was_active
        };
        if was_active {
            self.channel.disable_all();
            let conn = self.upgrade();
            if let Some(callback) = self.connection_callback() {
                callback(&conn);
            }
        }
        self.channel.remove();
    }

    /// Sends `data` to the peer.
    ///
    /// On the owning thread this attempts an immediate non-blocking write;
    /// any remainder is staged in the output buffer with write-interest
    /// enabled so draining continues on future writable events. Off-thread
    /// calls marshal a copy of the data through the loop. Never blocks.
    ///
    /// Sending on a connection that is not connected is a silent no-op:
    /// peer state is inherently racy, so it is not an error.
    pub fn send(&self, data: &[u8]) {
        if self.state.lock().unwrap().state != State::Connected {
            return;
        }
        if self.handle.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.upgrade();
            let copy = data.to_vec();
            self.handle.run_in_loop(move || conn.send_in_loop(&copy));
        }
    }

    /// Graceful close: stop sending once buffered output drains, keep
    /// receiving (half-close).
    ///
    /// Transitions connected to disconnecting. If the output buffer is
    /// already empty the write half shuts down immediately; otherwise the
    /// shutdown is deferred until the writable callback drains the buffer.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.state != State::Connected {
                return;
            }
            state.state = State::Disconnecting;
        }
        let conn = self.upgrade();
        self.handle.run_in_loop(move || conn.shutdown_in_loop());
    }

    /// Abnormal close: schedules immediate full teardown regardless of any
    /// buffered output.
    pub fn force_close(&self) {
        let should_close = {
            let mut state = self.state.lock().unwrap();
            match state.state {
                State::Connected | State::Disconnecting => {
                    state.state = State::Disconnecting;
                    true
                }
                _ => false,
            }
        };
        if should_close {
            let conn = self.upgrade();
            self.handle.queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    /// Re-enables read-interest, for application-level flow control.
    pub fn start_read(&self) {
        let conn = self.upgrade();
        self.handle.run_in_loop(move || conn.start_read_in_loop());
    }

    /// Disables read-interest without affecting connection state, letting
    /// the application apply back-pressure to the peer.
    pub fn stop_read(&self) {
        let conn = self.upgrade();
        self.handle.run_in_loop(move || conn.stop_read_in_loop());
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.handle.assert_in_loop_thread();
        let mut written = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        let fire_high_water = {
            let mut state = self.state.lock().unwrap();
            if state.state == State::Disconnected {
                warn!("TcpConnection::send_in_loop [{}] disconnected, give up", self.name);
                return;
            }

            // Fast path: nothing staged and not watching writability yet,
            // so try the kernel directly.
            if !self.channel.is_writing() && state.output.readable_bytes() == 0 {
                match socket::write(self.channel.fd(), data) {
                    Ok(n) => {
                        written = n;
                        remaining -= n;
                    }
                    Err(err) => {
                        if err.raw_os_error() != Some(libc::EWOULDBLOCK) {
                            error!(
                                "TcpConnection::send_in_loop [{}] write failed: {}",
                                self.name, err
                            );
                            if matches!(
                                err.raw_os_error(),
                                Some(libc::EPIPE) | Some(libc::ECONNRESET)
                            ) {
                                fault = true;
                            }
                        }
                    }
                }
            }

            let mut fire_high_water = None;
            if !fault && remaining > 0 {
                let old_len = state.output.readable_bytes();
                let high_water_mark = state.high_water_mark;
                if old_len + remaining >= high_water_mark && old_len < high_water_mark {
                    fire_high_water = Some(old_len + remaining);
                }
                state.output.append(&data[written..]);
                if !self.channel.is_writing() {
                    self.channel.enable_writing();
                }
            }
            fire_high_water
        };

        if remaining == 0 && !fault {
            if let Some(callback) = self.write_complete_callback() {
                let conn = self.upgrade();
                self.handle.queue_in_loop(move || callback(&conn));
            }
        }
        if let Some(queued) = fire_high_water {
            if let Some(callback) = self.high_water_mark_callback() {
                let conn = self.upgrade();
                self.handle.queue_in_loop(move || callback(&conn, queued));
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.handle.assert_in_loop_thread();
        // Still draining: the writable callback completes the shutdown
        // once the output buffer reaches length zero.
        if !self.channel.is_writing() {
            self.socket.shutdown_write();
        }
    }

    fn force_close_in_loop(&self) {
        self.handle.assert_in_loop_thread();
        let active = {
            let state = self.state.lock().unwrap();
            state.state == State::Connected || state.state == State::Disconnecting
        };
        if active {
            self.handle_close();
        }
    }

    fn start_read_in_loop(&self) {
        self.handle.assert_in_loop_thread();
        let mut state = self.state.lock().unwrap();
        if !state.reading || !self.channel.is_reading() {
            self.channel.enable_reading();
            state.reading = true;
        }
    }

    fn stop_read_in_loop(&self) {
        self.handle.assert_in_loop_thread();
        let mut state = self.state.lock().unwrap();
        if state.reading || self.channel.is_reading() {
            self.channel.disable_reading();
            state.reading = false;
        }
    }

    // Readable-readiness: pull bytes into the input buffer. Zero bytes is
    // an orderly peer close; a transient EAGAIN is ignored; anything else
    // goes down the error path.
    fn handle_read(&self) {
        self.handle.assert_in_loop_thread();
        let result = {
            let mut state = self.state.lock().unwrap();
            state.input.read_fd(self.channel.fd())
        };
        match result {
            Ok(0) => self.handle_close(),
            Ok(_) => {
                if let Some(callback) = self.message_callback() {
                    let conn = self.upgrade();
                    // The input buffer is handed to the callback outside
                    // the lock; only the loop thread touches it, so taking
                    // it out and restoring it afterwards is race-free.
                    let mut input = mem::take(&mut self.state.lock().unwrap().input);
                    callback(&conn, &mut input);
                    self.state.lock().unwrap().input = input;
                }
            }
            Err(err) => {
                if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                    return;
                }
                error!("TcpConnection::handle_read [{}]: {}", self.name, err);
                self.handle_error();
            }
        }
    }

    // Writable-readiness: drain the output buffer. On full drain the
    // write-interest is dropped, the write-complete callback is queued,
    // and a deferred shutdown proceeds.
    fn handle_write(&self) {
        self.handle.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!(
                "TcpConnection::handle_write [{}] fd = {} is down, no more writing",
                self.name,
                self.channel.fd()
            );
            return;
        }

        let (drained, shutdown_pending) = {
            let mut state = self.state.lock().unwrap();
            match socket::write(self.channel.fd(), state.output.peek()) {
                Ok(n) => {
                    state.output.retrieve(n);
                    if state.output.readable_bytes() == 0 {
                        self.channel.disable_writing();
                        (true, state.state == State::Disconnecting)
                    } else {
                        (false, false)
                    }
                }
                Err(err) => {
                    if err.raw_os_error() != Some(libc::EWOULDBLOCK) {
                        error!(
                            "TcpConnection::handle_write [{}]: {}",
                            self.name, err
                        );
                    }
                    (false, false)
                }
            }
        };

        if drained {
            if let Some(callback) = self.write_complete_callback() {
                let conn = self.upgrade();
                self.handle.queue_in_loop(move || callback(&conn));
            }
            if shutdown_pending {
                self.shutdown_in_loop();
            }
        }
    }

    // Close path, dispatched at most once: peer close (zero-length read or
    // hang-up) and force-close both land here.
    fn handle_close(&self) {
        self.handle.assert_in_loop_thread();
        {
            let mut state = self.state.lock().unwrap();
            if state.close_handled {
                return;
            }
            trace!(
                "TcpConnection::handle_close [{}] fd = {} state = {:?}",
                self.name,
                self.channel.fd(),
                state.state
            );
            assert!(
                state.state == State::Connected || state.state == State::Disconnecting
            );
            state.state = State::Disconnecting;
            state.close_handled = true;
        }
        self.channel.disable_all();

        let conn = self.upgrade();
        let close_callback = { self.callbacks.lock().unwrap().close.clone() };
        if let Some(callback) = close_callback {
            callback(&conn);
        }
    }

    fn handle_error(&self) {
        let err = socket::get_socket_error(self.channel.fd());
        error!(
            "TcpConnection::handle_error [{}] SO_ERROR = {} {}",
            self.name,
            err,
            io::Error::from_raw_os_error(err)
        );
    }

    fn connection_callback(&self) -> Option<ConnectionCallback> {
        self.callbacks.lock().unwrap().connection.clone()
    }

    fn message_callback(&self) -> Option<MessageCallback> {
        self.callbacks.lock().unwrap().message.clone()
    }

    fn write_complete_callback(&self) -> Option<WriteCompleteCallback> {
        self.callbacks.lock().unwrap().write_complete.clone()
    }

    fn high_water_mark_callback(&self) -> Option<HighWaterMarkCallback> {
        self.callbacks.lock().unwrap().high_water_mark.clone()
    }

    fn upgrade(&self) -> TcpConnectionPtr {
        self.self_ref.upgrade().expect("connection self reference")
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "TcpConnection::drop [{}] fd = {} state = {:?}",
            self.name,
            self.socket.fd(),
            self.state.lock().unwrap().state
        );
    }
}

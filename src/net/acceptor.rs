//! Listening-socket acceptor.
//!
//! Owns the listening descriptor and its channel, turning accept-readiness
//! into new connection descriptors forwarded to the owning collaborator.
//! Also owns one pre-opened idle descriptor held in reserve to survive
//! descriptor exhaustion: see the `EMFILE` handling in the read callback.

use crate::net::NewConnectionCallback;
use crate::net::socket::{self, Socket};
use crate::reactor::channel::Channel;
use crate::reactor::event_loop::LoopHandle;

use log::error;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Accepts incoming connections on one listening descriptor.
///
/// The acceptor binds in [`new`](Self::new) and starts listening in
/// [`listen`](Self::listen); each accept-readiness event yields at most one
/// accepted descriptor, handed to the new-connection callback together with
/// the peer address. An accepted descriptor with no callback installed is
/// closed immediately, never leaked.
pub struct Acceptor {
    handle: LoopHandle,
    accept_socket: Socket,
    accept_channel: Arc<Channel>,
    listening: AtomicBool,
    /// Reserve descriptor sacrificed and reopened to drain a pending
    /// connection when the process runs out of descriptors.
    idle_fd: Mutex<RawFd>,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Creates the listening socket (non-blocking, `SO_REUSEADDR`) and
    /// binds it to `listen_addr`.
    pub fn new(handle: LoopHandle, listen_addr: &SocketAddr) -> Arc<Self> {
        let file_descriptor = socket::create_nonblocking();

        Arc::new_cyclic(|self_ref: &Weak<Acceptor>| {
            let accept_socket = Socket::from_raw(file_descriptor);
            accept_socket.set_reuse_addr(true);
            accept_socket.bind_addr(listen_addr);

            let accept_channel = Channel::new(handle.clone(), file_descriptor);
            let weak = self_ref.clone();
            accept_channel.set_read_callback(move || {
                if let Some(acceptor) = weak.upgrade() {
                    acceptor.handle_read();
                }
            });

            Acceptor {
                handle,
                accept_socket,
                accept_channel,
                listening: AtomicBool::new(false),
                idle_fd: Mutex::new(open_idle_fd()),
                new_connection_callback: Mutex::new(None),
            }
        })
    }

    /// Installs the callback receiving each accepted descriptor and peer
    /// address.
    pub fn set_new_connection_callback(
        &self,
        callback: impl Fn(RawFd, SocketAddr) + Send + Sync + 'static,
    ) {
        *self.new_connection_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    /// The address the listening socket is bound to.
    ///
    /// Useful after binding to port 0 to learn the kernel-assigned port.
    pub fn listen_addr(&self) -> io::Result<SocketAddr> {
        socket::local_addr(self.accept_socket.fd())
    }

    /// Whether [`listen`](Self::listen) has been called.
    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Starts listening and enables accept-readiness.
    ///
    /// Idempotent: only the first call has any effect. Loop thread only.
    pub fn listen(&self) {
        self.handle.assert_in_loop_thread();
        if self.listening.swap(true, Ordering::SeqCst) {
            return;
        }
        self.accept_socket.listen();
        self.accept_channel.enable_reading();
    }

    // Accept-readiness: accept one pending connection and forward it.
    fn handle_read(&self) {
        self.handle.assert_in_loop_thread();
        match self.accept_socket.accept() {
            Ok((connection_fd, peer_addr)) => {
                let callback = { self.new_connection_callback.lock().unwrap().clone() };
                match callback {
                    Some(callback) => callback(connection_fd, peer_addr),
                    None => socket::close(connection_fd),
                }
            }
            Err(err) => match err.raw_os_error() {
                Some(libc::EMFILE) | Some(libc::ENFILE) => {
                    error!("Acceptor::handle_read out of file descriptors: {}", err);
                    self.drain_with_idle_fd();
                }
                // Transient conditions: the next readiness event retries.
                Some(libc::EAGAIN)
                | Some(libc::EINTR)
                | Some(libc::ECONNABORTED)
                | Some(libc::EPROTO)
                | Some(libc::EPERM) => {}
                _ => error!("Acceptor::handle_read unexpected accept error: {}", err),
            },
        }
    }

    // EMFILE mitigation: close the reserve descriptor to free one slot,
    // accept-and-close the pending connection (telling the peer it was
    // rejected), then reopen the reserve for the next exhaustion. Without
    // this, the accept-readiness event would be re-delivered in a tight
    // loop and starve the process.
    fn drain_with_idle_fd(&self) {
        let mut idle_fd = self.idle_fd.lock().unwrap();
        unsafe {
            libc::close(*idle_fd);
        }
        let drained = unsafe {
            libc::accept(self.accept_socket.fd(), ptr::null_mut(), ptr::null_mut())
        };
        if drained >= 0 {
            unsafe {
                libc::close(drained);
            }
        }
        *idle_fd = open_idle_fd();
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.accept_channel.disable_all();
        self.accept_channel.remove();
        unsafe {
            libc::close(*self.idle_fd.lock().unwrap());
        }
    }
}

/// Opens the reserve descriptor on `/dev/null`.
///
/// # Panics
/// Failing to open `/dev/null` at startup is fatal.
fn open_idle_fd() -> RawFd {
    let idle_fd = unsafe {
        libc::open(
            c"/dev/null".as_ptr(),
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if idle_fd < 0 {
        panic!(
            "Acceptor failed to open /dev/null: {}",
            io::Error::last_os_error()
        );
    }
    idle_fd
}

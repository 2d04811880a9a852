//! Raw socket operations and an owning descriptor wrapper.
//!
//! Thin non-blocking wrappers over the libc socket calls used by the
//! reactor: creation, bind/listen/accept/connect, vectored reads, writes,
//! half-close, and address conversion. All descriptors produced here are
//! non-blocking and close-on-exec.
//!
//! Errors are reported as [`io::Error`]; callers classify transient errno
//! values (`EAGAIN`, `EINTR`, `ECONNABORTED`, ...) themselves, since what is
//! retryable depends on who is asking (see the acceptor's accept path).

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::RawFd;

use log::error;

/// Creates a non-blocking, close-on-exec TCP socket.
///
/// # Panics
/// Socket creation only fails when the process is misconfigured or out of
/// descriptors at startup; both are fatal here, matching the reactor's
/// invariant-violation policy.
pub fn create_nonblocking() -> RawFd {
    let file_descriptor = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        )
    };
    if file_descriptor < 0 {
        panic!(
            "socket::create_nonblocking failed: {}",
            io::Error::last_os_error()
        );
    }
    file_descriptor
}

/// Binds `file_descriptor` to `addr`.
pub fn bind(file_descriptor: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let sockaddr = to_sockaddr_in(addr);
    let ret = unsafe {
        libc::bind(
            file_descriptor,
            &sockaddr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Puts `file_descriptor` into listen mode with the system maximum backlog.
pub fn listen(file_descriptor: RawFd) -> io::Result<()> {
    let ret = unsafe { libc::listen(file_descriptor, libc::SOMAXCONN) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Accepts one pending connection.
///
/// The accepted descriptor is created non-blocking and close-on-exec via
/// `accept4`.
///
/// # Returns
/// The new descriptor and the peer's address, or the raw I/O error for the
/// caller to classify (transient versus unexpected).
pub fn accept(file_descriptor: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let conn_fd = unsafe {
        libc::accept4(
            file_descriptor,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if conn_fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((conn_fd, from_sockaddr_in(&addr)))
}

/// Starts a non-blocking connect to `addr`.
pub fn connect(file_descriptor: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let sockaddr = to_sockaddr_in(addr);
    let ret = unsafe {
        libc::connect(
            file_descriptor,
            &sockaddr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Reads into `buf`, returning the number of bytes read.
pub fn read(file_descriptor: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(file_descriptor, buf.as_mut_ptr() as *mut _, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Writes `buf`, returning the number of bytes accepted by the kernel.
pub fn write(file_descriptor: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(file_descriptor, buf.as_ptr() as *const _, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Closes `file_descriptor`, logging (not propagating) failure.
pub fn close(file_descriptor: RawFd) {
    let ret = unsafe { libc::close(file_descriptor) };
    if ret < 0 {
        error!(
            "socket::close fd = {} failed: {}",
            file_descriptor,
            io::Error::last_os_error()
        );
    }
}

/// Shuts down the write half of the connection (half-close).
pub fn shutdown_write(file_descriptor: RawFd) {
    let ret = unsafe { libc::shutdown(file_descriptor, libc::SHUT_WR) };
    if ret < 0 {
        error!(
            "socket::shutdown_write fd = {} failed: {}",
            file_descriptor,
            io::Error::last_os_error()
        );
    }
}

/// Retrieves and clears the pending error on a socket (`SO_ERROR`).
pub fn get_socket_error(file_descriptor: RawFd) -> i32 {
    let mut optval: libc::c_int = 0;
    let mut optlen = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            file_descriptor,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut optval as *mut _ as *mut _,
            &mut optlen,
        )
    };
    if ret < 0 {
        return io::Error::last_os_error().raw_os_error().unwrap_or(0);
    }
    optval
}

/// Returns the local address the socket is bound to.
pub fn local_addr(file_descriptor: RawFd) -> io::Result<SocketAddr> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(
            file_descriptor,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(from_sockaddr_in(&addr))
}

/// Returns the address of the connected peer.
pub fn peer_addr(file_descriptor: RawFd) -> io::Result<SocketAddr> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getpeername(
            file_descriptor,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(from_sockaddr_in(&addr))
}

/// Detects a TCP self-connection (local and peer endpoints identical).
pub fn is_self_connect(file_descriptor: RawFd) -> bool {
    match (local_addr(file_descriptor), peer_addr(file_descriptor)) {
        (Ok(local), Ok(peer)) => local == peer,
        _ => false,
    }
}

/// Converts a [`SocketAddr`] to the C representation.
///
/// Only IPv4 addresses are supported by this reactor.
pub fn to_sockaddr_in(addr: &SocketAddr) -> libc::sockaddr_in {
    let v4 = match addr {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => panic!("IPv6 addresses are not supported"),
    };
    let mut out: libc::sockaddr_in = unsafe { mem::zeroed() };
    out.sin_family = libc::AF_INET as libc::sa_family_t;
    out.sin_port = v4.port().to_be();
    out.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
    out
}

/// Converts the C address representation back to a [`SocketAddr`].
pub fn from_sockaddr_in(addr: &libc::sockaddr_in) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
        u16::from_be(addr.sin_port),
    ))
}

/// An owning wrapper around one socket descriptor.
///
/// The socket closes its descriptor exactly once, on drop. Everything else
/// in the reactor borrows the descriptor; only `Socket` owns it.
pub struct Socket {
    file_descriptor: RawFd,
}

impl Socket {
    /// Takes ownership of an already-created descriptor.
    pub fn from_raw(file_descriptor: RawFd) -> Self {
        Self { file_descriptor }
    }

    /// The wrapped descriptor. The caller must not close it.
    pub fn fd(&self) -> RawFd {
        self.file_descriptor
    }

    /// Binds to `addr`.
    ///
    /// # Panics
    /// A bind failure at startup (port in use, no permission) is fatal.
    pub fn bind_addr(&self, addr: &SocketAddr) {
        if let Err(err) = bind(self.file_descriptor, addr) {
            panic!("Socket::bind_addr {} failed: {}", addr, err);
        }
    }

    /// Starts listening.
    ///
    /// # Panics
    /// A listen failure at startup is fatal.
    pub fn listen(&self) {
        if let Err(err) = listen(self.file_descriptor) {
            panic!("Socket::listen failed: {}", err);
        }
    }

    /// Accepts one pending connection, see [`accept`].
    pub fn accept(&self) -> io::Result<(RawFd, SocketAddr)> {
        accept(self.file_descriptor)
    }

    /// Half-closes the write direction.
    pub fn shutdown_write(&self) {
        shutdown_write(self.file_descriptor);
    }

    /// Enables or disables `SO_REUSEADDR`.
    pub fn set_reuse_addr(&self, on: bool) {
        self.set_int_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, on, "SO_REUSEADDR");
    }

    /// Enables or disables `TCP_NODELAY` (Nagle's algorithm).
    pub fn set_tcp_no_delay(&self, on: bool) {
        self.set_int_option(libc::IPPROTO_TCP, libc::TCP_NODELAY, on, "TCP_NODELAY");
    }

    /// Enables or disables `SO_KEEPALIVE`.
    pub fn set_keep_alive(&self, on: bool) {
        self.set_int_option(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on, "SO_KEEPALIVE");
    }

    fn set_int_option(&self, level: i32, option: i32, on: bool, name: &str) {
        let optval: libc::c_int = if on { 1 } else { 0 };
        let ret = unsafe {
            libc::setsockopt(
                self.file_descriptor,
                level,
                option,
                &optval as *const _ as *const _,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            error!(
                "Socket::set_int_option {} fd = {} failed: {}",
                name,
                self.file_descriptor,
                io::Error::last_os_error()
            );
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        close(self.file_descriptor);
    }
}

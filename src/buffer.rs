//! Growable byte buffer for connection input/output staging.
//!
//! The buffer keeps its content between a read index and a write index inside
//! one `Vec<u8>`: collaborators append at the back and consume from the front,
//! and the space already consumed is reclaimed by compaction before the
//! backing storage grows.
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | consumed (spare)  |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0              read_index         write_index          capacity
//! ```

use std::io;
use std::os::fd::RawFd;

/// Initial capacity of a fresh buffer, in bytes.
const INITIAL_SIZE: usize = 1024;

/// Size of the stack-allocated spill buffer used by [`Buffer::read_fd`].
const EXTRA_BUFFER_SIZE: usize = 65536;

/// An append-then-drain byte buffer with an internal read cursor.
///
/// One buffer is owned per direction by each connection: the readable
/// callback appends incoming bytes, the application peeks and consumes
/// them; symmetrically for the output direction.
pub struct Buffer {
    data: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Buffer {
    /// Creates an empty buffer with the default initial capacity.
    pub fn new() -> Self {
        Self {
            data: vec![0; INITIAL_SIZE],
            read_index: 0,
            write_index: 0,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    /// Number of bytes that can be appended without growing.
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_index
    }

    /// Returns the readable region without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_index..self.write_index]
    }

    /// Appends `bytes` at the write index, growing the buffer if needed.
    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        self.data[self.write_index..self.write_index + bytes.len()].copy_from_slice(bytes);
        self.write_index += bytes.len();
    }

    /// Consumes `n` readable bytes.
    ///
    /// # Panics
    /// Panics if `n` exceeds [`readable_bytes`](Self::readable_bytes).
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.read_index += n;
        } else {
            self.retrieve_all();
        }
    }

    /// Consumes everything, resetting both indices.
    pub fn retrieve_all(&mut self) {
        self.read_index = 0;
        self.write_index = 0;
    }

    /// Consumes `n` readable bytes and returns them as an owned vector.
    pub fn retrieve_as_bytes(&mut self, n: usize) -> Vec<u8> {
        assert!(n <= self.readable_bytes());
        let out = self.data[self.read_index..self.read_index + n].to_vec();
        self.retrieve(n);
        out
    }

    /// Consumes the whole readable region and returns it as an owned vector.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        let n = self.readable_bytes();
        self.retrieve_as_bytes(n)
    }

    /// Searches the readable region for `needle`.
    ///
    /// # Returns
    /// The offset of the first occurrence relative to the read index, or
    /// `None` if the delimiter is not present.
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() || needle.len() > self.readable_bytes() {
            return None;
        }
        self.peek()
            .windows(needle.len())
            .position(|window| window == needle)
    }

    /// Reads from a descriptor directly into the buffer.
    ///
    /// Performs one scatter read (`readv`) into the writable region plus a
    /// 64 KiB stack spill buffer, so a single syscall can pull in more than
    /// the currently writable space; any spill is appended afterwards. This
    /// keeps the common case at one read without pre-growing the buffer.
    ///
    /// # Returns
    /// The number of bytes read (zero signals peer close), or the I/O error
    /// reported by the kernel.
    pub fn read_fd(&mut self, file_descriptor: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUFFER_SIZE];
        let writable = self.writable_bytes();

        let iov = [
            libc::iovec {
                iov_base: self.data[self.write_index..].as_mut_ptr() as *mut _,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut _,
                iov_len: extra.len(),
            },
        ];

        let n = unsafe { libc::readv(file_descriptor, iov.as_ptr(), 2) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let n = n as usize;
        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.data.len();
            self.append(&extra[..n - writable]);
        }

        Ok(n)
    }

    // Reclaims consumed space by compaction when that is enough, otherwise
    // grows the backing storage.
    fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() >= n {
            return;
        }

        if self.read_index + self.writable_bytes() >= n {
            let readable = self.readable_bytes();
            self.data.copy_within(self.read_index..self.write_index, 0);
            self.read_index = 0;
            self.write_index = readable;
        } else {
            self.data.resize(self.write_index + n, 0);
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

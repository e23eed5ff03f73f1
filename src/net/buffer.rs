use std::io;
use std::os::unix::io::RawFd;

use bytes::Bytes;

const CRLF: &[u8] = b"\r\n";

/// Growable byte buffer backing non-blocking socket I/O.
///
/// Layout is three regions over one contiguous allocation:
///
/// ```text
/// | prependable | readable | writable |
/// 0        read_index  write_index  capacity
/// ```
///
/// The first [`Buffer::PREPEND_SIZE`] bytes are reserved so a length or
/// framing prefix can be added without moving payload bytes. When writable
/// space runs short, readable bytes are shifted back to the reserve before
/// the backing store grows.
pub struct Buffer {
    storage: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Buffer {
    pub const INITIAL_SIZE: usize = 1024;
    pub const PREPEND_SIZE: usize = 8;

    pub fn new() -> Self {
        Self::with_capacity(Self::INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Self {
        Buffer {
            storage: vec![0; Self::PREPEND_SIZE + initial_size],
            read_index: Self::PREPEND_SIZE,
            write_index: Self::PREPEND_SIZE,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.write_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_index..self.write_index]
    }

    /// Consume `len` readable bytes; consuming past the end drains everything.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.read_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_index = Self::PREPEND_SIZE;
        self.write_index = Self::PREPEND_SIZE;
    }

    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        let len = len.min(self.readable_bytes());
        let result = String::from_utf8_lossy(&self.peek()[..len]).into_owned();
        self.retrieve(len);
        result
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        let len = self.readable_bytes();
        self.retrieve_as_string(len)
    }

    pub fn retrieve_as_bytes(&mut self, len: usize) -> Bytes {
        let len = len.min(self.readable_bytes());
        let result = Bytes::copy_from_slice(&self.peek()[..len]);
        self.retrieve(len);
        result
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.write_index;
        self.storage[start..start + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// The writable region; pair with [`Buffer::has_written`] after filling
    /// it directly.
    pub fn begin_write(&mut self) -> &mut [u8] {
        let start = self.write_index;
        &mut self.storage[start..]
    }

    /// Mark `len` bytes of the writable region as filled.
    pub fn has_written(&mut self, len: usize) {
        debug_assert!(len <= self.writable_bytes());
        self.write_index += len;
    }

    /// Scatter-read from `fd` into the writable region plus a 64 KiB stack
    /// buffer, so one syscall can pick up much more than the current
    /// writable space; any overflow is appended after growing.
    ///
    /// Returns `Ok(0)` on EOF. `WouldBlock` surfaces as an error of that
    /// kind, which edge-triggered read loops treat as "drained".
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; 65536];
        let writable = self.writable_bytes();

        let iov = [
            libc::iovec {
                iov_base: unsafe { self.storage.as_mut_ptr().add(self.write_index) } as *mut _,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut _,
                iov_len: extra.len(),
            },
        ];
        let iovcnt = if writable < extra.len() { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let n = n as usize;
        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.storage.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// First CRLF at or after `start` (an offset into the readable region).
    pub fn find_crlf(&self, start: usize) -> Option<usize> {
        let readable = self.peek();
        readable[start.min(readable.len())..]
            .windows(CRLF.len())
            .position(|w| w == CRLF)
            .map(|pos| start + pos)
    }

    /// First LF at or after `start` (an offset into the readable region).
    pub fn find_eol(&self, start: usize) -> Option<usize> {
        let readable = self.peek();
        readable[start.min(readable.len())..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|pos| start + pos)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + Self::PREPEND_SIZE {
            self.storage.resize(self.write_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.storage.copy_within(self.read_index..self.write_index, Self::PREPEND_SIZE);
            self.read_index = Self::PREPEND_SIZE;
            self.write_index = self.read_index + readable;
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

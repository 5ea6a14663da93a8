//! A fixed-capacity ring buffer for reading data from the network.
//!
//! The `RingBuffer` absorbs partial reads: bytes arrive at the write cursor in whatever
//! pieces the transport hands out and are consumed at the read cursor once a whole
//! frame is present. Both cursors wrap at the end of the storage, and an explicit
//! count of unread bytes keeps "full" and "empty" apart, so the whole capacity is usable.

use std::io::{ErrorKind, Read, Result as IoResult};

use bytes::Buf;
use log::*;

/// A fixed-capacity FIFO buffer with wrapping read and write cursors.
#[derive(Debug)]
pub struct RingBuffer {
    storage: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    len: usize,
}

impl RingBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { storage: vec![0; capacity].into_boxed_slice(), read_pos: 0, write_pos: 0, len: 0 }
    }

    /// Create a buffer that already holds `part`, e.g. bytes read past the handshake.
    ///
    /// Data beyond `capacity` is dropped.
    pub fn from_partially_read(part: &[u8], capacity: usize) -> Self {
        let mut buffer = Self::with_capacity(capacity);
        let written = buffer.write(&part[..part.len().min(capacity)]);
        if written < part.len() {
            warn!("Dropped {} bytes that do not fit the read buffer", part.len() - written);
        }
        buffer
    }

    /// Total number of bytes the buffer can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of unread bytes.
    #[inline]
    pub fn available_to_read(&self) -> usize {
        self.len
    }

    /// Number of bytes that can be written without overwriting unread data.
    #[inline]
    pub fn available_to_write(&self) -> usize {
        self.capacity() - self.len
    }

    /// Copy as many of `bytes` as fit, wrapping at the end of the storage.
    ///
    /// Returns the number of bytes written. A slice longer than the whole capacity is
    /// rejected and nothing is written.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        if bytes.len() > self.capacity() {
            return 0;
        }
        let count = bytes.len().min(self.available_to_write());
        let first = count.min(self.capacity() - self.write_pos);
        self.storage[self.write_pos..self.write_pos + first].copy_from_slice(&bytes[..first]);
        self.storage[..count - first].copy_from_slice(&bytes[first..count]);
        self.advance_write(count);
        count
    }

    /// The contiguous free region starting at the write cursor.
    ///
    /// Fill it directly and call [`bump`](Self::bump) with the number of bytes written.
    pub fn write_window(&mut self) -> &mut [u8] {
        let end = if self.len > 0 && self.write_pos <= self.read_pos {
            self.read_pos
        } else {
            self.capacity()
        };
        &mut self.storage[self.write_pos..end]
    }

    /// Advance the write cursor by `n` bytes already placed into the write window.
    ///
    /// The cursor wraps at the end of the storage; the advance is clamped to the free
    /// space. Returns the number of bytes actually committed, `0` if `n` exceeds the
    /// capacity.
    pub fn bump(&mut self, n: usize) -> usize {
        if n > self.capacity() {
            return 0;
        }
        let count = n.min(self.available_to_write());
        self.advance_write(count);
        count
    }

    /// Release `n` unread bytes, making room for writing.
    ///
    /// Returns the number of bytes released, `0` if `n` exceeds the capacity.
    pub fn consume(&mut self, n: usize) -> usize {
        if n > self.capacity() {
            return 0;
        }
        let count = n.min(self.len);
        self.advance_read(count);
        count
    }

    /// Copy out and consume up to `n` unread bytes.
    pub fn get_data(&mut self, n: usize) -> Vec<u8> {
        let count = n.min(self.len);
        let mut data = Vec::with_capacity(count);
        let first = count.min(self.capacity() - self.read_pos);
        data.extend_from_slice(&self.storage[self.read_pos..self.read_pos + first]);
        data.extend_from_slice(&self.storage[..count - first]);
        self.advance_read(count);
        data
    }

    /// Look at the unread byte at `offset` without consuming anything.
    pub fn peek(&self, offset: usize) -> Option<u8> {
        if offset >= self.len {
            return None;
        }
        Some(self.storage[(self.read_pos + offset) % self.capacity()])
    }

    /// Move both cursors back to the start of the storage.
    ///
    /// Only an empty buffer is reset; unread data is never discarded.
    pub fn reset(&mut self) {
        if self.len == 0 {
            self.read_pos = 0;
            self.write_pos = 0;
        } else {
            warn!("Refusing to reset a ring buffer with {} unread bytes", self.len);
        }
    }

    /// Read the next portion of data from the given input stream into the write window.
    ///
    /// Returns `Ok(0)` both on end of stream and when the buffer is full; check
    /// [`available_to_write`](Self::available_to_write) to tell them apart.
    pub fn read_from<S: Read>(&mut self, stream: &mut S) -> IoResult<usize> {
        let size = loop {
            let window = self.write_window();
            if window.is_empty() {
                return Ok(0);
            }
            match stream.read(window) {
                Ok(size) => break size.min(window.len()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        trace!("Read {} bytes into the ring buffer", size);
        self.advance_write(size);
        Ok(size)
    }

    fn advance_write(&mut self, count: usize) {
        if self.capacity() == 0 {
            return;
        }
        self.write_pos = (self.write_pos + count) % self.capacity();
        self.len += count;
    }

    fn advance_read(&mut self, count: usize) {
        if self.capacity() == 0 {
            return;
        }
        self.read_pos = (self.read_pos + count) % self.capacity();
        self.len -= count;
        if self.len == 0 {
            self.reset();
        }
    }
}

impl Buf for RingBuffer {
    fn remaining(&self) -> usize {
        self.len
    }

    fn chunk(&self) -> &[u8] {
        let end = (self.read_pos + self.len).min(self.capacity());
        &self.storage[self.read_pos..end]
    }

    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.len, "cannot advance past the unread data");
        self.advance_read(cnt);
    }
}

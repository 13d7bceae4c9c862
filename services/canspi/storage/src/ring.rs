//! Fixed-capacity FIFO byte buffer.

use crate::StorageError;
use bytes::{Buf, BytesMut};

/// Bounded FIFO of bytes.
///
/// Bytes live in a `BytesMut`; `capacity` caps how much it may hold.
/// Writes that do not fit are rejected whole.
#[derive(Debug, Clone)]
pub struct ByteQueue {
    buf: BytesMut,
    capacity: usize,
}

impl ByteQueue {
    /// Create an empty queue holding at most `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Maximum number of bytes the queue can hold
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the queue holds no bytes
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Free space in bytes
    pub fn free(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Append all of `data`, or nothing if it does not fit
    pub fn enqueue(&mut self, data: &[u8]) -> Result<(), StorageError> {
        if data.len() > self.free() {
            return Err(StorageError::Full {
                needed: data.len(),
                free: self.free(),
            });
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Remove exactly `out.len()` bytes from the front into `out`
    pub fn dequeue_exact(&mut self, out: &mut [u8]) -> Result<(), StorageError> {
        self.copy_out(0, out)?;
        self.buf.advance(out.len());
        Ok(())
    }

    /// Remove and return the oldest byte
    pub fn pop_front(&mut self) -> Option<u8> {
        if self.buf.is_empty() {
            return None;
        }
        Some(self.buf.get_u8())
    }

    /// Byte at `offset` from the front, without removing it
    pub fn peek(&self, offset: usize) -> Option<u8> {
        self.buf.get(offset).copied()
    }

    /// Copy `out.len()` bytes starting at `offset` without removing them
    pub fn copy_out(&self, offset: usize, out: &mut [u8]) -> Result<(), StorageError> {
        let wanted = offset + out.len();
        if wanted > self.buf.len() {
            return Err(StorageError::Underflow {
                wanted,
                available: self.buf.len(),
            });
        }
        out.copy_from_slice(&self.buf[offset..wanted]);
        Ok(())
    }

    /// Drop every buffered byte
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

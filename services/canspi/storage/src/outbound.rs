//! Multi-producer outbound queue of pre-encoded wire frames.
//!
//! Producers append whole frames under one lock acquisition, so frames from
//! racing producers never interleave. The exchange loop is the only consumer
//! and takes exactly one frame per transfer.

use crate::ring::ByteQueue;
use crate::StorageError;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Default outbound capacity (1 MiB)
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024 * 1024;

/// Counters for an outbound queue
#[derive(Debug, Clone, Default, Serialize)]
pub struct OutboundStats {
    /// Frames accepted by `push`
    pub frames_enqueued: u64,
    /// Frames handed to the consumer
    pub frames_dequeued: u64,
    /// Pushes rejected because the queue was full
    pub frames_rejected: u64,
}

/// Bounded byte queue whose contents are always whole frames of `unit` bytes
#[derive(Debug)]
pub struct OutboundQueue {
    inner: Mutex<ByteQueue>,
    unit: usize,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    rejected: AtomicU64,
}

impl OutboundQueue {
    /// Create a queue of frames `unit` bytes long with room for `capacity` bytes.
    ///
    /// The capacity is rounded down to a whole number of frames.
    pub fn new(unit: usize, capacity: usize) -> Self {
        assert!(unit > 0, "frame unit must be non-zero");
        let capacity = capacity - capacity % unit;
        Self {
            inner: Mutex::new(ByteQueue::with_capacity(capacity)),
            unit,
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Frame length this queue is aligned to
    pub fn unit(&self) -> usize {
        self.unit
    }

    /// Append one or more whole frames.
    ///
    /// Rejects the whole write with [`StorageError::Full`] when it does not fit;
    /// nothing is dropped from the queue to make room.
    pub fn push(&self, frames: &[u8]) -> Result<(), StorageError> {
        if frames.len() % self.unit != 0 {
            return Err(StorageError::Misaligned {
                len: frames.len(),
                unit: self.unit,
            });
        }

        let result = self.lock().enqueue(frames);
        match result {
            Ok(()) => {
                self.enqueued
                    .fetch_add((frames.len() / self.unit) as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.rejected
                    .fetch_add((frames.len() / self.unit) as u64, Ordering::Relaxed);
                debug!("Outbound push rejected: {}", e);
                Err(e)
            }
        }
    }

    /// Remove the oldest frame into `out`, which must be exactly one unit long.
    ///
    /// Returns `false` when less than a whole frame is queued.
    pub fn pop_frame(&self, out: &mut [u8]) -> bool {
        debug_assert_eq!(out.len(), self.unit);
        let mut queue = self.lock();
        if queue.len() < self.unit {
            return false;
        }
        // Length checked above under the same lock
        if queue.dequeue_exact(out).is_err() {
            return false;
        }
        drop(queue);
        self.dequeued.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Remove up to `out.len()` bytes regardless of frame alignment.
    ///
    /// Used by pass-through links, which queue raw bytes of unit 1.
    pub fn pop_partial(&self, out: &mut [u8]) -> usize {
        let mut queue = self.lock();
        let n = out.len().min(queue.len());
        if queue.dequeue_exact(&mut out[..n]).is_err() {
            return 0;
        }
        n
    }

    /// Whether at least one whole frame is queued
    pub fn has_frame(&self) -> bool {
        self.lock().len() >= self.unit
    }

    /// Number of whole frames queued
    pub fn frames(&self) -> usize {
        self.lock().len() / self.unit
    }

    /// Number of queued bytes
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Capacity in bytes
    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    /// Snapshot of the queue counters
    pub fn stats(&self) -> OutboundStats {
        OutboundStats {
            frames_enqueued: self.enqueued.load(Ordering::Relaxed),
            frames_dequeued: self.dequeued.load(Ordering::Relaxed),
            frames_rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ByteQueue> {
        // A panicking producer cannot leave a partial frame behind: enqueue is all-or-nothing
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

//! Bounded byte storage for canspi: the reassembly ring and the outbound frame queue.
//!
//! This crate provides the two buffers the link is built on. [`ByteQueue`] is a
//! bounded FIFO byte buffer on `BytesMut`, owned by a single context (the frame
//! assembler, or the outbound queue under its lock). [`OutboundQueue`] wraps one
//! in a mutex so any number of producers can append whole wire frames while the
//! exchange loop drains them one frame at a time.
//!
//! ## Overflow
//!
//! Neither buffer ever overwrites data. An enqueue that does not fit is rejected
//! with [`StorageError::Full`] and leaves the buffer untouched.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod outbound;
pub mod ring;

use thiserror::Error;

pub use outbound::{OutboundQueue, OutboundStats, DEFAULT_OUTBOUND_CAPACITY};
pub use ring::ByteQueue;

/// Storage errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Not enough free space for the whole write
    #[error("queue full: need {needed} bytes, {free} free")]
    Full {
        /// Bytes the caller tried to enqueue
        needed: usize,
        /// Bytes currently free
        free: usize,
    },
    /// Fewer bytes buffered than requested
    #[error("queue underflow: want {wanted} bytes, {available} available")]
    Underflow {
        /// Bytes the caller asked for
        wanted: usize,
        /// Bytes currently buffered
        available: usize,
    },
    /// Write is not a whole number of frames
    #[error("misaligned write: {len} bytes is not a multiple of {unit}")]
    Misaligned {
        /// Length of the rejected write
        len: usize,
        /// Frame unit of the queue
        unit: usize,
    },
}

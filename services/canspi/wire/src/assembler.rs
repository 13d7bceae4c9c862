//! Reassembly of fixed-head frames from an arbitrarily chunked byte stream.
//!
//! The assembler matches the head pattern one byte at a time and then takes the
//! rest of the frame in one step. A head mismatch drops exactly one byte and
//! starts over at the next one, so alignment is recovered inside a corrupted
//! stream after at most one frame length of drops.
//!
//! # Example
//!
//! ```
//! use canspi_wire::{encode, CanFrame, FrameAssembler};
//!
//! let frame = CanFrame::new(0x123, &[1, 2, 3]).unwrap();
//! let bytes = encode(&frame, 0);
//!
//! let mut assembler = FrameAssembler::can_spi("spi_can");
//! let mut frames = Vec::new();
//! assembler.feed(&bytes[..5], |f| frames.push(f.to_vec()));
//! assembler.feed(&bytes[5..], |f| frames.push(f.to_vec()));
//!
//! assert_eq!(frames, vec![bytes.to_vec()]);
//! ```

use crate::frame::{HEAD_SIGN, WIRE_FRAME_LEN};
use canspi_storage::ByteQueue;
use smallvec::{smallvec, SmallVec};
use std::fmt;
use tracing::{debug, warn};

/// Default reassembly buffer size
pub const DEFAULT_ASSEMBLER_CAPACITY: usize = 2048;

/// Resolves how many payload bytes follow a base frame.
///
/// Called once per frame, after exactly `frame_len` bytes have been taken,
/// with those bytes as `header`.
pub trait LengthResolver: Send {
    /// Extra bytes belonging to this frame, or `None` for a fixed-size frame
    fn extra_len(&self, header: &[u8]) -> Option<usize>;
}

impl<F> LengthResolver for F
where
    F: Fn(&[u8]) -> Option<usize> + Send,
{
    fn extra_len(&self, header: &[u8]) -> Option<usize> {
        self(header)
    }
}

/// Shape of the frames an assembler extracts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblerMeta {
    /// Sync pattern every frame starts with
    pub head: SmallVec<[u8; 2]>,
    /// Base frame length, head included
    pub frame_len: usize,
    /// Reassembly buffer size
    pub capacity: usize,
}

impl AssemblerMeta {
    /// Fixed 16-byte CAN-over-SPI frames
    pub fn can_spi() -> Self {
        Self {
            head: smallvec![HEAD_SIGN],
            frame_len: WIRE_FRAME_LEN,
            capacity: DEFAULT_ASSEMBLER_CAPACITY,
        }
    }
}

/// Outcome of a single `feed` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedReport {
    /// Frames handed to the callback
    pub frames: usize,
    /// Single-byte drops after a head mismatch
    pub resyncs: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extract {
    Complete,
    Incomplete,
    Corrupt,
}

/// Byte-stream frame assembler for one channel
pub struct FrameAssembler {
    name: String,
    meta: AssemblerMeta,
    queue: ByteQueue,
    consumed: usize,
    extra_len: usize,
    resolver: Option<Box<dyn LengthResolver>>,
    scratch: Vec<u8>,
    received: u64,
    resyncs: u64,
}

impl FrameAssembler {
    /// Create an assembler for frames shaped like `meta`
    pub fn new(name: impl Into<String>, meta: AssemblerMeta) -> Self {
        assert!(!meta.head.is_empty(), "head pattern must not be empty");
        assert!(
            meta.head.len() <= meta.frame_len && meta.frame_len <= meta.capacity,
            "head <= frame_len <= capacity"
        );
        Self {
            name: name.into(),
            queue: ByteQueue::with_capacity(meta.capacity),
            scratch: Vec::with_capacity(meta.frame_len),
            meta,
            consumed: 0,
            extra_len: 0,
            resolver: None,
            received: 0,
            resyncs: 0,
        }
    }

    /// Assembler for CAN-over-SPI wire frames
    pub fn can_spi(name: impl Into<String>) -> Self {
        Self::new(name, AssemblerMeta::can_spi())
    }

    /// Install a resolver for variable-length frames
    pub fn with_length_resolver(mut self, resolver: impl LengthResolver + 'static) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    /// Append `chunk` and hand every complete frame to `on_frame`, in stream order.
    ///
    /// Chunks larger than the free buffer space are taken piecewise with
    /// extraction in between, so no input is ever refused.
    pub fn feed<F>(&mut self, mut chunk: &[u8], mut on_frame: F) -> FeedReport
    where
        F: FnMut(&[u8]),
    {
        let mut report = FeedReport::default();
        loop {
            let take = chunk.len().min(self.queue.free());
            if let Err(e) = self.queue.enqueue(&chunk[..take]) {
                warn!("Assembler {} enqueue failed: {}", self.name, e);
                break;
            }
            chunk = &chunk[take..];

            self.drain(&mut on_frame, &mut report);

            if chunk.is_empty() {
                break;
            }
            if self.queue.free() == 0 {
                // Full buffer with no extractable frame: force progress
                self.resync();
                report.resyncs += 1;
            }
        }
        report
    }

    fn drain<F>(&mut self, on_frame: &mut F, report: &mut FeedReport)
    where
        F: FnMut(&[u8]),
    {
        loop {
            match self.try_extract() {
                Extract::Complete => {
                    let total = self.required();
                    self.scratch.resize(total, 0);
                    if let Err(e) = self.queue.dequeue_exact(&mut self.scratch[..total]) {
                        warn!("Assembler {} lost frame window: {}", self.name, e);
                        self.reset();
                        return;
                    }
                    self.reset();
                    self.received += 1;
                    report.frames += 1;
                    on_frame(&self.scratch[..total]);
                }
                Extract::Corrupt => {
                    self.resync();
                    report.resyncs += 1;
                }
                Extract::Incomplete => return,
            }
        }
    }

    fn try_extract(&mut self) -> Extract {
        let head_len = self.meta.head.len();

        while self.consumed < self.required() {
            let reading_head = self.consumed < head_len;
            let want = if reading_head {
                1
            } else {
                self.required() - self.consumed
            };

            let available = self.queue.len() - self.consumed;
            if available == 0 {
                return Extract::Incomplete;
            }
            self.consumed += want.min(available);

            if reading_head {
                let offset = self.consumed - 1;
                if self.queue.peek(offset) != Some(self.meta.head[offset]) {
                    return Extract::Corrupt;
                }
            }

            if self.consumed == self.meta.frame_len {
                if let Some(resolver) = self.resolver.as_ref() {
                    let frame_len = self.meta.frame_len;
                    self.scratch.resize(frame_len, 0);
                    if self.queue.copy_out(0, &mut self.scratch[..frame_len]).is_err() {
                        return Extract::Corrupt;
                    }
                    if let Some(extra) = resolver.extra_len(&self.scratch[..frame_len]) {
                        self.extra_len = extra;
                    }
                    if self.required() > self.queue.capacity() {
                        debug!(
                            "Assembler {}: declared frame of {} bytes exceeds buffer of {}",
                            self.name,
                            self.required(),
                            self.queue.capacity()
                        );
                        return Extract::Corrupt;
                    }
                }
            }
        }

        Extract::Complete
    }

    fn resync(&mut self) {
        if let Some(byte) = self.queue.pop_front() {
            debug!("Head mismatch on {}, dropped 0x{:02x}", self.name, byte);
        }
        self.resyncs += 1;
        self.reset();
    }

    fn required(&self) -> usize {
        self.meta.frame_len + self.extra_len
    }

    /// Forget any partially matched frame; buffered bytes are kept
    pub fn reset(&mut self) {
        self.consumed = 0;
        self.extra_len = 0;
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Frame shape
    pub fn meta(&self) -> &AssemblerMeta {
        &self.meta
    }

    /// Frames extracted since creation or the last clear
    pub fn received_frames(&self) -> u64 {
        self.received
    }

    /// Reset the extracted-frame counter
    pub fn clear_received_frames(&mut self) {
        self.received = 0;
    }

    /// Single-byte resync drops since creation
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Bytes of the current candidate frame already taken
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Bytes held in the reassembly buffer
    pub fn buffered(&self) -> usize {
        self.queue.len()
    }
}

impl fmt::Debug for FrameAssembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameAssembler")
            .field("name", &self.name)
            .field("meta", &self.meta)
            .field("buffered", &self.queue.len())
            .field("consumed", &self.consumed)
            .field("extra_len", &self.extra_len)
            .field("received", &self.received)
            .field("resyncs", &self.resyncs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_verify, encode};
    use crate::frame::CanFrame;
    use rand::{Rng, SeedableRng};

    fn stream(n: usize) -> (Vec<CanFrame>, Vec<u8>) {
        let frames: Vec<CanFrame> = (0..n)
            .map(|i| CanFrame::new(0x100 + i as u32, &[i as u8; 8][..i % 9]).unwrap())
            .collect();
        let bytes = frames.iter().flat_map(|f| encode(f, 0)).collect();
        (frames, bytes)
    }

    fn collect(assembler: &mut FrameAssembler, chunks: &[&[u8]]) -> (Vec<CanFrame>, FeedReport) {
        let mut out = Vec::new();
        let mut total = FeedReport::default();
        for chunk in chunks {
            let report = assembler.feed(chunk, |bytes| {
                out.push(decode_verify(bytes).unwrap().frame);
            });
            total.frames += report.frames;
            total.resyncs += report.resyncs;
        }
        (out, total)
    }

    #[test]
    fn test_whole_stream_at_once() {
        let (frames, bytes) = stream(10);
        let mut a = FrameAssembler::can_spi("test");
        let (got, report) = collect(&mut a, &[&bytes]);
        assert_eq!(got, frames);
        assert_eq!(report.frames, 10);
        assert_eq!(report.resyncs, 0);
        assert_eq!(a.received_frames(), 10);
        assert_eq!(a.buffered(), 0);

        a.clear_received_frames();
        assert_eq!(a.received_frames(), 0);
        collect(&mut a, &[&bytes[..WIRE_FRAME_LEN]]);
        assert_eq!(a.received_frames(), 1);
    }

    #[test]
    fn test_one_byte_at_a_time() {
        let (frames, bytes) = stream(7);
        let mut a = FrameAssembler::can_spi("test");
        let chunks: Vec<&[u8]> = bytes.chunks(1).collect();
        let (got, report) = collect(&mut a, &chunks);
        assert_eq!(got, frames);
        assert_eq!(report.resyncs, 0);
    }

    #[test]
    fn test_random_splits() {
        let (frames, bytes) = stream(40);
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x7E7D);

        for _ in 0..50 {
            let mut chunks = Vec::new();
            let mut rest = &bytes[..];
            while !rest.is_empty() {
                let n = rng.gen_range(1..=rest.len().min(40));
                let (head, tail) = rest.split_at(n);
                chunks.push(head);
                rest = tail;
            }

            let mut a = FrameAssembler::can_spi("test");
            let (got, report) = collect(&mut a, &chunks);
            assert_eq!(got, frames);
            assert_eq!(report.resyncs, 0);
        }
    }

    #[test]
    fn test_single_corrupt_byte_resyncs_once() {
        let (frames, bytes) = stream(1);
        let mut input = vec![0x00];
        input.extend_from_slice(&bytes);

        let mut a = FrameAssembler::can_spi("test");
        let (got, report) = collect(&mut a, &[&input]);
        assert_eq!(got, frames);
        assert_eq!(report.resyncs, 1);
        assert_eq!(a.resyncs(), 1);
    }

    #[test]
    fn test_garbage_prefix_recovered_within_frame_len() {
        let (frames, bytes) = stream(3);
        let garbage: Vec<u8> = (0..WIRE_FRAME_LEN as u8 - 1).map(|i| i ^ 0x20).collect();
        assert!(!garbage.contains(&HEAD_SIGN));

        let mut input = garbage.clone();
        input.extend_from_slice(&bytes);

        let mut a = FrameAssembler::can_spi("test");
        let (got, report) = collect(&mut a, &[&input[..9], &input[9..]]);
        assert_eq!(got, frames);
        assert_eq!(report.resyncs, garbage.len());
        assert!(report.resyncs <= WIRE_FRAME_LEN);
    }

    #[test]
    fn test_partial_frame_waits() {
        let (_, bytes) = stream(1);
        let mut a = FrameAssembler::can_spi("test");
        let (got, _) = collect(&mut a, &[&bytes[..WIRE_FRAME_LEN - 1]]);
        assert!(got.is_empty());
        assert_eq!(a.buffered(), WIRE_FRAME_LEN - 1);
        assert_eq!(a.consumed(), WIRE_FRAME_LEN - 1);

        let (got, _) = collect(&mut a, &[&bytes[WIRE_FRAME_LEN - 1..]]);
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn test_feed_larger_than_buffer() {
        let (frames, bytes) = stream(20);
        let meta = AssemblerMeta {
            capacity: WIRE_FRAME_LEN * 2,
            ..AssemblerMeta::can_spi()
        };
        let mut a = FrameAssembler::new("small", meta);
        let (got, report) = collect(&mut a, &[&bytes]);
        assert_eq!(got, frames);
        assert_eq!(report.resyncs, 0);
    }

    #[test]
    fn test_length_resolver_extends_frame() {
        // Two-byte head, one length byte, one flag byte, then `len` payload bytes
        let meta = AssemblerMeta {
            head: smallvec![0xAA, 0x55],
            frame_len: 4,
            capacity: 64,
        };
        let mut a = FrameAssembler::new("var", meta)
            .with_length_resolver(|header: &[u8]| Some(header[2] as usize));

        let input = [
            0xAA, 0x55, 3, 0, b'a', b'b', b'c', // 3-byte payload
            0x00, // noise
            0xAA, 0x55, 0, 1, // empty payload
        ];
        let mut out = Vec::new();
        let mut resyncs = 0;
        for chunk in input.chunks(2) {
            resyncs += a.feed(chunk, |f| out.push(f.to_vec())).resyncs;
        }

        assert_eq!(
            out,
            vec![
                vec![0xAA, 0x55, 3, 0, b'a', b'b', b'c'],
                vec![0xAA, 0x55, 0, 1]
            ]
        );
        assert_eq!(resyncs, 1);
    }

    #[test]
    fn test_second_head_byte_mismatch_drops_one_byte() {
        let meta = AssemblerMeta {
            head: smallvec![0xAA, 0x55],
            frame_len: 3,
            capacity: 16,
        };
        let mut a = FrameAssembler::new("two", meta);
        let mut out = Vec::new();
        let report = a.feed(&[0xAA, 0xAA, 0x55, 0x01], |f| out.push(f.to_vec()));
        assert_eq!(report.resyncs, 1);
        assert_eq!(out, vec![vec![0xAA, 0x55, 0x01]]);
    }

    #[test]
    fn test_oversized_declared_length_is_corruption() {
        let meta = AssemblerMeta {
            head: smallvec![0xAA],
            frame_len: 2,
            capacity: 8,
        };
        let mut a = FrameAssembler::new("var", meta)
            .with_length_resolver(|header: &[u8]| Some(header[1] as usize));

        let mut out = Vec::new();
        let report = a.feed(&[0xAA, 200, 0xAA, 1, 9], |f| out.push(f.to_vec()));
        // The oversized head byte and the length byte that followed it
        assert_eq!(out, vec![vec![0xAA, 1, 9]]);
        assert_eq!(report.resyncs, 2);
    }
}

//! CAN-over-SPI wire framing, checksum, and stream reassembly for canspi.
//!
//! This crate provides the on-link representation of CAN frames exchanged with
//! the SPI-attached CAN controller, and the byte-stream assembler that recovers
//! whole frames from arbitrarily chunked and possibly corrupted input.
//!
//! ## Features
//!
//! - **Fixed 16-byte frames**: one frame is the atomic unit of every transfer
//! - **Portable layout**: explicit byte offsets, no compiler bit-field packing
//! - **XOR checksum**: over every byte preceding the checksum
//! - **Resynchronizing assembler**: one-byte drop on head mismatch
//! - **Variable-length framing**: optional length resolver for other protocols
//!
//! ## Wire Format
//!
//! ```text
//! +--------+------------------------------------------+
//! | 0      | head 0x7E                                |
//! +--------+------------------------------------------+
//! | 1      | b0-3 dlc | b4 remote | b6 ext | b7 chan  |
//! +--------+------------------------------------------+
//! | 2..6   | identifier, u32 little-endian            |
//! +--------+------------------------------------------+
//! | 6..14  | payload, always 8 bytes                  |
//! +--------+------------------------------------------+
//! | 14     | tail 0x7D                                |
//! +--------+------------------------------------------+
//! | 15     | XOR of bytes 0..15                       |
//! +--------+------------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod assembler;
pub mod codec;
pub mod error;
pub mod frame;

// Re-export main types
pub use assembler::{
    AssemblerMeta, FeedReport, FrameAssembler, LengthResolver, DEFAULT_ASSEMBLER_CAPACITY,
};
pub use codec::{decode_verify, encode, has_sync, idle_frame, is_idle, xor_checksum, WireFrame};
pub use error::WireError;
pub use frame::{
    CanFrame, Control, DecodedFrame, CAN_EFF_MASK, CAN_SFF_MASK, HEAD_SIGN, IDLE_HEAD, MAX_CHANNELS,
    MAX_DLC, TAIL_SIGN, WIRE_FRAME_LEN,
};

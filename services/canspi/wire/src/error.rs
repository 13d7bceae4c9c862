//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer is not exactly one wire frame long
    #[error("bad frame length: {0}")]
    Length(usize),

    /// Head sync byte mismatch
    #[error("bad head byte 0x{0:02x}")]
    Head(u8),

    /// Tail sync byte mismatch
    #[error("bad tail byte 0x{0:02x}")]
    Tail(u8),

    /// XOR checksum mismatch
    #[error("xor mismatch: expected 0x{expected:02x}, found 0x{found:02x}")]
    Checksum {
        /// Checksum computed over the received bytes
        expected: u8,
        /// Checksum carried by the frame
        found: u8,
    },

    /// Data length code above 8
    #[error("dlc out of range: {0}")]
    Dlc(u8),
}

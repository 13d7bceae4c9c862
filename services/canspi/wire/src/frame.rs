//! Logical CAN frames and the fixed CAN-over-SPI frame constants.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of one wire frame; every duplex transfer moves exactly this many bytes
pub const WIRE_FRAME_LEN: usize = 16;

/// Head sync byte
pub const HEAD_SIGN: u8 = 0x7E;

/// Tail sync byte
pub const TAIL_SIGN: u8 = 0x7D;

/// Head byte of the idle sentinel sent when nothing is queued
pub const IDLE_HEAD: u8 = 0xFF;

/// Largest data length code of a classic CAN frame
pub const MAX_DLC: u8 = 8;

/// Number of logical channels the one-bit address field can carry
pub const MAX_CHANNELS: u8 = 2;

/// Identifier mask of a standard (11-bit) frame
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;

/// Identifier mask of an extended (29-bit) frame
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

pub(crate) const CONTROL_OFFSET: usize = 1;
pub(crate) const TAIL_OFFSET: usize = 14;
pub(crate) const CHECKSUM_OFFSET: usize = 15;
pub(crate) const DLC_MASK: u8 = 0x0F;

bitflags! {
    /// Flag bits of the control byte; the low nibble carries the dlc
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Control: u8 {
        /// Remote transmission request
        const REMOTE = 1 << 4;
        /// Upper half of the two-bit remote field; set only by foreign encoders
        const REMOTE_HI = 1 << 5;
        /// Extended (29-bit) identifier
        const EXTENDED = 1 << 6;
        /// Logical channel address
        const CHANNEL = 1 << 7;
    }
}

/// A classic CAN frame, independent of the link encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanFrame {
    /// Identifier (11 or 29 significant bits)
    pub id: u32,
    /// Number of meaningful payload bytes (0..=8)
    pub dlc: u8,
    /// Extended identifier
    pub extended: bool,
    /// Remote frame
    pub remote: bool,
    /// Payload; only the first `dlc` bytes are meaningful
    pub payload: [u8; 8],
}

impl CanFrame {
    /// Data frame with a standard identifier, or extended if `id` needs more than 11 bits
    pub fn new(id: u32, data: &[u8]) -> Result<Self, crate::WireError> {
        Self::build(id, data, id > CAN_SFF_MASK)
    }

    /// Data frame with an extended identifier
    pub fn new_extended(id: u32, data: &[u8]) -> Result<Self, crate::WireError> {
        Self::build(id, data, true)
    }

    /// Remote frame requesting `dlc` bytes
    pub fn new_remote(id: u32, dlc: u8, extended: bool) -> Result<Self, crate::WireError> {
        if dlc > MAX_DLC {
            return Err(crate::WireError::Dlc(dlc));
        }
        Ok(Self {
            id,
            dlc,
            extended,
            remote: true,
            payload: [0; 8],
        })
    }

    fn build(id: u32, data: &[u8], extended: bool) -> Result<Self, crate::WireError> {
        if data.len() > MAX_DLC as usize {
            return Err(crate::WireError::Dlc(data.len().min(u8::MAX as usize) as u8));
        }
        let mut payload = [0u8; 8];
        payload[..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            dlc: data.len() as u8,
            extended,
            remote: false,
            payload,
        })
    }

    /// Meaningful payload bytes
    pub fn data(&self) -> &[u8] {
        &self.payload[..self.dlc.min(MAX_DLC) as usize]
    }

    /// Identifier with the bits outside its format masked off
    pub fn masked_id(&self) -> u32 {
        if self.extended {
            self.id & CAN_EFF_MASK
        } else {
            self.id & CAN_SFF_MASK
        }
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "{:08X}", self.id)?;
        } else {
            write!(f, "{:03X}", self.id)?;
        }
        if self.remote {
            return write!(f, "#R{}", self.dlc);
        }
        write!(f, "#")?;
        for b in self.data() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

/// A verified wire frame: the logical frame plus the channel it was addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedFrame {
    /// Logical CAN frame
    pub frame: CanFrame,
    /// Channel address (0 or 1)
    pub channel: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_picks_identifier_format() {
        let std = CanFrame::new(0x123, &[1, 2]).unwrap();
        assert!(!std.extended);
        assert_eq!(std.dlc, 2);
        assert_eq!(std.data(), &[1, 2]);

        let ext = CanFrame::new(0x18FF_0001, &[]).unwrap();
        assert!(ext.extended);
        assert_eq!(ext.dlc, 0);
    }

    #[test]
    fn test_masked_id() {
        let mut frame = CanFrame::new(0x7E5, &[]).unwrap();
        frame.id = 0xFFFF_F7E5;
        assert_eq!(frame.masked_id(), 0x7E5);

        frame.extended = true;
        assert_eq!(frame.masked_id(), 0x1FFF_F7E5);
    }

    #[test]
    fn test_payload_too_long() {
        assert_eq!(
            CanFrame::new(0x1, &[0; 9]).unwrap_err(),
            crate::WireError::Dlc(9)
        );
        assert!(CanFrame::new_remote(0x1, 9, false).is_err());
    }

    #[test]
    fn test_display() {
        let frame = CanFrame::new(0x7E5, &[0xDE, 0xAD]).unwrap();
        assert_eq!(frame.to_string(), "7E5#DEAD");

        let remote = CanFrame::new_remote(0x1234_5678, 4, true).unwrap();
        assert_eq!(remote.to_string(), "12345678#R4");
    }
}

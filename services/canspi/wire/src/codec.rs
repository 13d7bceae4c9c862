//! Encoding and verification of CAN-over-SPI wire frames.
//!
//! Fields are written at fixed byte offsets rather than through a packed
//! struct, so the layout does not depend on how a compiler packs bit-fields.

use crate::frame::{
    CanFrame, Control, DecodedFrame, CHECKSUM_OFFSET, CONTROL_OFFSET, DLC_MASK, HEAD_SIGN,
    IDLE_HEAD, MAX_DLC, TAIL_OFFSET, TAIL_SIGN, WIRE_FRAME_LEN,
};
use crate::WireError;
use bytes::{Buf, BufMut};

/// One encoded wire frame
pub type WireFrame = [u8; WIRE_FRAME_LEN];

/// XOR-fold of `bytes`
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Build the control byte for `frame` on `channel`
fn control_byte(frame: &CanFrame, channel: u8) -> u8 {
    let mut flags = Control::empty();
    flags.set(Control::REMOTE, frame.remote);
    flags.set(Control::EXTENDED, frame.extended);
    flags.set(Control::CHANNEL, channel & 1 != 0);
    (frame.dlc.min(MAX_DLC) & DLC_MASK) | flags.bits()
}

/// Encode `frame` for the given channel address.
///
/// All eight payload bytes are emitted whatever the dlc. Only the low bit of
/// `channel` is kept.
pub fn encode(frame: &CanFrame, channel: u8) -> WireFrame {
    let mut out = [0u8; WIRE_FRAME_LEN];
    {
        let mut buf = &mut out[..CHECKSUM_OFFSET];
        buf.put_u8(HEAD_SIGN);
        buf.put_u8(control_byte(frame, channel));
        buf.put_u32_le(frame.id);
        buf.put_slice(&frame.payload);
        buf.put_u8(TAIL_SIGN);
    }
    out[CHECKSUM_OFFSET] = xor_checksum(&out[..CHECKSUM_OFFSET]);
    out
}

/// Verify a received wire frame and decode it.
///
/// Rejects a buffer that is not exactly one frame long, a wrong head or tail
/// sync byte, and a checksum that does not match the preceding bytes. A dlc
/// nibble above 8 is clamped to 8.
pub fn decode_verify(bytes: &[u8]) -> Result<DecodedFrame, WireError> {
    if bytes.len() != WIRE_FRAME_LEN {
        return Err(WireError::Length(bytes.len()));
    }

    let mut buf = bytes;
    let head = buf.get_u8();
    if head != HEAD_SIGN {
        return Err(WireError::Head(head));
    }

    let control = buf.get_u8();
    let id = buf.get_u32_le();
    let mut payload = [0u8; 8];
    buf.copy_to_slice(&mut payload);

    let tail = buf.get_u8();
    if tail != TAIL_SIGN {
        return Err(WireError::Tail(tail));
    }

    let found = buf.get_u8();
    let expected = xor_checksum(&bytes[..CHECKSUM_OFFSET]);
    if found != expected {
        return Err(WireError::Checksum { expected, found });
    }

    let flags = Control::from_bits_truncate(control);
    let frame = CanFrame {
        id,
        dlc: (control & DLC_MASK).min(MAX_DLC),
        extended: flags.contains(Control::EXTENDED),
        remote: flags.intersects(Control::REMOTE | Control::REMOTE_HI),
        payload,
    };

    Ok(DecodedFrame {
        frame,
        channel: flags.contains(Control::CHANNEL) as u8,
    })
}

/// Sentinel transmitted when nothing is queued.
///
/// Its head byte can never start a valid frame; only the channel bit is set
/// so the far side can tell which end is polling.
pub fn idle_frame(channel: u8) -> WireFrame {
    let mut out = [0u8; WIRE_FRAME_LEN];
    out[0] = IDLE_HEAD;
    if channel & 1 != 0 {
        out[CONTROL_OFFSET] = Control::CHANNEL.bits();
    }
    out
}

/// Whether `bytes` is an idle sentinel rather than a frame
pub fn is_idle(bytes: &[u8]) -> bool {
    bytes.first() == Some(&IDLE_HEAD)
}

/// Whether `bytes` carries both sync bytes at their offsets (checksum not checked)
pub fn has_sync(bytes: &[u8]) -> bool {
    bytes.len() == WIRE_FRAME_LEN && bytes[0] == HEAD_SIGN && bytes[TAIL_OFFSET] == TAIL_SIGN
}

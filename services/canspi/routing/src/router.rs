//! Frame handler trait and dispatch decision types

use canspi_wire::CanFrame;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a handler did with a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    /// Handled locally; nothing else to do
    Consumed,
    /// Hand the raw frame on to the forwarding sink
    Forward,
}

/// Result of dispatching one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A filter matched and its handler ran
    Handled {
        /// Slot of the matching filter
        slot: usize,
        /// Handler verdict
        disposition: Disposition,
    },
    /// No filter matched; the frame was dropped
    Unrecognized,
}

impl DispatchOutcome {
    /// Whether the frame should go to the forwarding sink
    pub fn should_forward(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::Handled {
                disposition: Disposition::Forward,
                ..
            }
        )
    }
}

/// How the filter `extended` flag takes part in matching
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtendedMatch {
    /// Flag is stored but not compared; identifier and mask alone decide
    #[default]
    Ignore,
    /// Frame and filter must agree on standard vs extended identifiers
    Enforce,
}

impl fmt::Display for ExtendedMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtendedMatch::Ignore => write!(f, "ignore"),
            ExtendedMatch::Enforce => write!(f, "enforce"),
        }
    }
}

/// Consumer of frames that matched a filter.
///
/// Handlers run on the link worker thread and must not block for long.
/// Whatever context a handler needs travels with it, as closure captures or
/// struct fields.
pub trait FrameHandler: Send + Sync {
    /// Handle a frame received on `channel`
    fn on_frame(&self, channel: u8, frame: &CanFrame) -> Disposition;
}

impl<F> FrameHandler for F
where
    F: Fn(u8, &CanFrame) -> Disposition + Send + Sync,
{
    fn on_frame(&self, channel: u8, frame: &CanFrame) -> Disposition {
        self(channel, frame)
    }
}

/// Handler that sends every matching frame to the forwarding sink
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardAll;

impl FrameHandler for ForwardAll {
    fn on_frame(&self, _channel: u8, _frame: &CanFrame) -> Disposition {
        Disposition::Forward
    }
}

/// Dispatch statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchStats {
    /// Frames offered to the registry
    pub dispatched: u64,
    /// Frames a handler consumed
    pub consumed: u64,
    /// Frames a handler asked to forward
    pub forwarded: u64,
    /// Frames that matched no filter
    pub unrecognized: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_forward() {
        let forward = DispatchOutcome::Handled {
            slot: 0,
            disposition: Disposition::Forward,
        };
        let consumed = DispatchOutcome::Handled {
            slot: 0,
            disposition: Disposition::Consumed,
        };
        assert!(forward.should_forward());
        assert!(!consumed.should_forward());
        assert!(!DispatchOutcome::Unrecognized.should_forward());
    }

    #[test]
    fn test_closure_handler() {
        let handler = |channel: u8, frame: &CanFrame| {
            if channel == 0 && frame.dlc > 0 {
                Disposition::Consumed
            } else {
                Disposition::Forward
            }
        };
        let frame = CanFrame::new(0x10, &[1]).unwrap();
        assert_eq!(handler.on_frame(0, &frame), Disposition::Consumed);
        assert_eq!(handler.on_frame(1, &frame), Disposition::Forward);
        assert_eq!(ForwardAll.on_frame(0, &frame), Disposition::Forward);
    }
}

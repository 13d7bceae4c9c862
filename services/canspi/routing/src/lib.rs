//! Identifier filters and frame dispatch for canspi.
//!
//! Incoming CAN frames are matched against an ordered table of
//! `(pattern, mask)` filters. The first filter for which
//! `(id & mask) == pattern` holds gets the frame; its handler decides whether
//! the frame is consumed locally or forwarded to the host sink.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod router;
pub mod table;

pub use router::{
    DispatchOutcome, DispatchStats, Disposition, ExtendedMatch, ForwardAll, FrameHandler,
};
pub use table::{FilterEntry, FilterRegistry, FILTER_CAPACITY};

use thiserror::Error;

/// Routing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// Every filter slot is taken
    #[error("Filter table full ({capacity} slots)")]
    TableFull {
        /// Slot count
        capacity: usize,
    },
}

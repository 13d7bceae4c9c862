//! SPI link lifecycle, duplex exchange loop, and forwarding sink for canspi.
//!
//! A [`CanLink`] owns one worker thread that drives the [`ExchangeLoop`]:
//! one fixed-size full-duplex transfer per tick, outbound frames taken from a
//! shared queue, inbound frames reassembled, verified, and dispatched through
//! a [`canspi_routing::FilterRegistry`]. Frames a handler forwards are written
//! to a Unix datagram socket whose read half the host can poll.
//!
//! ## Example
//!
//! ```rust,no_run
//! use canspi_routing::{FilterRegistry, ForwardAll};
//! use canspi_session::{CanLink, LinkConfig};
//! use canspi_wire::CanFrame;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = FilterRegistry::new();
//! registry.register(0x7E0, 0x7F0, false, ForwardAll)?;
//!
//! let link = CanLink::init("/dev/spidev0.0", LinkConfig::default(), registry)?;
//! link.write(&CanFrame::new(0x7DF, &[0x02, 0x01, 0x00])?, 0)?;
//!
//! println!("forwarded frames readable on fd {}", link.forwarding_fd());
//! link.close();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod exchange;
pub mod link;
pub mod sink;
pub mod transport;

pub use error::LinkError;
pub use exchange::{ExchangeCounters, ExchangeLoop, ExchangeStats, LinkState};
pub use link::{CanLink, LinkStats, LinkWriter};
pub use sink::{DatagramSink, ForwardingSink};
pub use transport::{
    DuplexTransport, MemoryPeer, MemoryTransport, SpiConfig, SpidevTransport, SPI_CPHA, SPI_CPOL,
};

use canspi_storage::DEFAULT_OUTBOUND_CAPACITY;
use canspi_wire::{DEFAULT_ASSEMBLER_CAPACITY, MAX_CHANNELS, WIRE_FRAME_LEN};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// What travels over the link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// 16-byte verified CAN frames, dispatched through the filter registry
    #[default]
    Framed,
    /// Raw bytes in both directions, no decoding or dispatch
    Passthrough,
}

impl fmt::Display for LinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkMode::Framed => write!(f, "framed"),
            LinkMode::Passthrough => write!(f, "passthrough"),
        }
    }
}

/// Unrecognized link mode name
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown link mode '{0}' (expected framed or passthrough)")]
pub struct ParseModeError(String);

impl FromStr for LinkMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "framed" => Ok(LinkMode::Framed),
            "passthrough" | "raw" => Ok(LinkMode::Passthrough),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}

/// Configuration for a link
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Framed or pass-through operation
    pub mode: LinkMode,
    /// SPI device settings
    pub spi: SpiConfig,
    /// Sleep between ticks while idle
    pub idle_backoff: Duration,
    /// Channel bit this side puts in its idle sentinel
    pub local_address: u8,
    /// Logical CAN channels served, one assembler each
    pub channels: u8,
    /// Outbound queue size in bytes
    pub outbound_capacity: usize,
    /// Per-channel reassembly buffer size in bytes
    pub assembler_capacity: usize,
    /// Drop inbound frames that lack the extended flag
    pub require_extended: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mode: LinkMode::Framed,
            spi: SpiConfig::default(),
            idle_backoff: Duration::from_millis(10),
            local_address: 1,
            channels: 1,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            assembler_capacity: DEFAULT_ASSEMBLER_CAPACITY,
            require_extended: false,
        }
    }
}

impl LinkConfig {
    /// Check the settings a link cannot run with
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(LinkError::Config(format!(
                "channels must be 1..={}, got {}",
                MAX_CHANNELS, self.channels
            )));
        }
        if self.local_address >= MAX_CHANNELS {
            return Err(LinkError::Config(format!(
                "local address must be 0 or 1, got {}",
                self.local_address
            )));
        }
        if self.outbound_capacity < WIRE_FRAME_LEN {
            return Err(LinkError::Config(format!(
                "outbound capacity {} is below one frame",
                self.outbound_capacity
            )));
        }
        if self.assembler_capacity < WIRE_FRAME_LEN {
            return Err(LinkError::Config(format!(
                "assembler capacity {} is below one frame",
                self.assembler_capacity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!("framed".parse::<LinkMode>().unwrap(), LinkMode::Framed);
        assert_eq!("PassThrough".parse::<LinkMode>().unwrap(), LinkMode::Passthrough);
        assert!("bogus".parse::<LinkMode>().is_err());
        assert_eq!(LinkMode::Passthrough.to_string(), "passthrough");
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = LinkConfig::default();
        config.validate().unwrap();
        assert_eq!(config.idle_backoff, Duration::from_millis(10));
        assert_eq!(config.outbound_capacity, 1024 * 1024);
    }

    #[test]
    fn test_validate_rejects() {
        let bad = LinkConfig {
            channels: 3,
            ..LinkConfig::default()
        };
        assert!(matches!(bad.validate(), Err(LinkError::Config(_))));

        let bad = LinkConfig {
            outbound_capacity: 8,
            ..LinkConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}

//! Link error type

use crate::LinkMode;
use canspi_storage::StorageError;
use canspi_wire::WireError;
use std::io;
use thiserror::Error;

/// Errors surfaced by link setup and the write API
#[derive(Error, Debug)]
pub enum LinkError {
    /// The transfer device could not be opened
    #[error("Failed to open {device}: {source}")]
    Open {
        /// Device path
        device: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The transfer device rejected a setting
    #[error("Failed to configure {setting}: {source}")]
    Configure {
        /// Setting being applied
        setting: &'static str,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The forwarding socket pair could not be created
    #[error("Failed to create forwarding socket: {0}")]
    Sink(#[source] io::Error),

    /// The worker thread could not be started
    #[error("Failed to spawn link worker: {0}")]
    Spawn(#[source] io::Error),

    /// Outbound queue refused the write
    #[error("Outbound queue: {0}")]
    Queue(#[from] StorageError),

    /// Frame could not be built
    #[error("Wire: {0}")]
    Wire(#[from] WireError),

    /// Write API used in the wrong link mode
    #[error("Operation needs a {expected} link, this link is {actual}")]
    Mode {
        /// Mode the operation needs
        expected: LinkMode,
        /// Mode the link runs in
        actual: LinkMode,
    },

    /// Channel address outside the configured range
    #[error("Channel {channel} out of range (link has {channels})")]
    Channel {
        /// Requested channel
        channel: u8,
        /// Configured channel count
        channels: u8,
    },

    /// Invalid link configuration
    #[error("Invalid link configuration: {0}")]
    Config(String),
}

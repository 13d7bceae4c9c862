//! Configuration handling for the canspi bridge.
//!
//! Settings come from a YAML file, then environment variables, then command
//! line flags (applied in `main`). A missing or unreadable file means defaults.

use anyhow::{Context, Result};
use canspi_routing::{
    Disposition, ExtendedMatch, FilterRegistry, ForwardAll, FrameHandler,
};
use canspi_session::{LinkConfig, LinkMode, SpiConfig};
use canspi_wire::CanFrame;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// SPI device path
    pub device: PathBuf,
    /// Framed or pass-through link
    pub mode: LinkMode,
    /// SPI device settings
    pub spi: SpiConfig,
    /// Sleep between idle ticks (milliseconds)
    pub idle_backoff_ms: u64,
    /// Channel bit of this side
    pub local_address: u8,
    /// Logical CAN channels served
    pub channels: u8,
    /// Outbound queue size in bytes
    pub outbound_capacity: usize,
    /// Drop inbound frames without the extended flag
    pub require_extended: bool,
    /// Whether filters compare the extended flag
    pub extended_match: ExtendedMatch,
    /// Interval between statistics log lines (seconds, 0 disables)
    pub stats_interval_secs: u64,
    /// Identifier filters, in match order
    pub filters: Vec<FilterConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let link = LinkConfig::default();
        Self {
            device: PathBuf::from("/dev/spidev0.0"),
            mode: link.mode,
            spi: link.spi,
            idle_backoff_ms: link.idle_backoff.as_millis() as u64,
            local_address: link.local_address,
            channels: link.channels,
            outbound_capacity: link.outbound_capacity,
            require_extended: link.require_extended,
            extended_match: ExtendedMatch::Ignore,
            stats_interval_secs: 0,
            filters: Vec::new(),
        }
    }
}

/// What a filter does with matching frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    /// Send to the forwarding socket
    #[default]
    Forward,
    /// Log and consume
    Log,
}

/// One configured filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Identifier pattern
    pub id: u32,
    /// Identifier mask
    #[serde(default = "default_mask")]
    pub mask: u32,
    /// Extended identifier filter
    #[serde(default)]
    pub extended: bool,
    /// Action on match
    #[serde(default)]
    pub action: FilterAction,
}

fn default_mask() -> u32 {
    u32::MAX
}

/// Handler that logs each matching frame and consumes it
struct LogFrames;

impl FrameHandler for LogFrames {
    fn on_frame(&self, channel: u8, frame: &CanFrame) -> Disposition {
        info!("can{} {}", channel, frame);
        Disposition::Consumed
    }
}

impl BridgeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<BridgeConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();

        info!(
            "Final bridge configuration: device={:?}, mode={}, speed={} Hz, filters={}",
            config.device,
            config.mode,
            config.spi.speed_hz,
            config.filters.len()
        );

        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Ok(device) = std::env::var("CANSPI_DEVICE") {
            self.device = PathBuf::from(&device);
            info!("Device overridden by environment: {}", device);
        }

        if let Ok(speed) = std::env::var("CANSPI_SPEED_HZ") {
            match speed.parse::<u32>() {
                Ok(speed) => {
                    self.spi.speed_hz = speed;
                    info!("SPI speed overridden by environment: {} Hz", speed);
                }
                Err(_) => warn!("Ignoring invalid CANSPI_SPEED_HZ={}", speed),
            }
        }

        if let Ok(mode) = std::env::var("CANSPI_MODE") {
            match mode.parse::<LinkMode>() {
                Ok(mode) => {
                    self.mode = mode;
                    info!("Link mode overridden by environment: {}", mode);
                }
                Err(e) => warn!("Ignoring CANSPI_MODE: {}", e),
            }
        }

        if let Ok(backoff) = std::env::var("CANSPI_IDLE_BACKOFF_MS") {
            match backoff.parse::<u64>() {
                Ok(ms) => {
                    self.idle_backoff_ms = ms;
                    info!("Idle backoff overridden by environment: {} ms", ms);
                }
                Err(_) => warn!("Ignoring invalid CANSPI_IDLE_BACKOFF_MS={}", backoff),
            }
        }
    }

    /// Link settings derived from this configuration
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            mode: self.mode,
            spi: self.spi.clone(),
            idle_backoff: Duration::from_millis(self.idle_backoff_ms),
            local_address: self.local_address,
            channels: self.channels,
            outbound_capacity: self.outbound_capacity,
            require_extended: self.require_extended,
            ..LinkConfig::default()
        }
    }

    /// Build the filter registry from the configured filters
    pub fn build_registry(&self) -> Result<FilterRegistry> {
        let mut registry = FilterRegistry::with_extended_match(self.extended_match);
        let forward: Arc<dyn FrameHandler> = Arc::new(ForwardAll);
        let log: Arc<dyn FrameHandler> = Arc::new(LogFrames);

        for filter in &self.filters {
            let handler = match filter.action {
                FilterAction::Forward => forward.clone(),
                FilterAction::Log => log.clone(),
            };
            registry
                .register_shared(filter.id, filter.mask, filter.extended, handler)
                .with_context(|| format!("registering filter id=0x{:08x}", filter.id))?;
        }

        Ok(registry)
    }
}

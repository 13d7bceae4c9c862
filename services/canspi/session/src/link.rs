//! Link lifecycle and write API

use crate::exchange::{ExchangeCounters, ExchangeLoop, ExchangeStats, LinkState};
use crate::sink::DatagramSink;
use crate::transport::{DuplexTransport, SpidevTransport};
use crate::{LinkConfig, LinkError, LinkMode};
use canspi_routing::{DispatchStats, FilterRegistry};
use canspi_storage::{OutboundQueue, OutboundStats};
use canspi_wire::{encode, CanFrame, WIRE_FRAME_LEN};
use serde::Serialize;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Cloneable handle for queueing outbound data from any thread
#[derive(Debug, Clone)]
pub struct LinkWriter {
    outbound: Arc<OutboundQueue>,
    mode: LinkMode,
    channels: u8,
}

impl LinkWriter {
    /// Encode `frame` for `channel` and queue it.
    ///
    /// Fails with [`LinkError::Queue`] when the outbound queue has no room;
    /// nothing queued earlier is dropped.
    pub fn write(&self, frame: &CanFrame, channel: u8) -> Result<(), LinkError> {
        if self.mode != LinkMode::Framed {
            return Err(LinkError::Mode {
                expected: LinkMode::Framed,
                actual: self.mode,
            });
        }
        if channel >= self.channels {
            return Err(LinkError::Channel {
                channel,
                channels: self.channels,
            });
        }

        self.outbound.push(&encode(frame, channel))?;
        debug!("Queued {} on channel {}", frame, channel);
        Ok(())
    }

    /// Queue raw bytes on a pass-through link, all or nothing
    pub fn write_raw(&self, bytes: &[u8]) -> Result<(), LinkError> {
        if self.mode != LinkMode::Passthrough {
            return Err(LinkError::Mode {
                expected: LinkMode::Passthrough,
                actual: self.mode,
            });
        }
        self.outbound.push(bytes)?;
        Ok(())
    }

    /// Bytes waiting to be transmitted
    pub fn queued(&self) -> usize {
        self.outbound.len()
    }
}

/// Combined statistics for a link
#[derive(Debug, Clone, Serialize)]
pub struct LinkStats {
    /// Current exchange counters
    pub exchange: ExchangeStats,
    /// Filter dispatch counters
    pub dispatch: DispatchStats,
    /// Outbound queue counters
    pub outbound: OutboundStats,
}

/// A running CAN-over-SPI link.
///
/// Owns the worker thread, the write side of the outbound queue and the read
/// half of the forwarding socket. Dropping the link stops the worker.
#[derive(Debug)]
pub struct CanLink {
    writer: LinkWriter,
    registry: Arc<FilterRegistry>,
    counters: Arc<ExchangeCounters>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<LinkState>>,
    forward_rx: UnixDatagram,
}

impl CanLink {
    /// Open the SPI device at `device` and start the link
    pub fn init(
        device: impl AsRef<Path>,
        config: LinkConfig,
        registry: FilterRegistry,
    ) -> Result<Self, LinkError> {
        config.validate()?;
        let transport = SpidevTransport::open(device, &config.spi)?;
        Self::with_transport(transport, config, registry)
    }

    /// Start a link over an already open transport
    pub fn with_transport<T>(
        transport: T,
        config: LinkConfig,
        registry: FilterRegistry,
    ) -> Result<Self, LinkError>
    where
        T: DuplexTransport + 'static,
    {
        config.validate()?;

        let (sink, forward_rx) = DatagramSink::pair().map_err(LinkError::Sink)?;
        let unit = match config.mode {
            LinkMode::Framed => WIRE_FRAME_LEN,
            LinkMode::Passthrough => 1,
        };
        let outbound = Arc::new(OutboundQueue::new(unit, config.outbound_capacity));
        let registry = Arc::new(registry);

        let mut exchange = ExchangeLoop::new(
            transport,
            sink,
            outbound.clone(),
            registry.clone(),
            &config,
        );
        let counters = exchange.counters();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();

        let worker = thread::Builder::new()
            .name("canspi-link".to_string())
            .spawn(move || exchange.run(&flag))
            .map_err(LinkError::Spawn)?;

        info!(
            "CAN link started: {} mode, {} filter(s), {} channel(s)",
            config.mode,
            registry.len(),
            config.channels
        );

        Ok(Self {
            writer: LinkWriter {
                outbound,
                mode: config.mode,
                channels: config.channels,
            },
            registry,
            counters,
            shutdown,
            worker: Some(worker),
            forward_rx,
        })
    }

    /// Queue `frame` for transmission on `channel`
    pub fn write(&self, frame: &CanFrame, channel: u8) -> Result<(), LinkError> {
        self.writer.write(frame, channel)
    }

    /// Queue raw bytes on a pass-through link
    pub fn write_raw(&self, bytes: &[u8]) -> Result<(), LinkError> {
        self.writer.write_raw(bytes)
    }

    /// Handle for writing from other threads
    pub fn writer(&self) -> LinkWriter {
        self.writer.clone()
    }

    /// Link mode
    pub fn mode(&self) -> LinkMode {
        self.writer.mode
    }

    /// Pollable descriptor of the forwarding socket's read half
    pub fn forwarding_fd(&self) -> RawFd {
        self.forward_rx.as_raw_fd()
    }

    /// Independent handle on the forwarding socket's read half
    pub fn forwarding_socket(&self) -> io::Result<UnixDatagram> {
        self.forward_rx.try_clone()
    }

    /// Whether the worker thread is still running
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Current statistics
    pub fn stats(&self) -> LinkStats {
        LinkStats {
            exchange: self.counters.snapshot(),
            dispatch: self.registry.stats(),
            outbound: self.writer.outbound.stats(),
        }
    }

    /// Stop the worker, wait for it, and release the link
    pub fn close(mut self) -> LinkState {
        self.stop()
    }

    fn stop(&mut self) -> LinkState {
        self.shutdown.store(true, Ordering::Release);
        let Some(worker) = self.worker.take() else {
            return LinkState::Stopped;
        };

        match worker.join() {
            Ok(state) => {
                info!("CAN link closed: {:?}", self.counters.snapshot());
                state
            }
            Err(_) => {
                warn!("CAN link worker panicked");
                LinkState::Stopped
            }
        }
    }
}

impl Drop for CanLink {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use canspi_storage::StorageError;

    fn passthrough() -> LinkConfig {
        LinkConfig {
            mode: LinkMode::Passthrough,
            ..LinkConfig::default()
        }
    }

    #[test]
    fn test_write_checks_mode_and_channel() {
        let (transport, _peer) = MemoryTransport::pair();
        let link =
            CanLink::with_transport(transport, LinkConfig::default(), FilterRegistry::new())
                .unwrap();
        let frame = CanFrame::new(0x10, &[1]).unwrap();

        assert!(matches!(
            link.write(&frame, 1),
            Err(LinkError::Channel { channel: 1, channels: 1 })
        ));
        assert!(matches!(
            link.write_raw(&[1, 2]),
            Err(LinkError::Mode { .. })
        ));
        assert_eq!(link.close(), LinkState::Stopped);
    }

    #[test]
    fn test_overflow_surfaces_as_queue_error() {
        let writer = LinkWriter {
            outbound: Arc::new(OutboundQueue::new(WIRE_FRAME_LEN, WIRE_FRAME_LEN)),
            mode: LinkMode::Framed,
            channels: 1,
        };
        let frame = CanFrame::new(0x10, &[1]).unwrap();
        writer.write(&frame, 0).unwrap();
        assert!(matches!(
            writer.write(&frame, 0),
            Err(LinkError::Queue(StorageError::Full { .. }))
        ));
        assert_eq!(writer.queued(), WIRE_FRAME_LEN);
    }

    #[test]
    fn test_passthrough_write_raw() {
        let (transport, _peer) = MemoryTransport::pair();
        let link = CanLink::with_transport(transport, passthrough(), FilterRegistry::new()).unwrap();
        assert_eq!(link.mode(), LinkMode::Passthrough);
        link.write_raw(&[1, 2, 3]).unwrap();
        assert!(matches!(
            link.write(&CanFrame::new(1, &[]).unwrap(), 0),
            Err(LinkError::Mode { .. })
        ));
    }

    #[test]
    fn test_invalid_config_starts_nothing() {
        let (transport, peer) = MemoryTransport::pair();
        let config = LinkConfig {
            channels: 0,
            ..LinkConfig::default()
        };
        assert!(matches!(
            CanLink::with_transport(transport, config, FilterRegistry::new()),
            Err(LinkError::Config(_))
        ));
        assert_eq!(peer.transfers(), 0);
    }

    #[test]
    fn test_drop_stops_worker() {
        let (transport, peer) = MemoryTransport::pair();
        let link =
            CanLink::with_transport(transport, LinkConfig::default(), FilterRegistry::new())
                .unwrap();
        assert!(link.forwarding_fd() >= 0);
        assert!(link.is_running());
        drop(link);
        let after = peer.transfers();
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert_eq!(peer.transfers(), after);
    }
}

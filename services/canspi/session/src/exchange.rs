//! Duplex exchange loop.
//!
//! Every tick moves exactly one wire frame in each direction: the oldest
//! queued outbound frame (or the idle sentinel) goes out while one frame's
//! worth of bytes comes back. The loop spins while there is work and backs
//! off once both directions are quiet.

use crate::sink::ForwardingSink;
use crate::transport::DuplexTransport;
use crate::{LinkConfig, LinkMode};
use canspi_routing::FilterRegistry;
use canspi_storage::OutboundQueue;
use canspi_wire::{
    decode_verify, idle_frame, is_idle, AssemblerMeta, FrameAssembler, WIRE_FRAME_LEN,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Filler byte for unused transmit space; also what an idle far side clocks out
const IDLE_FILL: u8 = 0xFF;

/// Exchange loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// Work pending in at least one direction; no sleep between ticks
    Draining,
    /// Nothing queued and nothing received on the last tick
    Idle,
    /// Shutdown observed; the loop has returned
    Stopped,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Draining => write!(f, "draining"),
            LinkState::Idle => write!(f, "idle"),
            LinkState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Live exchange counters, shared between the worker and link handles
#[derive(Debug, Default)]
pub struct ExchangeCounters {
    transfers: AtomicU64,
    frames_transmitted: AtomicU64,
    idle_transfers: AtomicU64,
    transfer_errors: AtomicU64,
    frames_received: AtomicU64,
    invalid_inbound: AtomicU64,
    misaddressed_inbound: AtomicU64,
    resyncs: AtomicU64,
    forwarded: AtomicU64,
    forward_errors: AtomicU64,
}

impl ExchangeCounters {
    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> ExchangeStats {
        ExchangeStats {
            transfers: self.transfers.load(Ordering::Relaxed),
            frames_transmitted: self.frames_transmitted.load(Ordering::Relaxed),
            idle_transfers: self.idle_transfers.load(Ordering::Relaxed),
            transfer_errors: self.transfer_errors.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            invalid_inbound: self.invalid_inbound.load(Ordering::Relaxed),
            misaddressed_inbound: self.misaddressed_inbound.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            forward_errors: self.forward_errors.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Statistics for an exchange loop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeStats {
    /// Transfers attempted
    pub transfers: u64,
    /// Transfers that carried a queued frame (or queued raw bytes)
    pub frames_transmitted: u64,
    /// Transfers that carried the idle sentinel
    pub idle_transfers: u64,
    /// Transfers the transport reported as failed
    pub transfer_errors: u64,
    /// Verified frames handed to dispatch
    pub frames_received: u64,
    /// Received buffers rejected (bad sync, checksum, remote, format)
    pub invalid_inbound: u64,
    /// Valid frames addressed to a channel this link does not serve
    pub misaddressed_inbound: u64,
    /// Assembler one-byte resync events
    pub resyncs: u64,
    /// Units delivered to the forwarding sink
    pub forwarded: u64,
    /// Units the forwarding sink refused
    pub forward_errors: u64,
}

/// Duplex exchange loop over transport `T` forwarding into sink `S`
pub struct ExchangeLoop<T, S> {
    transport: T,
    sink: S,
    outbound: Arc<OutboundQueue>,
    registry: Arc<FilterRegistry>,
    assemblers: Vec<FrameAssembler>,
    counters: Arc<ExchangeCounters>,
    mode: LinkMode,
    local_address: u8,
    require_extended: bool,
    idle_backoff: Duration,
    state: LinkState,
    tx_buf: [u8; WIRE_FRAME_LEN],
    rx_buf: [u8; WIRE_FRAME_LEN],
}

impl<T, S> ExchangeLoop<T, S>
where
    T: DuplexTransport,
    S: ForwardingSink,
{
    /// Build a loop; one assembler is created per configured channel
    pub fn new(
        transport: T,
        sink: S,
        outbound: Arc<OutboundQueue>,
        registry: Arc<FilterRegistry>,
        config: &LinkConfig,
    ) -> Self {
        let assemblers = (0..config.channels)
            .map(|channel| {
                let mut meta = AssemblerMeta::can_spi();
                meta.capacity = config.assembler_capacity;
                FrameAssembler::new(format!("can{}", channel), meta)
            })
            .collect();

        Self {
            transport,
            sink,
            outbound,
            registry,
            assemblers,
            counters: Arc::new(ExchangeCounters::default()),
            mode: config.mode,
            local_address: config.local_address & 1,
            require_extended: config.require_extended,
            idle_backoff: config.idle_backoff,
            state: LinkState::Draining,
            tx_buf: [IDLE_FILL; WIRE_FRAME_LEN],
            rx_buf: [0u8; WIRE_FRAME_LEN],
        }
    }

    /// Shared counters, readable while the loop runs on another thread
    pub fn counters(&self) -> Arc<ExchangeCounters> {
        self.counters.clone()
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Assembler serving `channel`
    pub fn assembler(&self, channel: u8) -> Option<&FrameAssembler> {
        self.assemblers.get(channel as usize)
    }

    /// Perform one full-duplex transfer and process what came back
    pub fn tick(&mut self) -> LinkState {
        let transmitting = self.fill_tx();
        ExchangeCounters::bump(&self.counters.transfers);

        let received = match self.transport.transfer(&self.tx_buf, &mut self.rx_buf) {
            Ok(n) => {
                if transmitting {
                    ExchangeCounters::bump(&self.counters.frames_transmitted);
                }
                let n = n.min(WIRE_FRAME_LEN);
                match self.mode {
                    LinkMode::Framed => self.handle_framed(n),
                    LinkMode::Passthrough => self.handle_passthrough(n),
                }
            }
            Err(e) => {
                ExchangeCounters::bump(&self.counters.transfer_errors);
                warn!("SPI transfer failed: {}", e);
                false
            }
        };

        let pending = match self.mode {
            LinkMode::Framed => self.outbound.has_frame(),
            LinkMode::Passthrough => !self.outbound.is_empty(),
        };
        self.state = if pending || received {
            LinkState::Draining
        } else {
            LinkState::Idle
        };
        self.state
    }

    /// Tick until `shutdown` is set, sleeping `idle_backoff` whenever idle
    pub fn run(&mut self, shutdown: &AtomicBool) -> LinkState {
        info!(
            "Exchange loop started ({} mode, {} channel(s), backoff {:?})",
            self.mode,
            self.assemblers.len(),
            self.idle_backoff
        );

        while !shutdown.load(Ordering::Acquire) {
            if self.tick() == LinkState::Idle && !self.idle_backoff.is_zero() {
                thread::sleep(self.idle_backoff);
            }
        }

        self.state = LinkState::Stopped;
        info!("Exchange loop stopped: {:?}", self.counters.snapshot());
        self.state
    }

    /// Load the transmit buffer; `true` when it carries queued data
    fn fill_tx(&mut self) -> bool {
        match self.mode {
            LinkMode::Framed => {
                if self.outbound.pop_frame(&mut self.tx_buf) {
                    return true;
                }
                self.tx_buf = idle_frame(self.local_address);
            }
            LinkMode::Passthrough => {
                let n = self.outbound.pop_partial(&mut self.tx_buf);
                self.tx_buf[n..].fill(IDLE_FILL);
                if n > 0 {
                    return true;
                }
            }
        }
        ExchangeCounters::bump(&self.counters.idle_transfers);
        false
    }

    fn handle_framed(&mut self, n: usize) -> bool {
        let Self {
            sink,
            registry,
            assemblers,
            counters,
            rx_buf,
            require_extended,
            ..
        } = self;
        let registry: &FilterRegistry = registry;
        let counters: &ExchangeCounters = counters;
        let rx = &rx_buf[..n];

        let decoded = match decode_verify(rx) {
            Ok(decoded) => decoded,
            Err(e) => {
                if is_idle(rx) {
                    trace!("Idle frame from peer");
                } else {
                    ExchangeCounters::bump(&counters.invalid_inbound);
                    debug!("Discarding inbound buffer: {}", e);
                }
                return false;
            }
        };

        if decoded.frame.remote {
            ExchangeCounters::bump(&counters.invalid_inbound);
            debug!("Discarding remote frame {}", decoded.frame);
            return false;
        }
        if *require_extended && !decoded.frame.extended {
            ExchangeCounters::bump(&counters.invalid_inbound);
            debug!("Discarding standard-format frame {}", decoded.frame);
            return false;
        }
        let Some(assembler) = assemblers.get_mut(decoded.channel as usize) else {
            ExchangeCounters::bump(&counters.misaddressed_inbound);
            debug!(
                "Discarding frame {} for unserved channel {}",
                decoded.frame, decoded.channel
            );
            return false;
        };

        let report = assembler.feed(rx, |bytes| deliver(registry, sink, counters, bytes));
        if report.resyncs > 0 {
            counters
                .resyncs
                .fetch_add(report.resyncs as u64, Ordering::Relaxed);
        }
        true
    }

    fn handle_passthrough(&mut self, n: usize) -> bool {
        let rx = &self.rx_buf[..n];
        if rx.iter().all(|b| *b == IDLE_FILL) {
            trace!("Idle chunk from peer");
            return false;
        }

        match self.sink.forward(rx) {
            Ok(()) => ExchangeCounters::bump(&self.counters.forwarded),
            Err(e) => {
                ExchangeCounters::bump(&self.counters.forward_errors);
                warn!("Forwarding {} raw bytes failed: {}", rx.len(), e);
            }
        }
        true
    }
}

/// Decode an assembled frame, dispatch it, and forward it if the handler asks
fn deliver<S: ForwardingSink>(
    registry: &FilterRegistry,
    sink: &mut S,
    counters: &ExchangeCounters,
    bytes: &[u8],
) {
    let decoded = match decode_verify(bytes) {
        Ok(decoded) => decoded,
        Err(e) => {
            ExchangeCounters::bump(&counters.invalid_inbound);
            debug!("Assembled frame failed verification: {}", e);
            return;
        }
    };

    ExchangeCounters::bump(&counters.frames_received);
    if !registry.dispatch(&decoded).should_forward() {
        return;
    }

    match sink.forward(bytes) {
        Ok(()) => {
            ExchangeCounters::bump(&counters.forwarded);
            debug!("Forwarded {} from channel {}", decoded.frame, decoded.channel);
        }
        Err(e) => {
            ExchangeCounters::bump(&counters.forward_errors);
            warn!("Forwarding frame {} failed: {}", decoded.frame, e);
        }
    }
}

//! CAN-over-SPI bridge binary.
//!
//! Opens the SPI link, registers the configured filters, and logs every frame
//! that arrives on the forwarding socket until SIGINT or SIGTERM.

use anyhow::Context;
use canspi_session::{CanLink, LinkMode};
use canspi_wire::{decode_verify, WIRE_FRAME_LEN};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixDatagram;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
#[macro_use]
mod logging;

use config::BridgeConfig;
use logging::BridgeLogFormatter;

/// Bridge a CAN controller on an SPI link to a local datagram socket
#[derive(Parser, Debug)]
#[command(name = "canspi", version, about = "CAN bus to host bridge over full-duplex SPI")]
struct Args {
    /// SPI device, e.g. /dev/spidev0.0
    #[arg(long)]
    device: Option<PathBuf>,

    /// Configuration file path
    #[arg(long, default_value = "canspi.yaml")]
    config: PathBuf,

    /// Link mode: framed or passthrough
    #[arg(long)]
    mode: Option<LinkMode>,

    /// SPI clock rate in Hz
    #[arg(long)]
    speed_hz: Option<u32>,

    /// Sleep between idle transfers, e.g. 10ms
    #[arg(long)]
    idle_backoff: Option<humantime::Duration>,

    /// Interval between statistics log lines, e.g. 30s
    #[arg(long)]
    stats_interval: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command line flags win over file and environment
    fn apply_overrides(&self, config: &mut BridgeConfig) {
        if let Some(device) = &self.device {
            config.device = device.clone();
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(speed_hz) = self.speed_hz {
            config.spi.speed_hz = speed_hz;
        }
        if let Some(backoff) = self.idle_backoff {
            config.idle_backoff_ms = Duration::from(backoff).as_millis() as u64;
        }
        if let Some(interval) = self.stats_interval {
            config.stats_interval_secs = Duration::from(interval).as_secs();
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Describe one datagram read from the forwarding socket
fn describe(mode: LinkMode, datagram: &[u8]) -> String {
    if mode == LinkMode::Framed && datagram.len() == WIRE_FRAME_LEN {
        if let Ok(decoded) = decode_verify(datagram) {
            return format!("can{} {} [{}]", decoded.channel, decoded.frame, hex(datagram));
        }
    }
    format!("{} bytes [{}]", datagram.len(), hex(datagram))
}

/// Timer whose first tick comes one full period after start
fn stats_interval(period: Duration) -> tokio::time::Interval {
    tokio::time::interval_at(tokio::time::Instant::now() + period, period)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("canspi={}", args.log_level).parse()?)
        .add_directive(format!("canspi_session={}", args.log_level).parse()?)
        .add_directive(format!("canspi_wire={}", args.log_level).parse()?)
        .add_directive(format!("canspi_routing={}", args.log_level).parse()?)
        .add_directive(format!("canspi_storage={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(BridgeLogFormatter::new("canspi"))
        .init();

    info!("Starting canspi bridge v{}", env!("CARGO_PKG_VERSION"));

    let mut bridge_config = BridgeConfig::load_from_file(&args.config)?;
    args.apply_overrides(&mut bridge_config);

    let registry = bridge_config.build_registry()?;
    if bridge_config.mode == LinkMode::Framed && registry.is_empty() {
        warn!("No filters configured; every inbound frame will be dropped as unknown");
    }

    let link = CanLink::init(
        &bridge_config.device,
        bridge_config.link_config(),
        registry,
    )
    .with_context(|| format!("starting link on {:?}", bridge_config.device))?;

    let socket = link
        .forwarding_socket()
        .context("cloning forwarding socket")?;
    socket.set_nonblocking(true)?;
    let socket = UnixDatagram::from_std(socket)?;
    info!("Forwarding socket ready on fd {}", link.forwarding_fd());

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;

    let mut stats_timer = match bridge_config.stats_interval_secs {
        0 => None,
        secs => Some(stats_interval(Duration::from_secs(secs))),
    };

    let mode = link.mode();
    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM signal, shutting down");
                break;
            }

            _ = sigint.recv() => {
                info!("Received SIGINT signal, shutting down");
                break;
            }

            received = socket.recv(&mut buf) => {
                match received {
                    Ok(n) => component_info!("fwd", "{}", describe(mode, &buf[..n])),
                    Err(e) => {
                        component_warn!("fwd", "Forwarding socket read failed: {}", e);
                        break;
                    }
                }
            }

            _ = async {
                match stats_timer.as_mut() {
                    Some(timer) => { timer.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                match serde_json::to_string(&link.stats()) {
                    Ok(stats) => component_info!("stats", "{}", stats),
                    Err(e) => warn!("Failed to serialize link stats: {}", e),
                }
            }
        }
    }

    let state = tokio::task::spawn_blocking(move || {
        let stats = link.stats();
        (link.close(), stats)
    })
    .await
    .context("joining link shutdown")?;

    info!(
        "Link {}: {}",
        state.0,
        serde_json::to_string(&state.1).unwrap_or_default()
    );
    info!("canspi bridge shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use canspi_wire::{encode, CanFrame};

    #[test]
    fn test_describe_framed_datagram() {
        let wire = encode(&CanFrame::new(0x7E8, &[0x41, 0x0C]).unwrap(), 1);
        let text = describe(LinkMode::Framed, &wire);
        assert!(text.starts_with("can1 7E8#410C ["), "{}", text);
        assert!(text.ends_with(&format!("{:02X}]", wire[15])));
    }

    #[test]
    fn test_describe_raw_datagram() {
        assert_eq!(describe(LinkMode::Passthrough, &[0xDE, 0xAD]), "2 bytes [DE AD]");
        assert_eq!(hex(&[]), "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_interval_skips_startup_tick() {
        let period = Duration::from_secs(30);
        let start = tokio::time::Instant::now();
        let mut timer = stats_interval(period);

        timer.tick().await;
        assert!(start.elapsed() >= period);
        assert!(start.elapsed() < period * 2);
        timer.tick().await;
        assert!(start.elapsed() >= period * 2);
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "canspi",
            "--device",
            "/dev/spidev2.1",
            "--mode",
            "passthrough",
            "--idle-backoff",
            "25ms",
            "--speed-hz",
            "2000000",
        ]);
        let mut config = BridgeConfig::default();
        args.apply_overrides(&mut config);

        assert_eq!(config.device, PathBuf::from("/dev/spidev2.1"));
        assert_eq!(config.mode, LinkMode::Passthrough);
        assert_eq!(config.idle_backoff_ms, 25);
        assert_eq!(config.spi.speed_hz, 2_000_000);
        assert_eq!(config.stats_interval_secs, 0);
    }
}

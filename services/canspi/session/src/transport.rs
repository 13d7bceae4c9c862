//! Full-duplex transfer primitive and its implementations.
//!
//! [`SpidevTransport`] drives a Linux `spidev` character device through its
//! ioctl interface. [`MemoryTransport`] is an in-process stand-in whose far
//! side is scripted through a [`MemoryPeer`].

use crate::LinkError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// One exchange: `tx` goes out while `rx` fills with the same number of bytes
pub trait DuplexTransport: Send {
    /// Perform one full-duplex transfer and return the byte count moved
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<usize>;
}

impl<T: DuplexTransport + ?Sized> DuplexTransport for Box<T> {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<usize> {
        (**self).transfer(tx, rx)
    }
}

/// Clock phase bit of the SPI mode
pub const SPI_CPHA: u8 = 0x01;
/// Clock polarity bit of the SPI mode
pub const SPI_CPOL: u8 = 0x02;

const SPI_IOC_WR_MODE: u32 = 0x4001_6b01;
const SPI_IOC_RD_MODE: u32 = 0x8001_6b01;
const SPI_IOC_WR_BITS_PER_WORD: u32 = 0x4001_6b03;
const SPI_IOC_RD_BITS_PER_WORD: u32 = 0x8001_6b03;
const SPI_IOC_WR_MAX_SPEED_HZ: u32 = 0x4004_6b04;
const SPI_IOC_RD_MAX_SPEED_HZ: u32 = 0x8004_6b04;
// _IOW('k', 0, char[32]): one spi_ioc_transfer
const SPI_IOC_MESSAGE_1: u32 = 0x4020_6b00;

/// Settings applied to the SPI device when it is opened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpiConfig {
    /// SPI mode bits (`SPI_CPOL | SPI_CPHA` is mode 3)
    pub mode: u8,
    /// Word size in bits
    pub bits_per_word: u8,
    /// Maximum clock rate
    pub speed_hz: u32,
    /// Delay after each transfer before chip select is released
    pub delay_usecs: u16,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            mode: SPI_CPOL | SPI_CPHA,
            bits_per_word: 8,
            speed_hz: 1_125_000,
            delay_usecs: 0,
        }
    }
}

/// Kernel `struct spi_ioc_transfer`
#[repr(C)]
#[derive(Debug, Default)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

/// Linux `spidev` device
#[derive(Debug)]
pub struct SpidevTransport {
    file: File,
    path: PathBuf,
    config: SpiConfig,
}

impl SpidevTransport {
    /// Open `path` and apply `config`
    pub fn open(path: impl AsRef<Path>, config: &SpiConfig) -> Result<Self, LinkError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| LinkError::Open {
                device: path.display().to_string(),
                source,
            })?;

        let transport = Self {
            file,
            path,
            config: config.clone(),
        };
        transport.configure()?;
        Ok(transport)
    }

    fn configure(&self) -> Result<(), LinkError> {
        let mut mode = self.config.mode;
        let mut bits = self.config.bits_per_word;
        let mut speed = self.config.speed_hz;

        self.ioctl_setting("mode", SPI_IOC_WR_MODE, &mut mode)?;
        self.ioctl_setting("mode", SPI_IOC_RD_MODE, &mut mode)?;
        self.ioctl_setting("bits per word", SPI_IOC_WR_BITS_PER_WORD, &mut bits)?;
        self.ioctl_setting("bits per word", SPI_IOC_RD_BITS_PER_WORD, &mut bits)?;
        self.ioctl_setting("max speed", SPI_IOC_WR_MAX_SPEED_HZ, &mut speed)?;
        self.ioctl_setting("max speed", SPI_IOC_RD_MAX_SPEED_HZ, &mut speed)?;

        info!(
            "Opened {}: mode {} bits {} speed {} Hz delay {} us",
            self.path.display(),
            mode,
            bits,
            speed,
            self.config.delay_usecs
        );
        Ok(())
    }

    fn ioctl_setting<T>(
        &self,
        setting: &'static str,
        request: u32,
        value: &mut T,
    ) -> Result<(), LinkError> {
        // SAFETY: `value` is a live, correctly sized argument for `request`
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, value as *mut T) };
        if rc < 0 {
            return Err(LinkError::Configure {
                setting,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Device path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Settings the device was opened with
    pub fn config(&self) -> &SpiConfig {
        &self.config
    }
}

impl DuplexTransport for SpidevTransport {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<usize> {
        if tx.len() != rx.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("tx/rx length mismatch: {} vs {}", tx.len(), rx.len()),
            ));
        }

        let mut xfer = SpiIocTransfer {
            tx_buf: tx.as_ptr() as u64,
            rx_buf: rx.as_mut_ptr() as u64,
            len: tx.len() as u32,
            speed_hz: self.config.speed_hz,
            delay_usecs: self.config.delay_usecs,
            bits_per_word: self.config.bits_per_word,
            ..Default::default()
        };

        // SAFETY: both buffers outlive the call and are `len` bytes long
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                SPI_IOC_MESSAGE_1 as _,
                &mut xfer as *mut SpiIocTransfer,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }
}

#[derive(Debug, Default)]
struct MemoryWire {
    inbound: VecDeque<u8>,
    sent: Vec<Vec<u8>>,
    fail_next: usize,
    transfers: u64,
}

/// In-process duplex transport.
///
/// Each transfer records what was transmitted and fills the receive buffer
/// from bytes injected through the paired [`MemoryPeer`], padding with `0xFF`
/// when nothing is pending.
#[derive(Debug)]
pub struct MemoryTransport {
    wire: Arc<Mutex<MemoryWire>>,
}

/// Far side of a [`MemoryTransport`]
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    wire: Arc<Mutex<MemoryWire>>,
}

impl MemoryTransport {
    /// Create a transport and the handle that scripts its far side
    pub fn pair() -> (Self, MemoryPeer) {
        let wire = Arc::new(Mutex::new(MemoryWire::default()));
        (Self { wire: wire.clone() }, MemoryPeer { wire })
    }
}

impl DuplexTransport for MemoryTransport {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<usize> {
        let mut wire = lock_wire(&self.wire);
        wire.transfers += 1;
        if wire.fail_next > 0 {
            wire.fail_next -= 1;
            return Err(io::Error::new(io::ErrorKind::Other, "injected transfer failure"));
        }

        wire.sent.push(tx.to_vec());
        for slot in rx.iter_mut() {
            *slot = wire.inbound.pop_front().unwrap_or(0xFF);
        }
        Ok(tx.len())
    }
}

impl MemoryPeer {
    /// Queue bytes for the link to receive
    pub fn inject(&self, bytes: &[u8]) {
        lock_wire(&self.wire).inbound.extend(bytes.iter().copied());
    }

    /// Fail the next `count` transfers
    pub fn fail_next(&self, count: usize) {
        lock_wire(&self.wire).fail_next = count;
    }

    /// Take every transmit buffer recorded so far
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut lock_wire(&self.wire).sent)
    }

    /// Injected bytes not yet received
    pub fn pending(&self) -> usize {
        lock_wire(&self.wire).inbound.len()
    }

    /// Transfers attempted, failed ones included
    pub fn transfers(&self) -> u64 {
        lock_wire(&self.wire).transfers
    }
}

fn lock_wire(wire: &Mutex<MemoryWire>) -> MutexGuard<'_, MemoryWire> {
    wire.lock().unwrap_or_else(|poisoned| {
        debug!("Memory transport lock poisoned, continuing");
        poisoned.into_inner()
    })
}

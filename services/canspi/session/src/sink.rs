//! Forwarding sink: where frames a handler forwards are delivered

use std::io;
use std::os::unix::net::UnixDatagram;
use tracing::debug;

/// Destination for forwarded frames.
///
/// Each call carries one unit: a verified 16-byte wire frame in framed mode, a
/// raw received chunk in pass-through mode.
pub trait ForwardingSink: Send {
    /// Deliver one unit
    fn forward(&mut self, bytes: &[u8]) -> io::Result<()>;
}

impl<F> ForwardingSink for F
where
    F: FnMut(&[u8]) -> io::Result<()> + Send,
{
    fn forward(&mut self, bytes: &[u8]) -> io::Result<()> {
        self(bytes)
    }
}

/// Write half of a Unix datagram pair.
///
/// Sends never block: a reader that falls behind costs dropped datagrams,
/// which the exchange loop counts as forward errors.
#[derive(Debug)]
pub struct DatagramSink {
    socket: UnixDatagram,
}

impl DatagramSink {
    /// Create a connected pair; the returned socket is the read half
    pub fn pair() -> io::Result<(Self, UnixDatagram)> {
        let (tx, rx) = UnixDatagram::pair()?;
        tx.set_nonblocking(true)?;
        debug!("Created forwarding socket pair");
        Ok((Self { socket: tx }, rx))
    }
}

impl ForwardingSink for DatagramSink {
    fn forward(&mut self, bytes: &[u8]) -> io::Result<()> {
        let sent = self.socket.send(bytes)?;
        if sent != bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short datagram: {} of {} bytes", sent, bytes.len()),
            ));
        }
        Ok(())
    }
}

//! End-to-end link tests over the in-memory transport

use canspi_routing::{Disposition, FilterRegistry, ForwardAll};
use canspi_session::{CanLink, LinkConfig, LinkMode, LinkState, MemoryPeer, MemoryTransport};
use canspi_wire::{encode, CanFrame, IDLE_HEAD, WIRE_FRAME_LEN};
use std::sync::mpsc;
use std::time::{Duration, Instant};

fn fast_config() -> LinkConfig {
    LinkConfig {
        idle_backoff: Duration::from_millis(1),
        ..LinkConfig::default()
    }
}

/// Collect non-idle transmit buffers until `count` arrive or the deadline passes
fn wait_for_sent(peer: &MemoryPeer, count: usize) -> Vec<Vec<u8>> {
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut frames = Vec::new();
    while frames.len() < count && Instant::now() < deadline {
        frames.extend(
            peer.take_sent()
                .into_iter()
                .filter(|buf| buf[0] != IDLE_HEAD),
        );
        std::thread::sleep(Duration::from_millis(1));
    }
    frames
}

/// Poll `condition` until it holds or the deadline passes
fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

#[test]
fn test_written_frames_reach_the_wire_in_order() {
    let (transport, peer) = MemoryTransport::pair();
    let link = CanLink::with_transport(transport, fast_config(), FilterRegistry::new()).unwrap();

    let writer = link.writer();
    let frames: Vec<_> = (0..5u32)
        .map(|i| CanFrame::new(0x200 + i, &[i as u8; 3]).unwrap())
        .collect();
    for frame in &frames {
        writer.write(frame, 0).unwrap();
    }

    let sent = wait_for_sent(&peer, frames.len());
    assert_eq!(sent.len(), frames.len());
    for (buf, frame) in sent.iter().zip(&frames) {
        assert_eq!(buf.as_slice(), encode(frame, 0).as_slice());
    }

    let stats = link.stats();
    assert_eq!(stats.outbound.frames_enqueued, 5);
    assert_eq!(stats.outbound.frames_dequeued, 5);
    assert_eq!(link.close(), LinkState::Stopped);
}

#[test]
fn test_forwarded_frame_arrives_on_socket() {
    let (transport, peer) = MemoryTransport::pair();
    let mut registry = FilterRegistry::new();
    registry.register(0x7E0, 0x7F0, false, ForwardAll).unwrap();
    let link = CanLink::with_transport(transport, fast_config(), registry).unwrap();

    let reader = link.forwarding_socket().unwrap();
    reader
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    // Not matched: dropped as unknown
    peer.inject(&encode(&CanFrame::new(0x100, &[9]).unwrap(), 0));
    let wire = encode(&CanFrame::new(0x7E8, &[0x03, 0x41, 0x0C]).unwrap(), 0);
    peer.inject(&wire);

    let mut buf = [0u8; 64];
    let n = reader.recv(&mut buf).unwrap();
    assert_eq!(n, WIRE_FRAME_LEN);
    assert_eq!(&buf[..n], &wire);

    let stats = link.stats();
    assert_eq!(stats.dispatch.unrecognized, 1);
    assert_eq!(stats.dispatch.forwarded, 1);
    link.close();
}

#[test]
fn test_handler_receives_decoded_frame() {
    let (transport, peer) = MemoryTransport::pair();
    let (tx, rx) = mpsc::channel();
    let tx = std::sync::Mutex::new(tx);

    let mut registry = FilterRegistry::new();
    registry
        .register(0x18DA_F100, 0x1FFF_FF00, true, move |channel: u8, frame: &CanFrame| {
            let _ = tx.lock().unwrap().send((channel, *frame));
            Disposition::Consumed
        })
        .unwrap();

    let config = LinkConfig {
        require_extended: true,
        ..fast_config()
    };
    let link = CanLink::with_transport(transport, config, registry).unwrap();

    let frame = CanFrame::new_extended(0x18DA_F110, &[0x10, 0x20]).unwrap();
    peer.inject(&encode(&frame, 0));

    let (channel, got) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(channel, 0);
    assert_eq!(got, frame);
    // The counter moves only after the handler returns
    assert!(eventually(|| link.stats().dispatch.consumed == 1));
    link.close();
}

#[test]
fn test_passthrough_link() {
    let (transport, peer) = MemoryTransport::pair();
    let config = LinkConfig {
        mode: LinkMode::Passthrough,
        ..fast_config()
    };
    let link = CanLink::with_transport(transport, config, FilterRegistry::new()).unwrap();
    let reader = link.forwarding_socket().unwrap();
    reader
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    link.write_raw(b"hello").unwrap();
    peer.inject(b"world");

    let mut buf = [0u8; 64];
    let n = reader.recv(&mut buf).unwrap();
    assert_eq!(&buf[..5], b"world");
    assert!(buf[5..n].iter().all(|b| *b == 0xFF));

    let sent = wait_for_sent(&peer, 1);
    assert_eq!(&sent[0][..5], b"hello");
    link.close();
}

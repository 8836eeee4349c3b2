//! Bus transports for CAN frames
//!
//! - [`FrameBus`]: in-process broadcast medium, every reader sees every frame
//! - [`BusSocket`]: UDP virtual CAN bus between processes

use crate::types::{format_id, Frame};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Default UDP port for the virtual bus
pub const DEFAULT_PORT: u16 = 9970;

/// Default number of frames a slow reader may fall behind before skipping
pub const DEFAULT_CAPACITY: usize = 1024;

/// Larger than any valid datagram so oversized ones are detected
const MAX_DATAGRAM: usize = 64;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed datagram ({len} bytes) from {src}")]
    Malformed { len: usize, src: SocketAddr },
}

/// In-process broadcast bus
#[derive(Clone)]
pub struct FrameBus {
    tx: broadcast::Sender<Frame>,
}

impl FrameBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Put a frame on the bus, returning how many readers will see it
    pub fn publish(&self, frame: Frame) -> usize {
        debug!("Bus <- {}", frame);
        self.tx.send(frame).unwrap_or(0)
    }

    /// Attach a new reader; it sees frames published from now on
    pub fn subscribe(&self) -> BusReader {
        BusReader {
            rx: self.tx.subscribe(),
        }
    }

    pub fn reader_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for FrameBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A listener attached to a [`FrameBus`]
pub struct BusReader {
    rx: broadcast::Receiver<Frame>,
}

impl BusReader {
    /// Next frame in bus order, or `None` once every publisher is gone
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Bus reader lagged, {} frames skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// UDP transport carrying 12-byte frames between processes
pub struct BusSocket {
    socket: Arc<UdpSocket>,
    peers: Vec<SocketAddr>,
}

impl BusSocket {
    /// Bind to `addr`; frames sent go to every address in `peers`
    pub async fn bind(addr: SocketAddr, peers: Vec<SocketAddr>) -> Result<Self, BusError> {
        let socket = UdpSocket::bind(addr).await?;
        socket.set_broadcast(true)?;

        Ok(Self {
            socket: Arc::new(socket),
            peers,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BusError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peers(&self) -> &[SocketAddr] {
        &self.peers
    }

    /// Send a frame to every peer.
    ///
    /// Fails with the last I/O error when no peer could be reached; a socket
    /// without peers sends nothing and succeeds.
    pub async fn send(&self, frame: &Frame) -> Result<(), BusError> {
        let bytes = frame.to_wire();
        let mut last_error = None;
        let mut delivered = 0;

        for peer in &self.peers {
            debug!("Sending {} to {}", frame, peer);
            match self.socket.send_to(&bytes, peer).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    warn!("Failed to send {} to {}: {}", format_id(frame.id), peer, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if delivered == 0 => Err(BusError::Io(e)),
            _ => Ok(()),
        }
    }

    /// Receive one frame, stamped with its arrival time
    pub async fn recv(&self) -> Result<(Frame, SocketAddr), BusError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, src) = self.socket.recv_from(&mut buf).await?;
        Frame::from_wire(&buf[..len])
            .map(|frame| (frame, src))
            .ok_or(BusError::Malformed { len, src })
    }

    /// Pump received datagrams onto an in-process bus in the background
    pub fn start_receive(&self, bus: FrameBus) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);

        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];

            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, src)) => match Frame::from_wire(&buf[..len]) {
                        Some(frame) => {
                            debug!("Received {} from {}", frame, src);
                            bus.publish(frame);
                        }
                        None => {
                            warn!("Dropping malformed datagram ({} bytes) from {}", len, src);
                        }
                    },
                    Err(e) => {
                        error!("UDP receive error: {}", e);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ids;

    #[tokio::test]
    async fn test_every_reader_sees_every_frame() {
        let bus = FrameBus::new(16);
        let mut gateway = bus.subscribe();
        let mut detector = bus.subscribe();

        assert_eq!(bus.publish(Frame::new(ids::METER_VALUES, [1; 8])), 2);
        assert_eq!(bus.publish(Frame::new(ids::STATUS_NOTIFICATION, [2; 8])), 2);

        for reader in [&mut gateway, &mut detector] {
            assert_eq!(reader.recv().await.unwrap().id, ids::METER_VALUES);
            assert_eq!(reader.recv().await.unwrap().id, ids::STATUS_NOTIFICATION);
        }
    }

    #[tokio::test]
    async fn test_reader_ends_when_bus_dropped() {
        let bus = FrameBus::new(4);
        let mut reader = bus.subscribe();
        bus.publish(Frame::new(ids::METER_VALUES, [0; 8]));
        drop(bus);

        assert!(reader.recv().await.is_some());
        assert!(reader.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_lagging_reader_skips_ahead() {
        let bus = FrameBus::new(2);
        let mut reader = bus.subscribe();
        for i in 0..5u8 {
            bus.publish(Frame::new(ids::METER_VALUES, [i; 8]));
        }

        // Oldest frames were overwritten; the reader resumes at the oldest retained one
        let frame = reader.recv().await.unwrap();
        assert_eq!(frame.data[0], 3);
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let rx = BusSocket::bind("127.0.0.1:0".parse().unwrap(), vec![])
            .await
            .unwrap();
        let rx_addr = rx.local_addr().unwrap();
        let tx = BusSocket::bind("127.0.0.1:0".parse().unwrap(), vec![rx_addr])
            .await
            .unwrap();

        let frame = Frame::new(ids::REMOTE_START_TRANSACTION, [1, 1, 1, 0, 0, 0, 0, 0]);
        tx.send(&frame).await.unwrap();

        let (received, _) = rx.recv().await.unwrap();
        assert_eq!(received.id, frame.id);
        assert_eq!(received.data, frame.data);
    }

    #[tokio::test]
    async fn test_send_fails_when_no_peer_reachable() {
        // An IPv4 socket cannot address an IPv6 peer
        let unreachable: SocketAddr = "[::1]:9970".parse().unwrap();
        let tx = BusSocket::bind("127.0.0.1:0".parse().unwrap(), vec![unreachable])
            .await
            .unwrap();

        let frame = Frame::new(ids::MALICIOUS, [0xFF; 8]);
        assert!(matches!(tx.send(&frame).await, Err(BusError::Io(_))));
    }

    #[tokio::test]
    async fn test_send_succeeds_if_any_peer_reached() {
        let rx = BusSocket::bind("127.0.0.1:0".parse().unwrap(), vec![])
            .await
            .unwrap();
        let peers = vec!["[::1]:9970".parse().unwrap(), rx.local_addr().unwrap()];
        let tx = BusSocket::bind("127.0.0.1:0".parse().unwrap(), peers)
            .await
            .unwrap();

        tx.send(&Frame::new(ids::METER_VALUES, [7; 8])).await.unwrap();
        let (received, _) = rx.recv().await.unwrap();
        assert_eq!(received.data, [7; 8]);

        let lonely = BusSocket::bind("127.0.0.1:0".parse().unwrap(), vec![])
            .await
            .unwrap();
        assert!(lonely.send(&Frame::new(ids::METER_VALUES, [0; 8])).await.is_ok());
    }
}

//! Tunnel Interface
//!
//! The relay reads outbound packets from, and writes inbound packets to, a
//! virtual interface. Two implementations exist: [`ChannelTun`], a bounded
//! queue pair whose far end is handed to an embedding network stack (or a
//! test), and the Linux kernel TUN device.

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::TunDevice;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};

/// Default queue depth of a [`ChannelTun`]
pub const DEFAULT_QUEUE_CAPACITY: usize = 3000;

/// Packet-level virtual interface.
///
/// `read_packet` yields whole raw IP packets in FIFO order; `write_packet`
/// blocks while the device cannot accept more.
#[async_trait]
pub trait TunnelInterface: Send + Sync {
    fn name(&self) -> &str;

    async fn read_packet(&self) -> Result<Vec<u8>>;

    async fn write_packet(&self, packet: &[u8]) -> Result<usize>;
}

/// In-process tunnel interface backed by two bounded queues
pub struct ChannelTun {
    name: String,
    /// Packets the stack wants to send through the relay
    outbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    /// Packets the relay delivers to the stack
    inbound: mpsc::Sender<Vec<u8>>,
}

/// Network-stack side of a [`ChannelTun`]
pub struct ChannelTunPeer {
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: mpsc::Receiver<Vec<u8>>,
}

impl ChannelTun {
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, ChannelTunPeer) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        (
            Self {
                name: name.into(),
                outbound: Mutex::new(out_rx),
                inbound: in_tx,
            },
            ChannelTunPeer {
                outbound: out_tx,
                inbound: in_rx,
            },
        )
    }
}

#[async_trait]
impl TunnelInterface for ChannelTun {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_packet(&self) -> Result<Vec<u8>> {
        self.outbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::Device(format!("{}: stack side closed", self.name)))
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<usize> {
        self.inbound
            .send(packet.to_vec())
            .await
            .map_err(|_| Error::Device(format!("{}: stack side closed", self.name)))?;
        Ok(packet.len())
    }
}

impl ChannelTunPeer {
    /// Queue a packet for the relay to route to a client
    pub async fn send(&self, packet: Vec<u8>) -> Result<()> {
        self.outbound
            .send(packet)
            .await
            .map_err(|_| Error::Device("relay side closed".into()))
    }

    /// Next packet a client sent through the relay
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_both_directions() {
        let (tun, mut peer) = ChannelTun::new("test0", 4);

        for i in 0..3u8 {
            peer.send(vec![i]).await.unwrap();
        }
        for i in 0..3u8 {
            assert_eq!(tun.read_packet().await.unwrap(), vec![i]);
        }

        assert_eq!(tun.write_packet(&[7, 7]).await.unwrap(), 2);
        assert_eq!(peer.recv().await, Some(vec![7, 7]));
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        let (tun, _peer) = ChannelTun::new("test0", 1);
        tun.write_packet(&[1]).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), tun.write_packet(&[2])).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_closed_stack_is_device_error() {
        let (tun, peer) = ChannelTun::new("test0", 1);
        drop(peer);
        assert!(matches!(tun.read_packet().await, Err(Error::Device(_))));
        assert!(matches!(tun.write_packet(&[1]).await, Err(Error::Device(_))));
    }
}

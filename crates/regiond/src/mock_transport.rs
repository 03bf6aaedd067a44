//! In-memory transports for testing.
//!
//! Messages sent on one half of a pair appear on the other half's `recv()`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::transport;
use crate::transport::Transport;

/// A duplex channel transport using tokio mpsc channels.
pub struct DuplexChannelTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    peer: Option<SocketAddr>,
}

impl DuplexChannelTransport {
    /// Creates a pair of transports connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self {
            tx: Mutex::new(Some(tx_a)),
            rx: Arc::new(Mutex::new(rx_b)),
            peer: None,
        };

        let b = Self {
            tx: Mutex::new(Some(tx_b)),
            rx: Arc::new(Mutex::new(rx_a)),
            peer: None,
        };

        (a, b)
    }

    /// Reports `addr` from `peer_addr()`.
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer = Some(addr);
        self
    }
}

#[async_trait::async_trait]
impl Transport for DuplexChannelTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        if payload.len() > transport::MAX_FRAME_LEN {
            return Err(transport::Error::PayloadTooLarge(payload.len()));
        }
        match self.tx.lock().await.as_ref() {
            Some(tx) => tx
                .send(payload.to_vec())
                .map_err(|_| transport::Error::ConnectionLost("Channel closed".into())),
            None => Err(transport::Error::ConnectionLost("Transport closed".into())),
        }
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn close(&self) {
        self.tx.lock().await.take();
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

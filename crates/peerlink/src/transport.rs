//! # Transport
//!
//! Whatever carries encoded frames between two sessions.
//!
//! ## Contract
//!
//! - Packets are opaque here; framing and handles live above this layer.
//! - Delivery is reliable and in order, each packet once.
//! - The session's writer sends while its pump receives, on separate tasks.

use std::fmt;
use std::sync::Mutex;

use tokio::sync::mpsc;

/// Why a transport could not move a packet. Any of these closes the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The other end is gone.
    ConnectionLost(String),
    /// The underlying pipe failed; raised by transports over real I/O.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "connection lost: {}", msg),
            Self::Io(msg) => write!(f, "i/o failure: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A reliable, ordered packet pipe. Sessions hold it as `Arc<dyn Transport>`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one packet.
    async fn send(&self, packet: &[u8]) -> Result<()>;

    /// Receives the next packet. `Ok(None)` means the peer hung up cleanly.
    ///
    /// Only one task calls `recv` at a time.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Releases the connection. Called once when the session closes.
    fn shutdown(&self) {}
}

/// Two sessions in one process, joined by unbounded channels.
///
/// Shutting one end down drops its sender, so the other end reads `None`.
pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl ChannelTransport {
    /// Both ends of a fresh connection.
    pub fn pair() -> (Self, Self) {
        let (left_tx, right_rx) = mpsc::unbounded_channel();
        let (right_tx, left_rx) = mpsc::unbounded_channel();
        (Self::end(left_tx, left_rx), Self::end(right_tx, right_rx))
    }

    fn end(tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { tx: Mutex::new(Some(tx)), rx: tokio::sync::Mutex::new(rx) }
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        self.tx.lock().ok().and_then(|tx| tx.clone())
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, packet: &[u8]) -> Result<()> {
        let Some(tx) = self.sender() else {
            return Err(TransportError::ConnectionLost("transport shut down".into()));
        };
        tx.send(packet.to_vec())
            .map_err(|_| TransportError::ConnectionLost("channel closed".into()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    fn shutdown(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }
}

//! # Transport Abstraction
//!
//! Moves opaque frames between a host and a guest.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: a transport knows nothing about channels, kinds or
//!   envelopes. It moves buffers in order and reports when the other end is gone.
//! - **Two Shapes**: the host pumps many connections on an async runtime, so it
//!   sees [`Transport`]. A guest is a single blocked thread while it waits for a
//!   synchronous reply, so it sees [`BlockingTransport`].

use std::fmt;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Mutex;

/// Errors that occur at the transport layer.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The other end is gone.
    ConnectionLost(String),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Host-side end of a connection.
///
/// This trait is object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one frame. Must preserve order relative to earlier sends.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Waits for the next frame. `Ok(None)` means the stream closed cleanly.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;
}

/// Guest-side end of a connection.
pub trait BlockingTransport: Send + Sync + 'static {
    fn send(&self, payload: &[u8]) -> Result<()>;

    /// Waits up to `timeout` (forever when `None`) for the next frame.
    /// `Ok(None)` means nothing arrived in time; a closed stream is an error.
    fn recv_timeout(&self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>>;
}

/// In-process connection between an async host and a blocking guest.
pub struct LocalTransport;

impl LocalTransport {
    /// Creates a connected pair. Frames sent on one end arrive on the other.
    pub fn pair() -> (HostEnd, GuestEnd) {
        let (to_guest, from_host) = std_mpsc::channel();
        let (to_host, from_guest) = mpsc::unbounded_channel();

        let host = HostEnd {
            tx: StdMutex::new(Some(to_guest)),
            rx: Mutex::new(from_guest),
        };
        let guest = GuestEnd {
            tx: to_host,
            rx: StdMutex::new(from_host),
        };
        (host, guest)
    }
}

/// The host half of a [`LocalTransport`].
pub struct HostEnd {
    tx: StdMutex<Option<std_mpsc::Sender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl HostEnd {
    /// Closes the host-to-guest direction; a blocked guest sees the loss.
    pub fn close(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }
}

#[async_trait::async_trait]
impl Transport for HostEnd {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .map_err(|_| TransportError::Io("sender lock poisoned".into()))?;
        match tx.as_ref() {
            Some(tx) => tx
                .send(payload.to_vec())
                .map_err(|_| TransportError::ConnectionLost("guest end dropped".into())),
            None => Err(TransportError::ConnectionLost("host end closed".into())),
        }
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}

/// The guest half of a [`LocalTransport`].
pub struct GuestEnd {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: StdMutex<std_mpsc::Receiver<Vec<u8>>>,
}

impl BlockingTransport for GuestEnd {
    fn send(&self, payload: &[u8]) -> Result<()> {
        self.tx
            .send(payload.to_vec())
            .map_err(|_| TransportError::ConnectionLost("host end dropped".into()))
    }

    fn recv_timeout(&self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        let rx = self
            .rx
            .lock()
            .map_err(|_| TransportError::Io("receiver lock poisoned".into()))?;
        let closed = || TransportError::ConnectionLost("host end dropped".into());
        match timeout {
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(frame) => Ok(Some(frame)),
                Err(std_mpsc::RecvTimeoutError::Timeout) => Ok(None),
                Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(closed()),
            },
            None => rx.recv().map(Some).map_err(|_| closed()),
        }
    }
}

/// A duplex channel transport with two async ends.
///
/// Used where both sides of a connection live on the runtime, e.g. a router
/// talking to a scripted peer in tests.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl ChannelTransport {
    /// Creates a pair of transports connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self {
            tx: tx_a,
            rx: Arc::new(Mutex::new(rx_b)),
        };
        let b = Self {
            tx: tx_b,
            rx: Arc::new(Mutex::new(rx_a)),
        };
        (a, b)
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        self.tx
            .send(payload.to_vec())
            .map_err(|_| TransportError::ConnectionLost("Channel closed".into()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}

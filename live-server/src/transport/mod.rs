//! Transport abstraction for livedata connections.
//!
//! The transport trait is async and connection-oriented:
//! - `connect()` establishes a connection
//! - `send()` transmits one encoded frame
//! - `recv()` waits for the next encoded frame
//! - `close()` terminates the connection
//!
//! Frames are JSON-encoded [`Frame`](live_types::Frame)s; the transport only
//! moves bytes.

mod mock;

pub use mock::MockTransport;

use async_trait::async_trait;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,
}

/// Transport trait for exchanging frames with a peer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the peer at `address`.
    async fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// Send one encoded frame.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive the next encoded frame.
    ///
    /// Waits until a frame arrives or the connection closes. Must be
    /// cancel-safe: dropping the future loses no frame.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection.
    async fn close(&self) -> Result<(), TransportError>;
}

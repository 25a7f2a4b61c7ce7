//! Transport abstraction consumed by the engine.
//!
//! A transport delivers opaque ordered byte frames to one client and signals
//! closure; the engine makes no assumption about the wire encoding beyond
//! what the codec in `relay-protocol` produced.

use crate::errors::Disconnect;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One client's outbound byte-frame sink.
///
/// Implementations handle the underlying protocol (WebSocket, SSE, ...) and
/// must preserve frame ordering. Writes block only the caller, which the
/// engine guarantees is the per-connection writer task.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name, e.g. "websocket".
    fn name(&self) -> &'static str;

    /// Write one encoded frame.
    async fn write(&self, data: Bytes) -> Result<(), TransportError>;

    /// Write a batch of encoded frames, preserving order.
    async fn write_many(&self, data: Vec<Bytes>) -> Result<(), TransportError>;

    /// Close the transport, telling the client why.
    async fn close(&self, disconnect: &Disconnect) -> Result<(), TransportError>;
}

//! Trait abstraction for the wire protocol under a secure channel.
//!
//! The engine is protocol-agnostic: anything that delivers whole frames in
//! order per connection can carry a `SecureChannel`. Mock-friendly by
//! construction, see `MemoryProtocol`.

use async_trait::async_trait;
use thiserror::Error;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("failed to seal frame")]
    SealFailed,

    #[error("failed to open frame (tampered or wrong key)")]
    OpenFailed,

    #[error("out-of-order frame: expected sequence {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("participant {0} is not connected")]
    NotConnected(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl TransportError {
    /// Whether the connection can keep being used after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Codec(_) | TransportError::FrameTooLarge(_))
    }
}

/// Ordered, framed byte transport for one connection.
#[async_trait]
pub trait WireProtocol: Send + Sync {
    /// Deliver one frame to the peer.
    async fn send_frame(&self, frame: Vec<u8>) -> TransportResult<()>;

    /// Next frame from the peer; `Ok(None)` on clean shutdown.
    async fn recv_frame(&self) -> TransportResult<Option<Vec<u8>>>;

    /// Close the connection. Idempotent.
    async fn close(&self) -> TransportResult<()>;

    /// Short protocol name for logs.
    fn name(&self) -> &'static str;
}

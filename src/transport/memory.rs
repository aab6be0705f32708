//! In-process wire protocol backed by tokio channels.
//!
//! Used by the simulator and by tests; delivery is ordered and lossless.

use super::traits::{TransportError, TransportResult, WireProtocol};
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// One end of an in-memory connection.
pub struct MemoryProtocol {
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryProtocol {
    /// Create two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: Mutex::new(Some(a_tx)),
                inbound: tokio::sync::Mutex::new(b_rx),
            },
            Self {
                outbound: Mutex::new(Some(b_tx)),
                inbound: tokio::sync::Mutex::new(a_rx),
            },
        )
    }
}

#[async_trait]
impl WireProtocol for MemoryProtocol {
    async fn send_frame(&self, frame: Vec<u8>) -> TransportResult<()> {
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        match outbound.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn recv_frame(&self) -> TransportResult<Option<Vec<u8>>> {
        let mut inbound = self.inbound.lock().await;
        Ok(inbound.recv().await)
    }

    async fn close(&self) -> TransportResult<()> {
        // Dropping the sender ends the peer's receive stream
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

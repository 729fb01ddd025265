//! Cloneable send handle onto the connection's outbound queue

use anyhow::{anyhow, Result};
use bytes::Bytes;
use remote_agent_shared::codec::MAX_MESSAGE_SIZE;
use serde::Serialize;
use tokio::sync::mpsc;

/// Handle used by every task that writes to the hub
///
/// Payloads are queued and written one frame at a time by the connection
/// loop, so concurrent senders never interleave inside a message.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Bytes>,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }

    /// Queue a raw JSON payload for delivery
    ///
    /// Payloads that cannot fit in one frame are rejected here rather than
    /// dropped later by the connection loop.
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        if !fits_in_frame(payload.len()) {
            return Err(anyhow!(
                "Message too large: {} bytes (max: {})",
                payload.len(),
                MAX_MESSAGE_SIZE
            ));
        }
        self.tx
            .send(payload)
            .await
            .map_err(|_| anyhow!("Connection closed"))
    }

    /// Serialize a value as JSON and queue it
    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.send(Bytes::from(payload)).await
    }
}

/// Whether a payload of `len` bytes can be sent as a single frame
pub fn fits_in_frame(len: usize) -> bool {
    len <= MAX_MESSAGE_SIZE as usize
}

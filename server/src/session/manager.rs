//! Session manager for tracking all connected agents

use super::connection::SessionHandle;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Manages all active agent sessions
#[derive(Clone, Default)]
pub struct SessionManager {
    /// Map of device_id -> session handle
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent session, replacing any older one for the same device
    pub async fn register(&self, handle: SessionHandle) {
        let mut sessions = self.sessions.write().await;
        if let Some(old) = sessions.insert(handle.device_id.clone(), handle) {
            warn!("Replaced stale session for {} ({})", old.device_id, old.addr);
        }
    }

    /// Unregister a session, unless the device already reconnected from elsewhere
    pub async fn unregister(&self, device_id: &str, addr: SocketAddr) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(device_id).is_some_and(|h| h.addr == addr) {
            sessions.remove(device_id);
        }
    }

    /// Get a session handle for a specific agent
    pub async fn get(&self, device_id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(device_id).cloned()
    }

    /// Send a message body to a specific agent
    pub async fn send_to(&self, device_id: &str, payload: &[u8]) -> Result<()> {
        let handle = self
            .get(device_id)
            .await
            .ok_or_else(|| anyhow!("Agent not connected: {}", device_id))?;
        handle.send(payload).await
    }

    /// Send a message body to every connected agent; returns how many got it
    pub async fn broadcast(&self, payload: &[u8]) -> usize {
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();

        let mut delivered = 0;
        for handle in handles {
            match handle.send(payload).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Failed to send to {}: {}", handle.device_id, e),
            }
        }
        delivered
    }

    /// Get list of all connected device IDs
    pub async fn connected_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Get the number of connected agents
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

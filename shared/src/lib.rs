//! Remote Agent Shared Protocol Types
//!
//! This crate provides the wire types and framing codec used between the
//! remote agent and the message hub it connects to.

pub mod codec;
pub mod protocol;

// Re-export commonly used types at crate root
pub use protocol::*;

/// Timing and addressing defaults for the system
pub mod intervals {
    /// Heartbeat interval in seconds
    pub const HEARTBEAT_INTERVAL_SECS: u64 = 600;

    /// Port assumed when the hub host carries none
    pub const DEFAULT_HUB_PORT: u16 = 8080;

    /// Initial reconnect delay in milliseconds
    pub const RECONNECT_DELAY_MS: u64 = 1000;

    /// Upper bound for the exponential reconnect backoff
    pub const MAX_RECONNECT_DELAY_MS: u64 = 60_000;
}

//! Connection management for the persistent hub connection
//!
//! This module handles:
//! - The initial connect (fatal on failure) and background reconnection
//! - Bidirectional framed message streaming
//! - A single outbound queue shared by every sender

mod manager;
mod outbound;

pub use manager::{ConnectionConfig, ConnectionEvent, ConnectionManager};
pub use outbound::{fits_in_frame, Outbound};

//! Session management for tracking connected agents
//!
//! This module handles:
//! - Registering agents by the device_id in their hello frame
//! - Reading framed message bodies from each agent
//! - Sending command messages to one agent or all of them

mod connection;
mod manager;

pub use connection::{AgentSession, SessionHandle};
pub use manager::SessionManager;

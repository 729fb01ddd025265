//! Transport Interface: the byte stream between the agent and its message hub

pub mod tcp;
pub mod traits;

pub use tcp::TcpConnector;
pub use traits::{TransportConnector, TransportStream};

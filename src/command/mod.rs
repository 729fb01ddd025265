//! Remote command execution
//!
//! This module handles:
//! - Decoding command messages from the hub
//! - Choosing an interpreter for the host platform
//! - Running scripts as child processes and parsing their output
//! - Returning results over the hub connection or to a callback URL

mod dispatcher;
mod executor;
mod interpreter;
mod router;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use executor::CommandExecutor;
pub use interpreter::Platform;
pub use router::ResultRouter;

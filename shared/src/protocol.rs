//! JSON message bodies exchanged between the agent and the hub

use serde::{Deserialize, Serialize};

/// Delimiter used to join a list of commands when the message names none
pub const DEFAULT_DELIMITER: &str = "\n";

/// Body of the message written by check mode
pub const CHECK_MESSAGE_TEXT: &str = "Test message from device";

/// A command request sent by the cloud side
///
/// Only `commands` is required to trigger execution. Messages without it are
/// valid and carry no work for the agent.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub commands: Option<CommandSet>,
    #[serde(default)]
    pub post_id: Option<String>,
    #[serde(default)]
    pub interpreter_delimiter: Option<String>,
    #[serde(default)]
    pub interpreter: Option<String>,
}

impl InboundMessage {
    /// Parse an inbound message body
    pub fn from_slice(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Delimiter to join a command list with
    pub fn delimiter(&self) -> &str {
        self.interpreter_delimiter
            .as_deref()
            .unwrap_or(DEFAULT_DELIMITER)
    }

    /// Interpreter override, treating an empty string as absent
    pub fn interpreter_override(&self) -> Option<&str> {
        self.interpreter.as_deref().filter(|s| !s.is_empty())
    }
}

/// The `commands` field: either one script or a list of command lines
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CommandSet {
    Script(String),
    Lines(Vec<String>),
}

impl CommandSet {
    /// Produce the script text handed to the interpreter
    pub fn join(&self, delimiter: &str) -> String {
        match self {
            CommandSet::Script(script) => script.clone(),
            CommandSet::Lines(lines) => lines.join(delimiter),
        }
    }
}

/// Host health sample sent on every heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct HeartbeatSample {
    pub cpu_usage: f64,
    pub memory_usage: f64,
}

/// Result body used when command output is not structured data
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ErrorWrapper {
    pub error: String,
    pub output: String,
}

impl From<ErrorWrapper> for serde_json::Value {
    fn from(wrapper: ErrorWrapper) -> Self {
        serde_json::json!({
            "error": wrapper.error,
            "output": wrapper.output,
        })
    }
}

/// Connectivity test message written by `--check`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CheckMessage {
    pub test_message: String,
}

impl Default for CheckMessage {
    fn default() -> Self {
        Self {
            test_message: CHECK_MESSAGE_TEXT.into(),
        }
    }
}

/// First frame written by the agent on every connection
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AgentHello {
    pub device_id: String,
    pub org_id: String,
}

//! Command executor - runs a script through an interpreter as a child process

use super::interpreter::Interpreter;
use remote_agent_shared::{CommandSet, ErrorWrapper, InboundMessage};
use serde_json::Value;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Prefix for every output parse error, kept stable for the control plane
const PARSE_ERROR_PREFIX: &str = "Error decoding command output as JSON";

/// One command run, derived from an inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub commands: CommandSet,
    pub post_id: Option<String>,
    pub interpreter_override: Option<String>,
    pub delimiter: String,
}

impl ExecutionRequest {
    /// Build a request; `None` when the message carries no commands
    pub fn from_message(message: InboundMessage) -> Option<Self> {
        let delimiter = message.delimiter().to_string();
        let interpreter_override = message.interpreter_override().map(str::to_string);
        Some(Self {
            commands: message.commands?,
            post_id: message.post_id.filter(|id| !id.is_empty()),
            interpreter_override,
            delimiter,
        })
    }

    /// Script text handed to the interpreter
    pub fn script(&self) -> String {
        self.commands.join(&self.delimiter)
    }
}

/// Output of one command run
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Trimmed stdout
    pub raw_output: String,
    /// Parsed stdout, or an error wrapper
    pub parsed: Value,
    /// Exit code; `None` if the process never started or was killed by a signal
    pub exit_code: Option<i32>,
}

impl ExecutionResult {
    fn spawn_failure(program: &str, err: std::io::Error) -> Self {
        Self {
            raw_output: String::new(),
            parsed: ErrorWrapper {
                error: format!("Failed to start interpreter '{}': {}", program, err),
                output: String::new(),
            }
            .into(),
            exit_code: None,
        }
    }
}

/// Runs scripts as child processes, at most `max_concurrent` at a time
pub struct CommandExecutor {
    permits: Semaphore,
}

impl CommandExecutor {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Semaphore::new(max_concurrent.max(1)),
        }
    }

    /// Run `script` under `interpreter` and capture its output
    ///
    /// Never fails: spawn and parse errors come back as an error wrapper in
    /// [`ExecutionResult::parsed`]. A non-zero exit status is only logged.
    pub async fn execute(
        &self,
        script: &str,
        interpreter: &Interpreter,
        post_url: Option<&str>,
    ) -> ExecutionResult {
        // The semaphore is never closed
        let _permit = self.permits.acquire().await.ok();

        let script = if interpreter.is_powershell() {
            format!("{}{}", powershell_preamble(post_url), script)
        } else {
            script.to_string()
        };

        debug!(
            "Spawning {} (override={}) with {} byte script",
            interpreter.program,
            interpreter.overridden,
            script.len()
        );

        let output = Command::new(&interpreter.program)
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                error!("Failed to start interpreter {}: {}", interpreter.program, e);
                return ExecutionResult::spawn_failure(&interpreter.program, e);
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            warn!("{} wrote to stderr: {}", interpreter.program, stderr.trim());
        }

        let raw_output = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let exit_code = output.status.code();
        info!(
            "Command finished: interpreter={} exit={:?} output_bytes={}",
            interpreter.program,
            exit_code,
            raw_output.len()
        );

        ExecutionResult {
            parsed: parse_output(&raw_output),
            raw_output,
            exit_code,
        }
    }
}

/// Lines prepended to every PowerShell script
///
/// Forces TLS 1.2 and binds `$post_url` so the script can report its own
/// result. Single quotes are doubled to keep the URL inside the literal.
pub fn powershell_preamble(post_url: Option<&str>) -> String {
    let url = post_url.unwrap_or_default().replace('\'', "''");
    format!(
        "[Net.ServicePointManager]::SecurityProtocol = [Net.SecurityProtocolType]::Tls12\n\
         $post_url = '{}'\n",
        url
    )
}

/// Parse trimmed output as a JSON object or array
pub fn parse_output(raw: &str) -> Value {
    let reason = match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => return value,
        Ok(other) => format!(
            "expected a JSON object or array, found {}",
            json_kind(&other)
        ),
        Err(e) => e.to_string(),
    };

    warn!("{}: {}", PARSE_ERROR_PREFIX, reason);
    ErrorWrapper {
        error: format!("{}: {}", PARSE_ERROR_PREFIX, reason),
        output: raw.to_string(),
    }
    .into()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

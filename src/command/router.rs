//! Result router - delivers a finished command's result to the hub or a callback URL

use super::executor::ExecutionResult;
use super::interpreter::Interpreter;
use crate::connection::{fits_in_frame, Outbound};
use anyhow::Result;
use bytes::Bytes;
use remote_agent_shared::{codec::MAX_MESSAGE_SIZE, ErrorWrapper};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Leading bytes of raw output kept when a result is too large to send
const OVERSIZE_PREVIEW_BYTES: usize = 64 * 1024;

/// Where a command's result goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingTarget {
    /// Back over the hub connection
    Transport,
    /// HTTP POST to a control-plane callback
    Callback(String),
}

impl RoutingTarget {
    /// Derive the target from an optional post_id
    pub fn from_post_id(post_id: Option<&str>, engine_host: &str) -> Self {
        match post_id.filter(|id| !id.is_empty()) {
            Some(id) => RoutingTarget::Callback(callback_url(engine_host, id)),
            None => RoutingTarget::Transport,
        }
    }

    /// Callback URL, if any
    pub fn post_url(&self) -> Option<&str> {
        match self {
            RoutingTarget::Callback(url) => Some(url.as_str()),
            RoutingTarget::Transport => None,
        }
    }
}

/// Build the callback URL for a post_id (`a:b` becomes the path `a/b`)
pub fn callback_url(engine_host: &str, post_id: &str) -> String {
    format!(
        "https://{}/webhooks/custom/action/{}",
        engine_host,
        post_id.replace(':', "/")
    )
}

/// What happened to a routed result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Queued on the hub connection
    SentToTransport,
    /// Too large for one frame; an error wrapper was queued in its place
    Oversized { bytes: usize },
    /// POSTed; the status may be a non-2xx the callback rejected
    Posted { status: u16 },
    /// PowerShell posts its own result through `$post_url`
    SelfReported,
    /// The hub connection is gone
    TransportFailed(String),
    /// The POST never got a response
    CallbackFailed(String),
}

/// Sends each result to exactly one destination
pub struct ResultRouter {
    outbound: Outbound,
    http: reqwest::Client,
}

impl ResultRouter {
    pub fn new(outbound: Outbound, callback_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(callback_timeout).build()?;
        Ok(Self { outbound, http })
    }

    /// Deliver `result`; failures are logged and reported, never raised
    pub async fn route(
        &self,
        result: ExecutionResult,
        target: &RoutingTarget,
        interpreter: &Interpreter,
    ) -> RouteOutcome {
        debug!(
            "Routing result (exit={:?}, {} bytes) to {:?}",
            result.exit_code,
            result.raw_output.len(),
            target
        );

        match target {
            RoutingTarget::Transport => self.send_to_transport(&result).await,
            RoutingTarget::Callback(_) if interpreter.is_powershell() => {
                debug!("PowerShell reports its own result, skipping POST");
                RouteOutcome::SelfReported
            }
            RoutingTarget::Callback(url) => self.post(url, &result).await,
        }
    }

    async fn send_to_transport(&self, result: &ExecutionResult) -> RouteOutcome {
        let payload = result.parsed.to_string().into_bytes();

        let (payload, outcome) = if fits_in_frame(payload.len()) {
            (payload, RouteOutcome::SentToTransport)
        } else {
            warn!(
                "Result of {} bytes exceeds the transport limit, sending an error instead",
                payload.len()
            );
            let outcome = RouteOutcome::Oversized {
                bytes: payload.len(),
            };
            (oversize_notice(payload.len(), &result.raw_output), outcome)
        };

        match self.outbound.send(Bytes::from(payload)).await {
            Ok(()) => {
                info!("Result sent over transport");
                outcome
            }
            Err(e) => {
                error!("Failed to send result over transport: {}", e);
                RouteOutcome::TransportFailed(e.to_string())
            }
        }
    }

    async fn post(&self, url: &str, result: &ExecutionResult) -> RouteOutcome {
        info!("Posting result to {}", url);

        let response = match self.http.post(url).json(&result.parsed).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Callback to {} failed: {}", url, e);
                return RouteOutcome::CallbackFailed(e.to_string());
            }
        };

        let status = response.status();
        if status.is_success() {
            info!("Callback accepted: {}", status);
        } else {
            let body = response.text().await.unwrap_or_default();
            warn!("Callback rejected with {}: {}", status, body);
        }

        RouteOutcome::Posted {
            status: status.as_u16(),
        }
    }
}

/// Error wrapper sent in place of a result too large for one frame
fn oversize_notice(bytes: usize, raw_output: &str) -> Vec<u8> {
    let mut end = raw_output.len().min(OVERSIZE_PREVIEW_BYTES);
    while !raw_output.is_char_boundary(end) {
        end -= 1;
    }

    let wrapper = ErrorWrapper {
        error: format!(
            "Result exceeds transport limit: {} bytes (max: {})",
            bytes, MAX_MESSAGE_SIZE
        ),
        output: raw_output[..end].to_string(),
    };
    serde_json::Value::from(wrapper).to_string().into_bytes()
}

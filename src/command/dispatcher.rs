//! Command dispatcher - turns inbound hub messages into tracked execution tasks

use super::executor::{CommandExecutor, ExecutionRequest};
use super::interpreter::{self, Platform};
use super::router::{ResultRouter, RouteOutcome, RoutingTarget};
use remote_agent_shared::InboundMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// What `dispatch` did with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A task was started for the commands
    Spawned,
    /// Valid message with nothing to run
    NoCommands,
    /// Not a JSON object
    Malformed,
}

/// Runs each command request on its own task
pub struct Dispatcher {
    platform: Platform,
    engine_host: String,
    executor: Arc<CommandExecutor>,
    router: Arc<ResultRouter>,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        platform: Platform,
        engine_host: impl Into<String>,
        executor: Arc<CommandExecutor>,
        router: Arc<ResultRouter>,
    ) -> Self {
        Self {
            platform,
            engine_host: engine_host.into(),
            executor,
            router,
            tracker: TaskTracker::new(),
        }
    }

    /// Handle one inbound message without waiting for its commands to finish
    pub fn dispatch(&self, payload: &[u8]) -> DispatchOutcome {
        let message = match InboundMessage::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed message ({} bytes): {}", payload.len(), e);
                return DispatchOutcome::Malformed;
            }
        };

        let Some(request) = ExecutionRequest::from_message(message) else {
            debug!("Message has no commands, nothing to run");
            return DispatchOutcome::NoCommands;
        };

        info!(
            "Dispatching commands (post_id={:?}, interpreter={:?})",
            request.post_id, request.interpreter_override
        );

        let platform = self.platform;
        let engine_host = self.engine_host.clone();
        let executor = self.executor.clone();
        let router = self.router.clone();

        // A panic in one run must not take the agent down
        let job = tokio::spawn(async move {
            run_request(request, platform, &engine_host, &executor, &router).await
        });
        self.tracker.spawn(async move {
            if let Err(e) = job.await {
                error!("Command task failed: {}", e);
            }
        });

        DispatchOutcome::Spawned
    }

    /// Number of command tasks still running
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting work and wait up to `grace` for running commands
    ///
    /// Returns false if the grace period ran out first.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        let remaining = self.tracker.len();
        if remaining > 0 {
            info!("Waiting for {} running command(s)", remaining);
        }

        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    "{} command(s) still running after {:?}, abandoning",
                    self.tracker.len(),
                    grace
                );
                false
            }
        }
    }
}

async fn run_request(
    request: ExecutionRequest,
    platform: Platform,
    engine_host: &str,
    executor: &CommandExecutor,
    router: &ResultRouter,
) -> RouteOutcome {
    let interpreter = interpreter::resolve(platform, request.interpreter_override.as_deref());
    let target = RoutingTarget::from_post_id(request.post_id.as_deref(), engine_host);

    let result = executor
        .execute(&request.script(), &interpreter, target.post_url())
        .await;

    let outcome = router.route(result, &target, &interpreter).await;
    debug!("Command run complete: {:?}", outcome);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use bytes::Bytes;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    fn dispatcher(platform: Platform) -> (Dispatcher, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(16);
        let router = ResultRouter::new(Outbound::new(tx), Duration::from_secs(5)).unwrap();
        let dispatcher = Dispatcher::new(
            platform,
            "h.example.com",
            Arc::new(CommandExecutor::new(4)),
            Arc::new(router),
        );
        (dispatcher, rx)
    }

    async fn next_payload(rx: &mut mpsc::Receiver<Bytes>) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for result")
            .expect("channel closed");
        serde_json::from_slice(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_message_without_commands_is_ignored() {
        let (dispatcher, mut rx) = dispatcher(Platform::Unix);

        assert_eq!(
            dispatcher.dispatch(br#"{"post_id": "a:b"}"#),
            DispatchOutcome::NoCommands
        );
        assert!(dispatcher.shutdown(Duration::from_secs(1)).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_message_is_ignored() {
        let (dispatcher, mut rx) = dispatcher(Platform::Unix);

        assert_eq!(dispatcher.dispatch(b"not json"), DispatchOutcome::Malformed);
        assert_eq!(dispatcher.dispatch(b"[1, 2, 3]"), DispatchOutcome::Malformed);
        assert_eq!(dispatcher.in_flight(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_json_result_sent_over_transport() {
        let (dispatcher, mut rx) = dispatcher(Platform::Unix);

        let outcome = dispatcher.dispatch(
            br#"{"commands": ["echo '{\"a\": 1}'"], "interpreter": "/bin/sh"}"#,
        );
        assert_eq!(outcome, DispatchOutcome::Spawned);
        assert_eq!(next_payload(&mut rx).await, json!({"a": 1}));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_plain_output_uses_default_shell() {
        let (dispatcher, mut rx) = dispatcher(Platform::Unix);

        dispatcher.dispatch(br#"{"commands": ["echo 1"]}"#);
        let payload = next_payload(&mut rx).await;

        assert_eq!(payload["output"], "1");
        assert!(payload["error"]
            .as_str()
            .unwrap()
            .starts_with("Error decoding command output as JSON"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_joined_with_custom_delimiter() {
        let (dispatcher, mut rx) = dispatcher(Platform::Unix);

        dispatcher.dispatch(
            br#"{"commands": ["X=5", "echo \"{\\\"x\\\": $X}\""], "interpreter_delimiter": ";", "interpreter": "/bin/sh"}"#,
        );
        assert_eq!(next_payload(&mut rx).await, json!({"x": 5}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_waits_for_running_commands() {
        let (dispatcher, mut rx) = dispatcher(Platform::Unix);

        dispatcher.dispatch(br#"{"commands": "sleep 0.2; echo '{}'", "interpreter": "/bin/sh"}"#);
        assert_eq!(dispatcher.in_flight(), 1);

        assert!(dispatcher.shutdown(Duration::from_secs(5)).await);
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(next_payload(&mut rx).await, json!({}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_gives_up_after_grace() {
        let (dispatcher, _rx) = dispatcher(Platform::Unix);

        dispatcher.dispatch(br#"{"commands": "sleep 5", "interpreter": "/bin/sh"}"#);
        assert!(!dispatcher.shutdown(Duration::from_millis(100)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_run_does_not_affect_others() {
        let (dispatcher, mut rx) = dispatcher(Platform::Unix);

        dispatcher.dispatch(br#"{"commands": "ls", "interpreter": "/nonexistent/shell"}"#);
        dispatcher.dispatch(br#"{"commands": "echo '[\"ok\"]'", "interpreter": "/bin/sh"}"#);

        let mut payloads = vec![next_payload(&mut rx).await, next_payload(&mut rx).await];
        payloads.sort_by_key(|p| p.is_array());

        assert!(payloads[0]["error"]
            .as_str()
            .unwrap()
            .starts_with("Failed to start interpreter"));
        assert_eq!(payloads[1], json!(["ok"]));
    }
}

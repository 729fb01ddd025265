//! Heartbeat loop

use super::sampler::MetricsSampler;
use crate::connection::Outbound;
use anyhow::Result;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sends a health sample, then waits `interval`, until cancelled
pub struct HeartbeatTask<S> {
    sampler: S,
    outbound: Outbound,
    interval: Duration,
}

impl<S: MetricsSampler> HeartbeatTask<S> {
    pub fn new(sampler: S, outbound: Outbound, interval: Duration) -> Self {
        Self {
            sampler,
            outbound,
            interval,
        }
    }

    /// Take one sample and queue it for the hub
    pub async fn beat(&self) -> Result<()> {
        let sample = self.sampler.sample().await?;
        debug!(
            "Heartbeat: cpu={:.1}% memory={:.1}%",
            sample.cpu_usage, sample.memory_usage
        );
        self.outbound.send_json(&sample).await
    }

    /// Run until `cancel` fires; a failed beat is logged and the loop goes on
    pub async fn run(self, cancel: CancellationToken) {
        info!("Heartbeat started (every {:?})", self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.beat() => {
                    if let Err(e) = result {
                        warn!("Heartbeat failed: {}", e);
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Heartbeat stopped");
    }
}

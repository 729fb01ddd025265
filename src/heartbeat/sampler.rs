//! Host resource sampling

use anyhow::{Context, Result};
use async_trait::async_trait;
use remote_agent_shared::HeartbeatSample;
use std::time::Duration;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

/// Source of heartbeat samples
#[async_trait]
pub trait MetricsSampler: Send + Sync + 'static {
    async fn sample(&self) -> Result<HeartbeatSample>;
}

/// Samples the local host through `sysinfo`
///
/// CPU usage is measured across `window`, so each sample takes at least that
/// long. The work runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct SystemSampler {
    window: Duration,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window: window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsSampler for SystemSampler {
    async fn sample(&self) -> Result<HeartbeatSample> {
        let window = self.window;
        tokio::task::spawn_blocking(move || measure(window))
            .await
            .context("Resource sampling task failed")
    }
}

fn measure(window: Duration) -> HeartbeatSample {
    let mut sys = System::new_with_specifics(
        RefreshKind::new()
            .with_cpu(CpuRefreshKind::new().with_cpu_usage())
            .with_memory(MemoryRefreshKind::new().with_ram()),
    );

    // CPU usage is the delta between two refreshes
    std::thread::sleep(window);
    sys.refresh_cpu();
    sys.refresh_memory();

    let cpu = sys.global_cpu_info().cpu_usage() as f64;
    let memory = match sys.total_memory() {
        0 => 0.0,
        total => sys.used_memory() as f64 / total as f64 * 100.0,
    };

    HeartbeatSample {
        cpu_usage: round_percent(cpu),
        memory_usage: round_percent(memory),
    }
}

/// Clamp to 0..=100 and round to one decimal place
fn round_percent(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    (value.clamp(0.0, 100.0) * 10.0).round() / 10.0
}

//! Periodic health heartbeat
//!
//! Samples host CPU and memory utilization and reports it over the hub
//! connection on a fixed interval, starting immediately at startup.

mod sampler;
mod task;

pub use sampler::SystemSampler;
pub use task::HeartbeatTask;

//! Tuning knobs for the scheduler, callback router, and liveness manager.
//!
//! `gridflow-cli` overrides these defaults via the CLI-flag > env var >
//! config-file > default chain.

use std::time::Duration;

/// Scheduler/TCR/WLM tuning surface.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long a worker may go without heartbeating before WLM marks it
    /// `FAILED` and re-queues its in-flight task.
    pub heartbeat_timeout: Duration,
    /// How long a flow-run may sit `RUNNING` with no task transitions before
    /// the stuck-flow-run sweep marks it `FAILED`.
    pub progress_timeout: Duration,
    /// Bus redelivery cap applied to every consumer this crate creates.
    pub max_deliver: i64,
    /// Bus ack-wait applied to every consumer this crate creates.
    pub ack_wait: Duration,
    /// `max_retries` applied to a flow-run or task when the caller omits it.
    pub default_max_retries: i32,
    /// How often the WLM sweeper scans for stale workers.
    pub liveness_sweep_interval: Duration,
    /// How often the stuck-flow-run sweep runs.
    pub progress_sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(60),
            progress_timeout: Duration::from_secs(60 * 60),
            max_deliver: 3,
            ack_wait: Duration::from_secs(30),
            default_max_retries: 3,
            liveness_sweep_interval: Duration::from_secs(15),
            progress_sweep_interval: Duration::from_secs(60),
        }
    }
}

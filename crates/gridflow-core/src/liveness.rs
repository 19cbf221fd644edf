//! Worker Liveness Manager: tracks `worker.heartbeat.*` and periodically
//! fails workers that have gone quiet.
//!
//! The heartbeat-consume half and the sweep half are independent loops --
//! one event-driven, one timer-driven -- rather than interleaving both
//! concerns in one function.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use gridflow_bus::{subjects, EventBus};
use gridflow_db::queries::{flow_task_runs, worker_heartbeats};
use sqlx::PgPool;

use crate::config::SchedulerConfig;
use crate::error::{CoreError, Result};
use crate::events;
use crate::messages::{FlowRunExecuteMessage, WorkerHeartbeatMessage};
use crate::streams::consumers;

pub struct LivenessManager {
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    config: SchedulerConfig,
}

impl LivenessManager {
    pub fn new(pool: PgPool, bus: Arc<dyn EventBus>, config: SchedulerConfig) -> Self {
        Self { pool, bus, config }
    }

    pub async fn handle_heartbeat(&self, msg: WorkerHeartbeatMessage) -> Result<()> {
        worker_heartbeats::upsert_heartbeat(
            &self.pool,
            &msg.worker_id,
            &msg.worker_name,
            msg.status,
            &msg.worker_info.to_json(),
        )
        .await?;
        Ok(())
    }

    /// Consumes `worker.heartbeat.*` until cancelled.
    pub async fn run_heartbeat_consumer(&self, cancel: CancellationToken) -> Result<()> {
        let mut stream = self
            .bus
            .subscribe(
                subjects::streams::WORKER_HEARTBEAT,
                consumers::LIVENESS_HEARTBEAT,
            )
            .await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                delivered = stream.next() => {
                    let Some(delivered) = delivered else { return Ok(()) };
                    let outcome = match serde_json::from_slice::<WorkerHeartbeatMessage>(&delivered.payload) {
                        Ok(msg) => self.handle_heartbeat(msg).await,
                        Err(e) => Err(CoreError::Validation(e.to_string())),
                    };
                    match outcome {
                        Ok(()) => {
                            let _ = delivered.ack.ack().await;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "heartbeat handling failed, nak for redelivery");
                            let _ = delivered.ack.nak(None).await;
                        }
                    }
                }
            }
        }
    }

    /// Finds workers whose last heartbeat predates `heartbeat_timeout`,
    /// marks them `FAILED`, and resets any task-run they had claimed back
    /// to `PENDING` without burning its retry budget -- a dead worker is an
    /// operational failure, not a logical one.
    pub async fn sweep_stale_workers(&self) -> Result<usize> {
        let stale = worker_heartbeats::list_stale_workers(
            &self.pool,
            self.config.heartbeat_timeout.as_secs() as i64,
        )
        .await?;

        for worker in &stale {
            let rows = worker_heartbeats::mark_worker_failed(&self.pool, &worker.worker_id).await?;
            if rows == 0 {
                // Another sweeper replica already failed this worker.
                continue;
            }

            if let Some((flow_run_id, task_name)) = parse_current_task_ref(&worker.worker_info) {
                let reset_rows = flow_task_runs::reset_task_run_for_liveness(
                    &self.pool,
                    flow_run_id,
                    &task_name,
                )
                .await?;

                if reset_rows > 0 {
                    events::task_run_status(
                        &self.pool,
                        flow_run_id,
                        &task_name,
                        "running",
                        "pending",
                        gridflow_db::models::EventSource::Scheduler,
                        Some("worker liveness lost"),
                    )
                    .await;
                    self.trigger_execute(flow_run_id).await?;
                }
            }
        }

        Ok(stale.len())
    }

    async fn trigger_execute(&self, flow_run_id: uuid::Uuid) -> Result<()> {
        let msg = FlowRunExecuteMessage { flow_run_id };
        let payload = serde_json::to_vec(&msg).map_err(|e| CoreError::Other(e.into()))?;
        self.bus.publish(subjects::FLOW_RUN_EXECUTE, payload).await?;
        Ok(())
    }

    /// Runs [`Self::sweep_stale_workers`] on `config.liveness_sweep_interval`
    /// until cancelled.
    pub async fn run_sweep(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.liveness_sweep_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    if let Err(err) = self.sweep_stale_workers().await {
                        tracing::warn!(error = %err, "worker liveness sweep failed");
                    }
                }
            }
        }
    }
}

/// Extracts `(flow_run_id, task_name)` from a worker's `worker_info` JSON
/// blob, if it has a `current_task_ref`. Tolerant of a missing or
/// malformed field -- a worker between tasks has none.
fn parse_current_task_ref(worker_info: &serde_json::Value) -> Option<(uuid::Uuid, String)> {
    let task_ref = worker_info.get("current_task_ref")?.as_object()?;
    let flow_run_id = task_ref
        .get("flow_run_id")?
        .as_str()?
        .parse::<uuid::Uuid>()
        .ok()?;
    let task_name = task_ref.get("task_name")?.as_str()?.to_string();
    Some((flow_run_id, task_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_well_formed_task_ref() {
        let flow_run_id = uuid::Uuid::new_v4();
        let info = json!({
            "engines": ["process"],
            "current_task_ref": { "flow_run_id": flow_run_id.to_string(), "task_name": "fetch" }
        });
        let (parsed_id, task_name) = parse_current_task_ref(&info).unwrap();
        assert_eq!(parsed_id, flow_run_id);
        assert_eq!(task_name, "fetch");
    }

    #[test]
    fn returns_none_when_task_ref_absent() {
        assert!(parse_current_task_ref(&json!({"engines": []})).is_none());
    }

    #[test]
    fn returns_none_on_malformed_uuid() {
        let info = json!({"current_task_ref": {"flow_run_id": "not-a-uuid", "task_name": "x"}});
        assert!(parse_current_task_ref(&info).is_none());
    }
}

//! Task Callback Router: consumes `task.status.*` from
//! workers, updates task-run state, and re-triggers the scheduler's drive
//! loop.
//!
//! The dedup guard and the RUNNING-is-optional ordering rule are the two
//! invariants that make this safe under at-least-once delivery; both are
//! checked against the task-run row fetched once at the top of
//! [`CallbackRouter::handle_task_status`], a "read current state, then
//! decide" shape before issuing the conditional `UPDATE`.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gridflow_bus::{subjects, EventBus};
use gridflow_cache::ResultBlobStore;
use gridflow_db::models::{EventSource, TaskRunStatus};
use gridflow_db::queries::flow_task_runs;
use sqlx::PgPool;

use crate::error::{CoreError, Result};
use crate::events;
use crate::messages::{FlowRunExecuteMessage, TaskStatusMessage};
use crate::streams::consumers;

/// Deterministic result-cache key for a task's output, matching the
/// `result_cache/<flow_run_id>/<task_name>.json` layout.
pub fn cache_key(flow_run_id: Uuid, task_name: &str) -> String {
    format!("result_cache/{flow_run_id}/{task_name}.json")
}

pub struct CallbackRouter {
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    cache: Arc<dyn ResultBlobStore>,
}

impl CallbackRouter {
    pub fn new(pool: PgPool, bus: Arc<dyn EventBus>, cache: Arc<dyn ResultBlobStore>) -> Self {
        Self { pool, bus, cache }
    }

    pub async fn handle_task_status(&self, msg: TaskStatusMessage) -> Result<()> {
        let current =
            flow_task_runs::get_task_run(&self.pool, msg.flow_run_id, &msg.task_name).await?;

        if msg.attempt < current.retry_count + 1 {
            tracing::debug!(
                flow_run_id = %msg.flow_run_id,
                task_name = %msg.task_name,
                attempt = msg.attempt,
                current_retry_count = current.retry_count,
                "dropping stale task.status redelivery"
            );
            return Ok(());
        }

        match msg.status {
            TaskRunStatus::Running => {
                let rows = flow_task_runs::transition_task_run_running(
                    &self.pool,
                    msg.flow_run_id,
                    &msg.task_name,
                )
                .await?;
                if rows > 0 {
                    events::task_run_status(
                        &self.pool,
                        msg.flow_run_id,
                        &msg.task_name,
                        "pending",
                        "running",
                        EventSource::Worker,
                        None,
                    )
                    .await;
                }
                Ok(())
            }
            TaskRunStatus::Success => {
                self.handle_terminal(&msg, TaskRunStatus::Success).await
            }
            TaskRunStatus::Failed => self.handle_failed(&msg, &current).await,
            TaskRunStatus::Canceled => self.handle_terminal(&msg, TaskRunStatus::Canceled).await,
            TaskRunStatus::Pending => {
                // Workers never report PENDING; ignore rather than error so
                // a misbehaving worker can't wedge the task-run.
                Ok(())
            }
        }
    }

    async fn handle_terminal(&self, msg: &TaskStatusMessage, status: TaskRunStatus) -> Result<()> {
        let cache_key = self.resolve_cache_key(msg).await?;

        flow_task_runs::record_task_status(
            &self.pool,
            msg.flow_run_id,
            &msg.task_name,
            status,
            msg.result_inline.as_ref(),
            cache_key.as_deref(),
            msg.error.as_deref(),
        )
        .await?;

        events::task_run_status(
            &self.pool,
            msg.flow_run_id,
            &msg.task_name,
            "running",
            &status.to_string(),
            EventSource::Worker,
            msg.error.as_deref(),
        )
        .await;

        self.trigger_execute(msg.flow_run_id).await
    }

    /// A `FAILED` with retry budget remaining resets the task to `PENDING`
    /// for the drive loop to re-dispatch, rather than recording a terminal
    /// status.
    async fn handle_failed(
        &self,
        msg: &TaskStatusMessage,
        current: &gridflow_db::models::FlowTaskRun,
    ) -> Result<()> {
        if current.retry_count < current.max_retries {
            match flow_task_runs::retry_task_run(&self.pool, msg.flow_run_id, &msg.task_name).await
            {
                Ok(_) => {
                    events::task_run_status(
                        &self.pool,
                        msg.flow_run_id,
                        &msg.task_name,
                        "running",
                        "pending",
                        EventSource::Worker,
                        msg.error.as_deref(),
                    )
                    .await;
                    self.trigger_execute(msg.flow_run_id).await
                }
                Err(gridflow_db::Error::Conflict(detail)) => Err(CoreError::Conflict(detail)),
                Err(e) => Err(e.into()),
            }
        } else {
            self.handle_terminal(msg, TaskRunStatus::Failed).await
        }
    }

    /// If the worker inlined its result but didn't supply a cache key,
    /// write the result into the shared cache ourselves so dependents can
    /// still resolve it the same way regardless of which path produced it.
    async fn resolve_cache_key(&self, msg: &TaskStatusMessage) -> Result<Option<String>> {
        if msg.result_cache_key.is_some() {
            return Ok(msg.result_cache_key.clone());
        }
        let Some(result) = &msg.result_inline else {
            return Ok(None);
        };
        self.cache.put(msg.flow_run_id, &msg.task_name, result).await?;
        Ok(Some(cache_key(msg.flow_run_id, &msg.task_name)))
    }

    async fn trigger_execute(&self, flow_run_id: Uuid) -> Result<()> {
        let msg = FlowRunExecuteMessage { flow_run_id };
        let payload = serde_json::to_vec(&msg).map_err(|e| CoreError::Other(e.into()))?;
        self.bus.publish(subjects::FLOW_RUN_EXECUTE, payload).await?;
        Ok(())
    }

    /// Consumes `task.status.*` until cancelled.
    pub async fn run_consumer(&self, cancel: CancellationToken) -> Result<()> {
        let mut stream = self
            .bus
            .subscribe(subjects::streams::TASK_STATUS, consumers::CALLBACK_TASK_STATUS)
            .await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                delivered = stream.next() => {
                    let Some(delivered) = delivered else { return Ok(()) };
                    let outcome = match serde_json::from_slice::<TaskStatusMessage>(&delivered.payload) {
                        Ok(msg) => self.handle_task_status(msg).await,
                        Err(e) => Err(CoreError::Validation(e.to_string())),
                    };
                    match outcome {
                        Ok(()) => {
                            let _ = delivered.ack.ack().await;
                        }
                        Err(e) if e.is_conflict() => {
                            tracing::debug!(error = %e, "treating conflict as already handled");
                            let _ = delivered.ack.ack().await;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "task.status handling failed, nak for redelivery");
                            let _ = delivered.ack.nak(None).await;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_matches_the_documented_layout() {
        let flow_run_id = Uuid::new_v4();
        let key = cache_key(flow_run_id, "fetch");
        assert_eq!(key, format!("result_cache/{flow_run_id}/fetch.json"));
    }
}

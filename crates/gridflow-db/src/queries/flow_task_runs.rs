//! Database query functions for the `flow_task_runs` table.
//!
//! The task DAG itself (dependency edges, entrypoints) lives in the flow
//! definition materialized by `gridflow-core`, not in this table -- a
//! `FlowTaskRun` row only ever records one task's attempt history. Ready-set
//! computation therefore combines [`list_task_runs_for_flow_run`] with the
//! in-memory DAG, rather than living as a SQL join here.

use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{FlowTaskRun, TaskRunStatus};
use crate::{Error, Result};

/// Insert one `PENDING` row per task, called once a flow-run transitions to
/// `RUNNING` and its task graph has been materialized.
pub async fn insert_pending_task_runs(
    pool: &PgPool,
    flow_run_id: Uuid,
    tasks: &[(String, i32)],
) -> Result<Vec<FlowTaskRun>> {
    let mut inserted = Vec::with_capacity(tasks.len());
    for (task_name, max_retries) in tasks {
        let row = sqlx::query_as::<_, FlowTaskRun>(
            "INSERT INTO flow_task_runs (flow_run_id, task_name, status, retry_count, max_retries) \
             VALUES ($1, $2, 'pending', 0, $3) \
             RETURNING *",
        )
        .bind(flow_run_id)
        .bind(task_name)
        .bind(max_retries)
        .fetch_one(pool)
        .await?;
        inserted.push(row);
    }
    Ok(inserted)
}

/// Fetch a single task-run row.
pub async fn get_task_run(pool: &PgPool, flow_run_id: Uuid, task_name: &str) -> Result<FlowTaskRun> {
    sqlx::query_as::<_, FlowTaskRun>(
        "SELECT * FROM flow_task_runs WHERE flow_run_id = $1 AND task_name = $2",
    )
    .bind(flow_run_id)
    .bind(task_name)
    .fetch_optional(pool)
    .await?
    .ok_or(Error::NotFound)
}

/// List every task-run row for a flow-run.
pub async fn list_task_runs_for_flow_run(pool: &PgPool, flow_run_id: Uuid) -> Result<Vec<FlowTaskRun>> {
    let rows = sqlx::query_as::<_, FlowTaskRun>(
        "SELECT * FROM flow_task_runs WHERE flow_run_id = $1 ORDER BY task_name ASC",
    )
    .bind(flow_run_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// `PENDING -> RUNNING`, on the worker's first claim. A second claim (stale
/// redelivery) is a conflict, not an error the caller should surface.
pub async fn transition_task_run_running(
    pool: &PgPool,
    flow_run_id: Uuid,
    task_name: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE flow_task_runs \
         SET status = 'running', started_at = COALESCE(started_at, NOW()) \
         WHERE flow_run_id = $1 AND task_name = $2 AND status = 'pending'",
    )
    .bind(flow_run_id)
    .bind(task_name)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Record a terminal (`SUCCESS`/`FAILED`/`CANCELED`) status for a task-run
/// and reflect it into the parent flow-run's `task_statuses` /
/// `success_task_results` columns, all inside one transaction.
///
/// Replaying an already-terminal status for the same task is a no-op: the
/// function checks the current status first and returns the existing row
/// unchanged rather than re-applying the update or emitting a duplicate
/// side effect, since a redelivered terminal status must never be applied
/// twice.
pub async fn record_task_status(
    pool: &PgPool,
    flow_run_id: Uuid,
    task_name: &str,
    new_status: TaskRunStatus,
    result: Option<&serde_json::Value>,
    result_cache_key: Option<&str>,
    error_message: Option<&str>,
) -> Result<FlowTaskRun> {
    let mut tx = pool.begin().await?;

    let current = sqlx::query_as::<_, FlowTaskRun>(
        "SELECT * FROM flow_task_runs WHERE flow_run_id = $1 AND task_name = $2 FOR UPDATE",
    )
    .bind(flow_run_id)
    .bind(task_name)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(Error::NotFound)?;

    if current.status == new_status && is_terminal(new_status) {
        tx.commit().await?;
        return Ok(current);
    }

    let updated = sqlx::query_as::<_, FlowTaskRun>(
        "UPDATE flow_task_runs \
         SET status = $1, \
             result = $2, \
             result_cache_key = $3, \
             error_message = $4, \
             started_at = COALESCE(started_at, NOW()), \
             finished_at = NOW(), \
             duration_seconds = EXTRACT(EPOCH FROM (NOW() - COALESCE(started_at, NOW()))) \
         WHERE flow_run_id = $5 AND task_name = $6 \
         RETURNING *",
    )
    .bind(new_status)
    .bind(result)
    .bind(result_cache_key)
    .bind(error_message)
    .bind(flow_run_id)
    .bind(task_name)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE flow_runs \
         SET task_statuses = jsonb_set(task_statuses, $1, to_jsonb($2::text)) \
         WHERE flow_run_id = $3",
    )
    .bind(vec![task_name])
    .bind(new_status.to_string())
    .bind(flow_run_id)
    .execute(&mut *tx)
    .await?;

    if let Some(cache_key) = result_cache_key {
        sqlx::query(
            "UPDATE flow_runs \
             SET success_task_results = jsonb_set(success_task_results, $1, to_jsonb($2::text)) \
             WHERE flow_run_id = $3",
        )
        .bind(vec![task_name])
        .bind(cache_key)
        .bind(flow_run_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(updated)
}

fn is_terminal(status: TaskRunStatus) -> bool {
    matches!(
        status,
        TaskRunStatus::Success | TaskRunStatus::Failed | TaskRunStatus::Canceled
    )
}

/// `RUNNING -> PENDING` on a retryable worker failure. Increments
/// `retry_count`; the next drive-loop iteration re-dispatches the task.
pub async fn retry_task_run(pool: &PgPool, flow_run_id: Uuid, task_name: &str) -> Result<FlowTaskRun> {
    let retried = sqlx::query_as::<_, FlowTaskRun>(
        "UPDATE flow_task_runs \
         SET status = 'pending', \
             retry_count = retry_count + 1, \
             started_at = NULL, \
             finished_at = NULL \
         WHERE flow_run_id = $1 AND task_name = $2 AND status = 'running' \
         RETURNING *",
    )
    .bind(flow_run_id)
    .bind(task_name)
    .fetch_optional(pool)
    .await?;

    retried.ok_or_else(|| {
        Error::Conflict(format!(
            "task_run {flow_run_id}/{task_name} not in running state"
        ))
    })
}

/// `RUNNING -> PENDING` on worker liveness loss (WLM sweep). Unlike
/// [`retry_task_run`], this does not increment `retry_count`: an
/// operational failure (the worker died) is not a logical failure of the
/// task, so it must not burn the task's retry budget.
pub async fn reset_task_run_for_liveness(
    pool: &PgPool,
    flow_run_id: Uuid,
    task_name: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE flow_task_runs \
         SET status = 'pending', started_at = NULL \
         WHERE flow_run_id = $1 AND task_name = $2 AND status = 'running'",
    )
    .bind(flow_run_id)
    .bind(task_name)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Mark every `PENDING` task-run for a flow-run `CANCELED`, used when a
/// `TaskCancelEvent` arrives.
pub async fn cancel_pending_task_runs(pool: &PgPool, flow_run_id: Uuid) -> Result<Vec<FlowTaskRun>> {
    let canceled = sqlx::query_as::<_, FlowTaskRun>(
        "UPDATE flow_task_runs \
         SET status = 'canceled', finished_at = NOW() \
         WHERE flow_run_id = $1 AND status = 'pending' \
         RETURNING *",
    )
    .bind(flow_run_id)
    .fetch_all(pool)
    .await?;

    Ok(canceled)
}

/// Reset every task-run row for a flow-run back to `PENDING` with a clean
/// attempt history, used by a flow-run-level retry: unlike the per-task
/// retry in `record_task_status`, a flow-level retry re-executes the whole
/// graph from scratch.
pub async fn reset_task_runs_for_retry(pool: &PgPool, flow_run_id: Uuid) -> Result<Vec<FlowTaskRun>> {
    let reset = sqlx::query_as::<_, FlowTaskRun>(
        "UPDATE flow_task_runs \
         SET status = 'pending', \
             result = NULL, \
             result_cache_key = NULL, \
             error_message = NULL, \
             started_at = NULL, \
             finished_at = NULL, \
             duration_seconds = NULL, \
             retry_count = 0 \
         WHERE flow_run_id = $1 \
         RETURNING *",
    )
    .bind(flow_run_id)
    .fetch_all(pool)
    .await?;

    Ok(reset)
}

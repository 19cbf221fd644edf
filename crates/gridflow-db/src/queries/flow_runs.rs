//! Database query functions for the `flow_runs` table.
//!
//! State transitions follow the `transition_task_status` pattern: a single
//! `UPDATE ... WHERE status = $from` whose `rows_affected()` distinguishes
//! "transitioned" from "lost the race or already elsewhere" -- callers map
//! zero rows into [`Error::Conflict`] rather than retrying blindly.

use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{FlowEngine, FlowRun, FlowRunStatus};
use crate::{Error, Result};

/// Insert a new flow-run in `scheduled` status.
///
/// `request_id`, when present, carries a unique constraint at the database
/// level: a second insert with the same `request_id` fails with a unique
/// violation, which is surfaced here as [`Error::Conflict`] so an
/// at-least-once caller can treat the duplicate as "already accepted".
pub async fn insert_flow_run_request(
    pool: &PgPool,
    flow_id: Uuid,
    request_id: Option<&str>,
    user_id: Option<&str>,
    parameters: &serde_json::Value,
    engine: FlowEngine,
    max_retries: i32,
) -> Result<FlowRun> {
    let result = sqlx::query_as::<_, FlowRun>(
        "INSERT INTO flow_runs \
            (flow_id, request_id, user_id, parameters, status, engine, \
             task_statuses, success_task_results, retry_count, max_retries) \
         VALUES ($1, $2, $3, $4, 'scheduled', $5, '{}'::jsonb, '{}'::jsonb, 0, $6) \
         RETURNING *",
    )
    .bind(flow_id)
    .bind(request_id)
    .bind(user_id)
    .bind(parameters)
    .bind(engine)
    .bind(max_retries)
    .fetch_one(pool)
    .await;

    match result {
        Ok(flow_run) => Ok(flow_run),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(
            Error::Conflict(format!("duplicate request_id {request_id:?}")),
        ),
        Err(e) => Err(e.into()),
    }
}

/// Fetch a single flow-run by ID.
pub async fn get_flow_run(pool: &PgPool, flow_run_id: Uuid) -> Result<FlowRun> {
    sqlx::query_as::<_, FlowRun>("SELECT * FROM flow_runs WHERE flow_run_id = $1")
        .bind(flow_run_id)
        .fetch_optional(pool)
        .await?
        .ok_or(Error::NotFound)
}

/// Conditionally transition `SCHEDULED -> PENDING`. Fails with
/// [`Error::Conflict`] if the row is already beyond `SCHEDULED` -- the
/// canonical "claim" operation that makes `claim_flow_run_for_execution`
/// idempotent across scheduler replicas.
pub async fn claim_flow_run_for_execution(pool: &PgPool, flow_run_id: Uuid) -> Result<FlowRun> {
    let claimed = sqlx::query_as::<_, FlowRun>(
        "UPDATE flow_runs SET status = 'pending' \
         WHERE flow_run_id = $1 AND status = 'scheduled' \
         RETURNING *",
    )
    .bind(flow_run_id)
    .fetch_optional(pool)
    .await?;

    claimed.ok_or_else(|| Error::Conflict(format!("flow_run {flow_run_id} not in scheduled state")))
}

/// Transition `PENDING -> RUNNING`, setting `started_at` if unset.
pub async fn start_flow_run(pool: &PgPool, flow_run_id: Uuid) -> Result<FlowRun> {
    let started = sqlx::query_as::<_, FlowRun>(
        "UPDATE flow_runs \
         SET status = 'running', started_at = COALESCE(started_at, NOW()) \
         WHERE flow_run_id = $1 AND status = 'pending' \
         RETURNING *",
    )
    .bind(flow_run_id)
    .fetch_optional(pool)
    .await?;

    started.ok_or_else(|| Error::Conflict(format!("flow_run {flow_run_id} not in pending state")))
}

/// Merge `statuses` into the flow-run's `task_statuses` json map.
pub async fn upsert_task_statuses(
    pool: &PgPool,
    flow_run_id: Uuid,
    statuses: &serde_json::Value,
) -> Result<()> {
    sqlx::query("UPDATE flow_runs SET task_statuses = task_statuses || $1 WHERE flow_run_id = $2")
        .bind(statuses)
        .bind(flow_run_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Transition `RUNNING -> {SUCCESS, FAILED}`, setting `finished_at`.
pub async fn complete_flow_run(
    pool: &PgPool,
    flow_run_id: Uuid,
    final_status: FlowRunStatus,
    error_message: Option<&str>,
) -> Result<FlowRun> {
    debug_assert!(matches!(
        final_status,
        FlowRunStatus::Success | FlowRunStatus::Failed
    ));

    let completed = sqlx::query_as::<_, FlowRun>(
        "UPDATE flow_runs \
         SET status = $1, error_message = $2, finished_at = NOW() \
         WHERE flow_run_id = $3 AND status = 'running' \
         RETURNING *",
    )
    .bind(final_status)
    .bind(error_message)
    .bind(flow_run_id)
    .fetch_optional(pool)
    .await?;

    completed.ok_or_else(|| Error::Conflict(format!("flow_run {flow_run_id} not in running state")))
}

/// Transition `FAILED -> SCHEDULED` iff `retry_count < max_retries`;
/// increments `retry_count` and clears `started_at`/`finished_at`.
pub async fn schedule_retry(pool: &PgPool, flow_run_id: Uuid) -> Result<FlowRun> {
    let retried = sqlx::query_as::<_, FlowRun>(
        "UPDATE flow_runs \
         SET status = 'scheduled', \
             retry_count = retry_count + 1, \
             started_at = NULL, \
             finished_at = NULL, \
             error_message = NULL \
         WHERE flow_run_id = $1 AND status = 'failed' AND retry_count < max_retries \
         RETURNING *",
    )
    .bind(flow_run_id)
    .fetch_optional(pool)
    .await?;

    retried.ok_or_else(|| {
        Error::Conflict(format!(
            "flow_run {flow_run_id} not eligible for retry (wrong status or retries exhausted)"
        ))
    })
}

/// Rebuild the denormalized `task_statuses` map from the (already-reset)
/// `flow_task_runs` rows and clear `success_task_results`, so a flow-level
/// retry's status snapshot doesn't still show the prior attempt's outcome.
pub async fn reset_task_statuses_for_retry(pool: &PgPool, flow_run_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE flow_runs \
         SET task_statuses = COALESCE( \
                 (SELECT jsonb_object_agg(task_name, to_jsonb(status::text)) \
                  FROM flow_task_runs WHERE flow_run_id = $1), \
                 '{}'::jsonb), \
             success_task_results = '{}'::jsonb \
         WHERE flow_run_id = $1",
    )
    .bind(flow_run_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Flow-runs sitting in `SCHEDULED`, ready for a scheduler to claim.
pub async fn list_pending_flow_runs(pool: &PgPool) -> Result<Vec<FlowRun>> {
    let runs = sqlx::query_as::<_, FlowRun>(
        "SELECT * FROM flow_runs WHERE status = 'scheduled' ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await?;

    Ok(runs)
}

/// Flow-runs in `FAILED` with retry budget remaining.
pub async fn list_retry_candidates(pool: &PgPool) -> Result<Vec<FlowRun>> {
    let runs = sqlx::query_as::<_, FlowRun>(
        "SELECT * FROM flow_runs \
         WHERE status = 'failed' AND retry_count < max_retries \
         ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await?;

    Ok(runs)
}

/// Flow-runs in `RUNNING` with no recorded `flow_run_events` activity in
/// the last `progress_timeout` seconds -- candidates for the stuck-flow-run
/// sweep. Falls back to `started_at` for a run with no events yet, since a
/// freshly-started run hasn't had a chance to emit one.
pub async fn list_stuck_flow_runs(pool: &PgPool, progress_timeout_secs: i64) -> Result<Vec<FlowRun>> {
    let runs = sqlx::query_as::<_, FlowRun>(
        "SELECT * FROM flow_runs fr \
         WHERE status = 'running' \
           AND started_at IS NOT NULL \
           AND COALESCE( \
                 (SELECT MAX(event_timestamp) FROM flow_run_events \
                  WHERE flow_run_id = fr.flow_run_id), \
                 fr.started_at \
               ) < NOW() - make_interval(secs => $1)",
    )
    .bind(progress_timeout_secs as f64)
    .fetch_all(pool)
    .await?;

    Ok(runs)
}

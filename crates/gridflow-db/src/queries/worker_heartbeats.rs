//! Database query functions for the `worker_heartbeats` table.

use sqlx::PgPool;

use crate::models::{WorkerHeartbeat, WorkerStatus};
use crate::Result;

/// Insert or refresh a worker's heartbeat row.
pub async fn upsert_heartbeat(
    pool: &PgPool,
    worker_id: &str,
    worker_name: &str,
    status: WorkerStatus,
    worker_info: &serde_json::Value,
) -> Result<WorkerHeartbeat> {
    let row = sqlx::query_as::<_, WorkerHeartbeat>(
        "INSERT INTO worker_heartbeats (worker_id, worker_name, status, last_heartbeat, worker_info) \
         VALUES ($1, $2, $3, NOW(), $4) \
         ON CONFLICT (worker_id) DO UPDATE \
             SET worker_name = EXCLUDED.worker_name, \
                 status = EXCLUDED.status, \
                 last_heartbeat = NOW(), \
                 worker_info = EXCLUDED.worker_info \
         RETURNING *",
    )
    .bind(worker_id)
    .bind(worker_name)
    .bind(status)
    .bind(worker_info)
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Workers currently `ACTIVE` whose `last_heartbeat` predates
/// `heartbeat_timeout` seconds ago -- candidates for the liveness sweep.
pub async fn list_stale_workers(pool: &PgPool, heartbeat_timeout_secs: i64) -> Result<Vec<WorkerHeartbeat>> {
    let rows = sqlx::query_as::<_, WorkerHeartbeat>(
        "SELECT * FROM worker_heartbeats \
         WHERE status = 'active' \
           AND last_heartbeat < NOW() - make_interval(secs => $1)",
    )
    .bind(heartbeat_timeout_secs as f64)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// `ACTIVE -> FAILED`, called by the sweeper once a worker is declared stale.
pub async fn mark_worker_failed(pool: &PgPool, worker_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE worker_heartbeats SET status = 'failed' WHERE worker_id = $1 AND status = 'active'",
    )
    .bind(worker_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// The active worker, if any, whose last-reported `worker_info.current_task_ref`
/// names this task -- used to target `task.cancel.<worker_id>` and to find
/// which task-run to reset when WLM declares a worker stale.
pub async fn find_active_worker_for_task(
    pool: &PgPool,
    flow_run_id: uuid::Uuid,
    task_name: &str,
) -> Result<Option<WorkerHeartbeat>> {
    let row = sqlx::query_as::<_, WorkerHeartbeat>(
        "SELECT * FROM worker_heartbeats \
         WHERE status = 'active' \
           AND worker_info #>> '{current_task_ref,flow_run_id}' = $1 \
           AND worker_info #>> '{current_task_ref,task_name}' = $2",
    )
    .bind(flow_run_id.to_string())
    .bind(task_name)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

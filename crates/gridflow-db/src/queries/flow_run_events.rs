//! Database query functions for the append-only `flow_run_events` table.

use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{EventSource, FlowRunEvent, FlowRunEventType};
use crate::Result;

/// Append one event row. Never updated once written.
pub async fn append_event(
    pool: &PgPool,
    flow_run_id: Uuid,
    task_name: Option<&str>,
    event_type: FlowRunEventType,
    event_data: &serde_json::Value,
    source: EventSource,
) -> Result<FlowRunEvent> {
    let event = sqlx::query_as::<_, FlowRunEvent>(
        "INSERT INTO flow_run_events (flow_run_id, task_name, event_type, event_data, source) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(flow_run_id)
    .bind(task_name)
    .bind(event_type)
    .bind(event_data)
    .bind(source)
    .fetch_one(pool)
    .await?;

    Ok(event)
}

/// List every event for a flow-run, oldest first -- `event_timestamp` is
/// non-decreasing across this list by construction (single append path,
/// server-assigned `DEFAULT NOW()`).
pub async fn list_events_for_flow_run(pool: &PgPool, flow_run_id: Uuid) -> Result<Vec<FlowRunEvent>> {
    let events = sqlx::query_as::<_, FlowRunEvent>(
        "SELECT * FROM flow_run_events WHERE flow_run_id = $1 ORDER BY event_timestamp ASC, event_id ASC",
    )
    .bind(flow_run_id)
    .fetch_all(pool)
    .await?;

    Ok(events)
}

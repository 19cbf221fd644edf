//! Shared `flow_run_events` recording helpers used by TS, TCR, and WLM.
//!
//! Every flow-run and task-run state transition emits a `flow_run_events`
//! row -- centralizing the append call keeps that invariant from drifting
//! as the three subsystems evolve independently.
//! A failed append is logged and swallowed rather than propagated: the
//! event log is an audit trail, not a prerequisite for the transition it
//! describes, so losing one must never roll back work already committed.

use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use gridflow_db::models::{EventSource, FlowRunEventType};
use gridflow_db::queries::flow_run_events;

/// Append a `flow_run_events` row, logging (not propagating) a failure.
/// `task_name` is `None` for flow-run-level events.
pub async fn record(
    pool: &PgPool,
    flow_run_id: Uuid,
    task_name: Option<&str>,
    event_type: FlowRunEventType,
    data: serde_json::Value,
    source: EventSource,
) {
    if let Err(err) =
        flow_run_events::append_event(pool, flow_run_id, task_name, event_type, &data, source).await
    {
        tracing::warn!(
            %flow_run_id,
            ?task_name,
            ?event_type,
            error = %err,
            "failed to record flow_run_events row"
        );
    }
}

pub async fn flow_run_request(pool: &PgPool, flow_run_id: Uuid, parameters: &serde_json::Value) {
    record(
        pool,
        flow_run_id,
        None,
        FlowRunEventType::FlowRunRequest,
        json!({ "parameters": parameters }),
        EventSource::Orchestrator,
    )
    .await;
}

pub async fn flow_run_execute(pool: &PgPool, flow_run_id: Uuid) {
    record(
        pool,
        flow_run_id,
        None,
        FlowRunEventType::FlowRunExecuteEvent,
        json!({}),
        EventSource::Scheduler,
    )
    .await;
}

pub async fn flow_run_status(pool: &PgPool, flow_run_id: Uuid, status: &str, error: Option<&str>) {
    record(
        pool,
        flow_run_id,
        None,
        FlowRunEventType::FlowRunStatusEvent,
        json!({ "status": status, "error": error }),
        EventSource::Scheduler,
    )
    .await;
}

pub async fn task_run_status(
    pool: &PgPool,
    flow_run_id: Uuid,
    task_name: &str,
    from: &str,
    to: &str,
    source: EventSource,
    detail: Option<&str>,
) {
    record(
        pool,
        flow_run_id,
        Some(task_name),
        FlowRunEventType::TaskRunStatusEvent,
        json!({ "from": from, "to": to, "detail": detail }),
        source,
    )
    .await;
}

pub async fn task_cancel(pool: &PgPool, flow_run_id: Uuid, task_name: &str, user_id: Option<&str>) {
    record(
        pool,
        flow_run_id,
        Some(task_name),
        FlowRunEventType::TaskCancelEvent,
        json!({ "user_id": user_id }),
        EventSource::Orchestrator,
    )
    .await;
}

//! `gridflow run` commands: submit, status, events, cancel, retry.
//!
//! `submit`/`cancel`/`retry` call straight into `gridflow_core::Scheduler`
//! rather than only publishing to the bus, for local development and
//! integration tests when the external API surface isn't running.
//! `status` and `events` are read-only.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use gridflow_core::messages::{FlowRunRequestMessage, TaskCancelMessage};
use gridflow_core::Scheduler;
use gridflow_db::models::TaskRunStatus;
use gridflow_db::queries::{flow_run_events, flow_runs, flow_task_runs};

/// `gridflow run submit <flow-id>`: accept a new flow-run request and kick
/// off the drive loop.
pub async fn run_submit(
    scheduler: &Scheduler,
    flow_id_str: &str,
    parameters: serde_json::Value,
    user_id: Option<String>,
    request_id: Option<String>,
) -> Result<()> {
    let flow_id =
        Uuid::parse_str(flow_id_str).with_context(|| format!("invalid flow ID: {flow_id_str}"))?;

    let flow_run_id = scheduler
        .handle_flow_run_request(FlowRunRequestMessage {
            flow_id,
            parameters,
            user_id,
            request_id,
        })
        .await
        .context("failed to submit flow-run request")?;

    scheduler
        .drive(flow_run_id)
        .await
        .context("failed to drive the newly submitted flow-run")?;

    println!("Submitted flow-run {flow_run_id}");
    Ok(())
}

/// `gridflow run status <flow-run-id>`: flow-run header plus per-task status.
pub async fn run_status(pool: &PgPool, flow_run_id_str: &str) -> Result<()> {
    let flow_run_id = Uuid::parse_str(flow_run_id_str)
        .with_context(|| format!("invalid flow-run ID: {flow_run_id_str}"))?;

    let flow_run = flow_runs::get_flow_run(pool, flow_run_id).await?;

    println!("Flow-run: {}", flow_run.flow_run_id);
    println!("  Flow:        {}", flow_run.flow_id);
    println!("  Status:      {}", flow_run.status);
    println!("  Engine:      {}", flow_run.engine);
    println!("  Retry count: {}/{}", flow_run.retry_count, flow_run.max_retries);
    if let Some(started) = flow_run.started_at {
        println!("  Started:     {}", started.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(finished) = flow_run.finished_at {
        println!("  Finished:    {}", finished.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(error) = &flow_run.error_message {
        println!("  Error:       {error}");
    }
    println!();

    let tasks = flow_task_runs::list_task_runs_for_flow_run(pool, flow_run_id).await?;
    if tasks.is_empty() {
        println!("Tasks: not materialized yet.");
        return Ok(());
    }

    println!("Tasks:");
    for task in &tasks {
        let icon = status_icon(task.status);
        println!(
            "  [{icon}] {} ({}, attempt {}/{})",
            task.task_name, task.status, task.retry_count, task.max_retries
        );
    }

    Ok(())
}

fn status_icon(status: TaskRunStatus) -> &'static str {
    match status {
        TaskRunStatus::Pending => ".",
        TaskRunStatus::Running => "*",
        TaskRunStatus::Success => "+",
        TaskRunStatus::Failed => "!",
        TaskRunStatus::Canceled => "x",
    }
}

/// `gridflow run events <flow-run-id>`: the full `flow_run_events` audit
/// trail for a flow-run, oldest first.
pub async fn run_events(pool: &PgPool, flow_run_id_str: &str) -> Result<()> {
    let flow_run_id = Uuid::parse_str(flow_run_id_str)
        .with_context(|| format!("invalid flow-run ID: {flow_run_id_str}"))?;

    let events = flow_run_events::list_events_for_flow_run(pool, flow_run_id).await?;
    if events.is_empty() {
        println!("No events recorded for flow-run {flow_run_id}.");
        return Ok(());
    }

    println!("Events ({}):", events.len());
    for event in &events {
        let time = event.event_timestamp.format("%H:%M:%S%.3f");
        let task = event.task_name.as_deref().unwrap_or("-");
        println!(
            "  [{time}] [{}] task={task} {}: {}",
            event.source, event.event_type, event.event_data
        );
    }

    Ok(())
}

/// `gridflow run cancel <flow-run-id>`: cancel every pending task, ask any
/// running task's worker to stop, and mark the flow-run failed.
pub async fn run_cancel(
    scheduler: &Scheduler,
    flow_run_id_str: &str,
    user_id: Option<String>,
) -> Result<()> {
    let flow_run_id = Uuid::parse_str(flow_run_id_str)
        .with_context(|| format!("invalid flow-run ID: {flow_run_id_str}"))?;

    scheduler
        .handle_task_cancel(TaskCancelMessage {
            flow_run_id,
            user_id,
        })
        .await
        .context("failed to cancel flow-run")?;

    println!("Flow-run {flow_run_id} cancelled.");
    Ok(())
}

/// `gridflow run retry <flow-run-id>`: retry a `FAILED` flow-run whose
/// budget isn't exhausted.
pub async fn run_retry(scheduler: &Scheduler, flow_run_id_str: &str) -> Result<()> {
    let flow_run_id = Uuid::parse_str(flow_run_id_str)
        .with_context(|| format!("invalid flow-run ID: {flow_run_id_str}"))?;

    scheduler
        .retry_flow_run(flow_run_id)
        .await
        .context("failed to retry flow-run")?;

    scheduler
        .drive(flow_run_id)
        .await
        .context("failed to drive the retried flow-run")?;

    println!("Flow-run {flow_run_id} rescheduled for retry.");
    Ok(())
}

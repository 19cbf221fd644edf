//! Task Scheduler: consumes `flow.run.execute`, materializes task DAGs, and
//! drives them forward.
//!
//! The drive loop does restart recovery, a termination check each
//! iteration, ready-task dispatch, and otherwise waits for progress --
//! expressed as a bus-subscriber rather than an in-process fan-out, since
//! dispatch here crosses a process boundary to a worker rather than
//! spawning a local task. `drive` is safe to call redundantly (another
//! replica may have already finished the work) because every state change
//! underneath it is a conditional `UPDATE ... WHERE status = $from`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gridflow_bus::{subjects, DeliveredMessage, EventBus};
use gridflow_db::models::{EventSource, FlowRunStatus, FlowTaskRun, TaskRunStatus};
use gridflow_db::queries::{flow_runs, flow_task_runs};
use sqlx::PgPool;

use crate::catalog::FlowCatalog;
use crate::config::SchedulerConfig;
use crate::error::{CoreError, Result};
use crate::events;
use crate::graph::{FlowGraph, TaskNode};
use crate::messages::{
    FlowRunExecuteMessage, FlowRunRequestMessage, FlowRunStatusMessage, TaskDispatchMessage,
};
use crate::streams::consumers;

/// Drives flow-run execution: the scheduler proper, plus the request-intake
/// and stuck-flow-run sweep that accompany it.
pub struct Scheduler {
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    catalog: Arc<dyn FlowCatalog>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        bus: Arc<dyn EventBus>,
        catalog: Arc<dyn FlowCatalog>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            pool,
            bus,
            catalog,
            config,
        }
    }

    /// Accepts a `FlowRunRequestMessage`: inserts the `SCHEDULED` row and
    /// publishes `flow.run.execute` to hand it to the drive loop.
    pub async fn handle_flow_run_request(&self, msg: FlowRunRequestMessage) -> Result<Uuid> {
        let flow = self.catalog.get_flow(msg.flow_id).await?;

        let flow_run = match flow_runs::insert_flow_run_request(
            &self.pool,
            msg.flow_id,
            msg.request_id.as_deref(),
            msg.user_id.as_deref(),
            &msg.parameters,
            flow.engine,
            flow.default_max_retries,
        )
        .await
        {
            Ok(row) => row,
            Err(gridflow_db::Error::Conflict(detail)) => {
                return Err(CoreError::Conflict(detail));
            }
            Err(e) => return Err(e.into()),
        };

        events::flow_run_request(&self.pool, flow_run.flow_run_id, &flow_run.parameters).await;
        self.trigger_execute(flow_run.flow_run_id).await?;

        Ok(flow_run.flow_run_id)
    }

    async fn trigger_execute(&self, flow_run_id: Uuid) -> Result<()> {
        let msg = FlowRunExecuteMessage { flow_run_id };
        let payload = serde_json::to_vec(&msg).map_err(|e| CoreError::Other(e.into()))?;
        self.bus.publish(subjects::FLOW_RUN_EXECUTE, payload).await?;
        Ok(())
    }

    /// Records a flow-run status transition: appends the `flow_run_events`
    /// audit row and publishes `flow.run.status` so subscribers can observe
    /// progress without polling the flow-run row. A publish failure is
    /// logged and swallowed like the audit write -- the transition itself
    /// already committed, and a missed broadcast isn't worth rolling that
    /// back for.
    async fn publish_status(&self, flow_run_id: Uuid, status: &str, error: Option<&str>) {
        events::flow_run_status(&self.pool, flow_run_id, status, error).await;

        let msg = FlowRunStatusMessage {
            flow_run_id,
            status: status.to_string(),
            error: error.map(|e| e.to_string()),
        };
        let payload = match serde_json::to_vec(&msg) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(%flow_run_id, status, error = %err, "failed to serialize flow.run.status message");
                return;
            }
        };
        if let Err(err) = self.bus.publish(subjects::FLOW_RUN_STATUS, payload).await {
            tracing::warn!(%flow_run_id, status, error = %err, "failed to publish flow.run.status");
        }
    }

    /// The re-entrant drive-loop body for one flow-run: restart recovery,
    /// ready-task dispatch, and termination. Idempotent: calling this
    /// redundantly after another replica has already advanced the row is a
    /// no-op.
    pub async fn drive(&self, flow_run_id: Uuid) -> Result<()> {
        let flow_run = flow_runs::get_flow_run(&self.pool, flow_run_id).await?;
        events::flow_run_execute(&self.pool, flow_run_id).await;

        match flow_run.status {
            FlowRunStatus::Scheduled => {
                let claimed = match flow_runs::claim_flow_run_for_execution(&self.pool, flow_run_id).await
                {
                    Ok(row) => row,
                    Err(gridflow_db::Error::Conflict(_)) => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                self.materialize_and_start(claimed).await?;
            }
            FlowRunStatus::Pending => {
                self.materialize_and_start(flow_run).await?;
            }
            FlowRunStatus::Running => {}
            FlowRunStatus::Success | FlowRunStatus::Failed => return Ok(()),
        }

        self.advance(flow_run_id).await
    }

    /// Materializes the task graph, creates the `PENDING` task-run rows
    /// (skipped if a prior crashed attempt already created them), and
    /// transitions `PENDING -> RUNNING`.
    async fn materialize_and_start(&self, flow_run: gridflow_db::models::FlowRun) -> Result<()> {
        let flow = self.catalog.get_flow(flow_run.flow_id).await?;
        let graph = self
            .catalog
            .materialize_graph(&flow, &flow_run.parameters)
            .await?;

        // A flow with no tasks is valid: it runs straight through to SUCCESS
        // with an empty `task_statuses`, rather than being rejected here.
        let existing =
            flow_task_runs::list_task_runs_for_flow_run(&self.pool, flow_run.flow_run_id).await?;
        if existing.is_empty() {
            let tasks: Vec<(String, i32)> = graph
                .tasks()
                .iter()
                .map(|t| (t.name.clone(), resolved_max_retries(t, &self.config)))
                .collect();
            flow_task_runs::insert_pending_task_runs(&self.pool, flow_run.flow_run_id, &tasks)
                .await?;

            let statuses: serde_json::Map<String, serde_json::Value> = graph
                .tasks()
                .iter()
                .map(|t| (t.name.clone(), serde_json::json!("pending")))
                .collect();
            flow_runs::upsert_task_statuses(
                &self.pool,
                flow_run.flow_run_id,
                &serde_json::Value::Object(statuses),
            )
            .await?;
        }

        match flow_runs::start_flow_run(&self.pool, flow_run.flow_run_id).await {
            Ok(_) => {
                self.publish_status(flow_run.flow_run_id, "running", None).await;
                Ok(())
            }
            Err(gridflow_db::Error::Conflict(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Computes the ready set, dispatches it, and finalizes the flow-run if
    /// nothing is ready or in flight.
    async fn advance(&self, flow_run_id: Uuid) -> Result<()> {
        let flow_run = flow_runs::get_flow_run(&self.pool, flow_run_id).await?;
        if flow_run.status != FlowRunStatus::Running {
            return Ok(());
        }

        let flow = self.catalog.get_flow(flow_run.flow_id).await?;
        let graph = self
            .catalog
            .materialize_graph(&flow, &flow_run.parameters)
            .await?;

        let task_runs = flow_task_runs::list_task_runs_for_flow_run(&self.pool, flow_run_id).await?;
        let by_name: HashMap<&str, &FlowTaskRun> = task_runs
            .iter()
            .map(|t| (t.task_name.as_str(), t))
            .collect();

        let pending: HashSet<&str> = task_runs
            .iter()
            .filter(|t| t.status == TaskRunStatus::Pending)
            .map(|t| t.task_name.as_str())
            .collect();
        let succeeded: HashSet<&str> = task_runs
            .iter()
            .filter(|t| t.status == TaskRunStatus::Success)
            .map(|t| t.task_name.as_str())
            .collect();
        let running_count = task_runs
            .iter()
            .filter(|t| t.status == TaskRunStatus::Running)
            .count();

        let ready = graph.ready_set(&pending, &succeeded);

        for task in &ready {
            self.dispatch_task(flow_run_id, &flow_run.parameters, flow_run.engine, task, &by_name)
                .await?;
        }

        if ready.is_empty() && running_count == 0 {
            self.finalize(flow_run_id, &graph, &succeeded, &task_runs).await?;
        }

        Ok(())
    }

    async fn dispatch_task(
        &self,
        flow_run_id: Uuid,
        parameters: &serde_json::Value,
        engine: gridflow_db::models::FlowEngine,
        task: &TaskNode,
        by_name: &HashMap<&str, &FlowTaskRun>,
    ) -> Result<()> {
        let dependency_results = build_dependency_results(task, by_name);
        let attempt = by_name
            .get(task.name.as_str())
            .map(|t| t.retry_count + 1)
            .unwrap_or(1);

        let msg = TaskDispatchMessage {
            flow_run_id,
            task_name: task.name.clone(),
            entrypoint: task.entrypoint.clone(),
            parameters: parameters.clone(),
            dependency_results,
            attempt,
        };
        let payload = serde_json::to_vec(&msg).map_err(|e| CoreError::Other(e.into()))?;
        self.bus
            .publish(&subjects::task_dispatch(&engine.to_string()), payload)
            .await?;

        events::task_run_status(
            &self.pool,
            flow_run_id,
            &task.name,
            "pending",
            "dispatched",
            EventSource::Scheduler,
            None,
        )
        .await;

        Ok(())
    }

    async fn finalize(
        &self,
        flow_run_id: Uuid,
        graph: &FlowGraph,
        succeeded: &HashSet<&str>,
        task_runs: &[FlowTaskRun],
    ) -> Result<()> {
        if succeeded.len() == graph.len() {
            match flow_runs::complete_flow_run(&self.pool, flow_run_id, FlowRunStatus::Success, None)
                .await
            {
                Ok(_) => self.publish_status(flow_run_id, "success", None).await,
                Err(gridflow_db::Error::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }

        let error = aggregate_failure_error(task_runs);
        match flow_runs::complete_flow_run(
            &self.pool,
            flow_run_id,
            FlowRunStatus::Failed,
            Some(&error),
        )
        .await
        {
            Ok(_) => self.publish_status(flow_run_id, "failed", Some(&error)).await,
            Err(gridflow_db::Error::Conflict(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// `TaskCancelEvent` handling: cancels every still-`PENDING` task, asks
    /// the owning worker of any `RUNNING` task to stop, and marks the
    /// flow-run `FAILED`.
    pub async fn handle_task_cancel(&self, msg: crate::messages::TaskCancelMessage) -> Result<()> {
        let canceled =
            flow_task_runs::cancel_pending_task_runs(&self.pool, msg.flow_run_id).await?;
        for task in &canceled {
            events::task_cancel(&self.pool, msg.flow_run_id, &task.task_name, msg.user_id.as_deref())
                .await;
        }

        let task_runs = flow_task_runs::list_task_runs_for_flow_run(&self.pool, msg.flow_run_id).await?;
        for task in task_runs.iter().filter(|t| t.status == TaskRunStatus::Running) {
            if let Some(worker) = gridflow_db::queries::worker_heartbeats::find_active_worker_for_task(
                &self.pool,
                msg.flow_run_id,
                &task.task_name,
            )
            .await?
            {
                let subject = subjects::task_cancel_worker(&worker.worker_id);
                if let Err(err) = self.bus.publish(&subject, Vec::new()).await {
                    tracing::warn!(worker_id = %worker.worker_id, error = %err, "failed to notify worker of cancellation");
                }
            }
        }

        match flow_runs::complete_flow_run(
            &self.pool,
            msg.flow_run_id,
            FlowRunStatus::Failed,
            Some("cancelled"),
        )
        .await
        {
            Ok(_) => {
                self.publish_status(msg.flow_run_id, "failed", Some("cancelled")).await
            }
            Err(gridflow_db::Error::Conflict(_)) => {}
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }

    /// Operator-initiated retry of a `FAILED` flow-run whose retry budget
    /// isn't exhausted: `FAILED -> SCHEDULED` then re-triggers the drive
    /// loop. Distinct from the automatic per-task retry in
    /// `callback::handle_failed` -- this resets the whole graph, which is
    /// what an operator means by "retry" after e.g. fixing a bad parameter.
    pub async fn retry_flow_run(&self, flow_run_id: Uuid) -> Result<()> {
        let retried = match flow_runs::schedule_retry(&self.pool, flow_run_id).await {
            Ok(row) => row,
            Err(gridflow_db::Error::Conflict(detail)) => return Err(CoreError::Conflict(detail)),
            Err(e) => return Err(e.into()),
        };

        flow_task_runs::reset_task_runs_for_retry(&self.pool, flow_run_id).await?;
        flow_runs::reset_task_statuses_for_retry(&self.pool, flow_run_id).await?;

        self.publish_status(flow_run_id, "scheduled", None).await;
        self.trigger_execute(retried.flow_run_id).await
    }

    /// Low-frequency sweep: flow-runs `RUNNING` with no progress for longer
    /// than `progress_timeout` are marked `FAILED`.
    pub async fn sweep_stuck_flow_runs(&self) -> Result<usize> {
        let stuck = flow_runs::list_stuck_flow_runs(
            &self.pool,
            self.config.progress_timeout.as_secs() as i64,
        )
        .await?;

        for run in &stuck {
            match flow_runs::complete_flow_run(
                &self.pool,
                run.flow_run_id,
                FlowRunStatus::Failed,
                Some("no progress within timeout"),
            )
            .await
            {
                Ok(_) => {
                    self.publish_status(
                        run.flow_run_id,
                        "failed",
                        Some("no progress within timeout"),
                    )
                    .await;
                }
                Err(gridflow_db::Error::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(stuck.len())
    }

    /// Consumes `flow.run.request` until cancelled.
    pub async fn run_request_consumer(&self, cancel: CancellationToken) -> Result<()> {
        let mut stream = self
            .bus
            .subscribe(subjects::streams::FLOW_RUN_EVENTS, consumers::SCHEDULER_REQUEST)
            .await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                delivered = stream.next() => {
                    let Some(delivered) = delivered else { return Ok(()) };
                    let outcome = match serde_json::from_slice::<FlowRunRequestMessage>(&delivered.payload) {
                        Ok(msg) => self.handle_flow_run_request(msg).await.map(|_| ()),
                        Err(e) => Err(CoreError::Validation(e.to_string())),
                    };
                    self.ack_or_nak(delivered, outcome).await;
                }
            }
        }
    }

    /// Consumes `flow.run.execute` until cancelled.
    pub async fn run_execute_consumer(&self, cancel: CancellationToken) -> Result<()> {
        let mut stream = self
            .bus
            .subscribe(subjects::streams::FLOW_RUN_EVENTS, consumers::SCHEDULER_EXECUTE)
            .await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                delivered = stream.next() => {
                    let Some(delivered) = delivered else { return Ok(()) };
                    let outcome = match serde_json::from_slice::<FlowRunExecuteMessage>(&delivered.payload) {
                        Ok(msg) => self.drive(msg.flow_run_id).await,
                        Err(e) => Err(CoreError::Validation(e.to_string())),
                    };
                    self.ack_or_nak(delivered, outcome).await;
                }
            }
        }
    }

    /// Consumes `task.cancel` until cancelled.
    pub async fn run_cancel_consumer(&self, cancel: CancellationToken) -> Result<()> {
        let mut stream = self
            .bus
            .subscribe(subjects::streams::TASK_DISPATCH, consumers::SCHEDULER_CANCEL)
            .await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                delivered = stream.next() => {
                    let Some(delivered) = delivered else { return Ok(()) };
                    let outcome = match serde_json::from_slice::<crate::messages::TaskCancelMessage>(&delivered.payload) {
                        Ok(msg) => self.handle_task_cancel(msg).await,
                        Err(e) => Err(CoreError::Validation(e.to_string())),
                    };
                    self.ack_or_nak(delivered, outcome).await;
                }
            }
        }
    }

    /// Acks or naks `delivered` according to `outcome`. Conflicts (lost
    /// races, duplicates) ack rather than redeliver -- they mean another
    /// replica already did the work, not that this attempt failed.
    async fn ack_or_nak(&self, delivered: DeliveredMessage, outcome: Result<()>) {
        match outcome {
            Ok(()) => {
                if let Err(err) = delivered.ack.ack().await {
                    tracing::warn!(error = %err, "failed to ack delivered message");
                }
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!(error = %e, "treating conflict as already handled");
                if let Err(err) = delivered.ack.ack().await {
                    tracing::warn!(error = %err, "failed to ack conflicted message");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "handler failed, nak for redelivery");
                if let Err(err) = delivered.ack.nak(None).await {
                    tracing::warn!(error = %err, "failed to nak message");
                }
            }
        }
    }

    /// Runs the stuck-flow-run sweep on `config.progress_sweep_interval`
    /// until cancelled.
    pub async fn run_progress_sweep(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.progress_sweep_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    if let Err(err) = self.sweep_stuck_flow_runs().await {
                        tracing::warn!(error = %err, "stuck flow-run sweep failed");
                    }
                }
            }
        }
    }
}

fn resolved_max_retries(task: &TaskNode, config: &SchedulerConfig) -> i32 {
    if task.max_retries < 0 {
        config.default_max_retries
    } else {
        task.max_retries
    }
}

fn build_dependency_results(
    task: &TaskNode,
    by_name: &HashMap<&str, &FlowTaskRun>,
) -> BTreeMap<String, String> {
    task.depends_on
        .iter()
        .filter_map(|dep| {
            by_name
                .get(dep.as_str())
                .and_then(|run| run.result_cache_key.clone())
                .map(|key| (dep.clone(), key))
        })
        .collect()
}

fn aggregate_failure_error(task_runs: &[FlowTaskRun]) -> String {
    task_runs
        .iter()
        .find(|t| t.status == TaskRunStatus::Failed)
        .and_then(|t| t.error_message.clone())
        .unwrap_or_else(|| "one or more tasks failed with no retries remaining".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn task_run(name: &str, status: TaskRunStatus, cache_key: Option<&str>) -> FlowTaskRun {
        FlowTaskRun {
            flow_run_id: Uuid::new_v4(),
            task_name: name.to_string(),
            status,
            result: None,
            result_cache_key: cache_key.map(|s| s.to_string()),
            error_message: None,
            started_at: Some(Utc::now()),
            finished_at: None,
            duration_seconds: None,
            retry_count: 0,
            max_retries: 3,
        }
    }

    #[test]
    fn dependency_results_only_include_succeeded_deps_with_a_key() {
        let task = TaskNode {
            name: "c".to_string(),
            entrypoint: "mod.c".to_string(),
            depends_on: vec!["a".to_string(), "b".to_string()],
            max_retries: -1,
            depth: 1,
        };
        let a = task_run("a", TaskRunStatus::Success, Some("result_cache/x/a.json"));
        let b = task_run("b", TaskRunStatus::Pending, None);
        let by_name: HashMap<&str, &FlowTaskRun> =
            [("a", &a), ("b", &b)].into_iter().collect();

        let deps = build_dependency_results(&task, &by_name);
        assert_eq!(deps.len(), 1);
        assert_eq!(deps.get("a").unwrap(), "result_cache/x/a.json");
    }

    #[test]
    fn aggregate_error_prefers_the_failed_tasks_message() {
        let mut failed = task_run("b", TaskRunStatus::Failed, None);
        failed.error_message = Some("boom".to_string());
        let runs = vec![task_run("a", TaskRunStatus::Success, None), failed];
        assert_eq!(aggregate_failure_error(&runs), "boom");
    }

    #[test]
    fn resolved_max_retries_falls_back_to_config_default() {
        let config = SchedulerConfig::default();
        let sentinel = TaskNode {
            name: "a".to_string(),
            entrypoint: "mod.a".to_string(),
            depends_on: vec![],
            max_retries: -1,
            depth: 0,
        };
        let explicit = TaskNode {
            max_retries: 7,
            ..sentinel.clone()
        };
        assert_eq!(resolved_max_retries(&sentinel, &config), config.default_max_retries);
        assert_eq!(resolved_max_retries(&explicit, &config), 7);
    }
}

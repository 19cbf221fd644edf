//! Wire payload shapes for every subject in the taxonomy.
//!
//! These are plain `serde`-derived structs published/consumed as JSON over
//! `gridflow-bus`. They live in `gridflow-core` rather than `gridflow-bus`:
//! the bus crate is a thin transport with no domain knowledge, the domain
//! payloads live next to the code that builds and interprets them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gridflow_db::models::{FlowEngine, TaskRunStatus};

/// `flow.run.request` -- API -> core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRunRequestMessage {
    pub flow_id: Uuid,
    pub parameters: serde_json::Value,
    pub user_id: Option<String>,
    pub request_id: Option<String>,
}

/// `flow.run.execute` -- core -> core, the drive-loop re-entry trigger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FlowRunExecuteMessage {
    pub flow_run_id: Uuid,
}

/// `flow.run.status` -- core -> subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRunStatusMessage {
    pub flow_run_id: Uuid,
    pub status: String,
    pub error: Option<String>,
}

/// `task.dispatch.<engine>` -- core -> worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDispatchMessage {
    pub flow_run_id: Uuid,
    pub task_name: String,
    pub entrypoint: String,
    pub parameters: serde_json::Value,
    /// `dep_name -> cache_key` for every dependency this task declared.
    pub dependency_results: BTreeMap<String, String>,
    /// 1-based attempt number (`retry_count + 1` at dispatch time).
    pub attempt: i32,
}

/// `task.status.<state>` -- worker -> core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusMessage {
    pub flow_run_id: Uuid,
    pub task_name: String,
    pub attempt: i32,
    pub worker_id: String,
    pub status: TaskRunStatus,
    pub result_inline: Option<serde_json::Value>,
    pub result_cache_key: Option<String>,
    pub error: Option<String>,
}

/// `task.cancel` -- API -> core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCancelMessage {
    pub flow_run_id: Uuid,
    pub user_id: Option<String>,
}

/// `worker.heartbeat.<worker_id>` -- worker -> core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatMessage {
    pub worker_id: String,
    pub worker_name: String,
    pub status: gridflow_db::models::WorkerStatus,
    pub worker_info: WorkerInfo,
}

/// `worker_info` shape: engine capabilities, version, and the task currently
/// claimed (used by WLM to find the task-run to reset on liveness loss).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerInfo {
    #[serde(default)]
    pub engines: Vec<FlowEngine>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub current_task_ref: Option<TaskRef>,
}

/// Identifies the task-run a worker currently has claimed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRef {
    pub flow_run_id: Uuid,
    pub task_name: String,
}

impl WorkerInfo {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

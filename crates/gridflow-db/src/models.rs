use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a flow-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FlowRunStatus {
    Scheduled,
    Pending,
    Running,
    Success,
    Failed,
}

impl fmt::Display for FlowRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Scheduled => "scheduled",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for FlowRunStatus {
    type Err = FlowRunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(FlowRunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`FlowRunStatus`] string.
#[derive(Debug, Clone)]
pub struct FlowRunStatusParseError(pub String);

impl fmt::Display for FlowRunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid flow-run status: {:?}", self.0)
    }
}

impl std::error::Error for FlowRunStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a single task-run attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
}

impl fmt::Display for TaskRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskRunStatus {
    type Err = TaskRunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(TaskRunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskRunStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskRunStatusParseError(pub String);

impl fmt::Display for TaskRunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task-run status: {:?}", self.0)
    }
}

impl std::error::Error for TaskRunStatusParseError {}

// ---------------------------------------------------------------------------

/// Execution engine a flow (or flow-run) dispatches onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FlowEngine {
    Process,
    Container,
    Remote,
}

impl fmt::Display for FlowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Process => "process",
            Self::Container => "container",
            Self::Remote => "remote",
        };
        f.write_str(s)
    }
}

impl FromStr for FlowEngine {
    type Err = FlowEngineParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process" => Ok(Self::Process),
            "container" => Ok(Self::Container),
            "remote" => Ok(Self::Remote),
            other => Err(FlowEngineParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`FlowEngine`] string.
#[derive(Debug, Clone)]
pub struct FlowEngineParseError(pub String);

impl fmt::Display for FlowEngineParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid flow engine: {:?}", self.0)
    }
}

impl std::error::Error for FlowEngineParseError {}

// ---------------------------------------------------------------------------

/// Kind of event recorded in the append-only `flow_run_events` audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FlowRunEventType {
    FlowRunRequest,
    FlowRunResponse,
    FlowRunExecuteEvent,
    FlowRunStatusEvent,
    TaskRunStatusEvent,
    TaskCancelEvent,
}

impl fmt::Display for FlowRunEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FlowRunRequest => "flow_run_request",
            Self::FlowRunResponse => "flow_run_response",
            Self::FlowRunExecuteEvent => "flow_run_execute_event",
            Self::FlowRunStatusEvent => "flow_run_status_event",
            Self::TaskRunStatusEvent => "task_run_status_event",
            Self::TaskCancelEvent => "task_cancel_event",
        };
        f.write_str(s)
    }
}

impl FromStr for FlowRunEventType {
    type Err = FlowRunEventTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flow_run_request" => Ok(Self::FlowRunRequest),
            "flow_run_response" => Ok(Self::FlowRunResponse),
            "flow_run_execute_event" => Ok(Self::FlowRunExecuteEvent),
            "flow_run_status_event" => Ok(Self::FlowRunStatusEvent),
            "task_run_status_event" => Ok(Self::TaskRunStatusEvent),
            "task_cancel_event" => Ok(Self::TaskCancelEvent),
            other => Err(FlowRunEventTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`FlowRunEventType`] string.
#[derive(Debug, Clone)]
pub struct FlowRunEventTypeParseError(pub String);

impl fmt::Display for FlowRunEventTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid flow-run event type: {:?}", self.0)
    }
}

impl std::error::Error for FlowRunEventTypeParseError {}

// ---------------------------------------------------------------------------

/// Origin of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Orchestrator,
    Worker,
    Scheduler,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Orchestrator => "orchestrator",
            Self::Worker => "worker",
            Self::Scheduler => "scheduler",
        };
        f.write_str(s)
    }
}

impl FromStr for EventSource {
    type Err = EventSourceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orchestrator" => Ok(Self::Orchestrator),
            "worker" => Ok(Self::Worker),
            "scheduler" => Ok(Self::Scheduler),
            other => Err(EventSourceParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EventSource`] string.
#[derive(Debug, Clone)]
pub struct EventSourceParseError(pub String);

impl fmt::Display for EventSourceParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid event source: {:?}", self.0)
    }
}

impl std::error::Error for EventSourceParseError {}

// ---------------------------------------------------------------------------

/// Liveness status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Inactive,
    Failed,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerStatus {
    type Err = WorkerStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "failed" => Ok(Self::Failed),
            other => Err(WorkerStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkerStatus`] string.
#[derive(Debug, Clone)]
pub struct WorkerStatusParseError(pub String);

impl fmt::Display for WorkerStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid worker status: {:?}", self.0)
    }
}

impl std::error::Error for WorkerStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A flow template -- immutable from the scheduler's perspective.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Flow {
    pub id: Uuid,
    pub name: String,
    pub parameters_schema: serde_json::Value,
    pub engine: FlowEngine,
    pub code_location: String,
    pub entrypoint: String,
    pub default_max_retries: i32,
    pub created_at: DateTime<Utc>,
}

/// A single instantiation of a [`Flow`].
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FlowRun {
    pub flow_run_id: Uuid,
    pub flow_id: Uuid,
    pub request_id: Option<String>,
    pub user_id: Option<String>,
    pub parameters: serde_json::Value,
    pub status: FlowRunStatus,
    pub engine: FlowEngine,
    pub task_statuses: serde_json::Value,
    pub success_task_results: serde_json::Value,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A single task attempt record within a flow-run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FlowTaskRun {
    pub flow_run_id: Uuid,
    pub task_name: String,
    pub status: TaskRunStatus,
    pub result: Option<serde_json::Value>,
    pub result_cache_key: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub retry_count: i32,
    pub max_retries: i32,
}

/// An append-only audit event for a flow-run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FlowRunEvent {
    pub event_id: i64,
    pub flow_run_id: Uuid,
    pub task_name: Option<String>,
    pub event_type: FlowRunEventType,
    pub event_data: serde_json::Value,
    pub event_timestamp: DateTime<Utc>,
    pub source: EventSource,
}

/// Liveness record for a worker process.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub worker_name: String,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub worker_info: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

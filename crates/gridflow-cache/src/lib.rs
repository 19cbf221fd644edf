//! Result cache: content-addressed storage for completed task-run output.
//!
//! A task result is keyed by `(flow_run_id, task_name)`. Writes are
//! last-writer-wins within a flow run; a retried task simply overwrites its
//! prior entry. See [`fs::FsResultCache`] for the on-disk implementation.

pub mod fs;

use async_trait::async_trait;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Blob store for task-run results, addressed by flow run and task name.
#[async_trait]
pub trait ResultBlobStore: Send + Sync {
    /// Stores `value` as the result of `task_name` within `flow_run_id`,
    /// overwriting any prior value for the same key.
    async fn put(
        &self,
        flow_run_id: Uuid,
        task_name: &str,
        value: &serde_json::Value,
    ) -> Result<(), CacheError>;

    /// Fetches the stored result, if any, for `task_name` within `flow_run_id`.
    async fn get(
        &self,
        flow_run_id: Uuid,
        task_name: &str,
    ) -> Result<Option<serde_json::Value>, CacheError>;

    /// Removes every cached result for `flow_run_id`, e.g. once the flow
    /// run reaches a terminal state and its results have been persisted
    /// downstream.
    async fn purge_flow_run(&self, flow_run_id: Uuid) -> Result<(), CacheError>;
}

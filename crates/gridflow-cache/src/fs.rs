use std::path::PathBuf;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{CacheError, ResultBlobStore};

/// Result cache rooted at a directory, one subdirectory per flow run and
/// one JSON file per task name: `<root>/<flow_run_id>/<task_name>.json`.
pub struct FsResultCache {
    root: PathBuf,
}

impl FsResultCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn flow_run_dir(&self, flow_run_id: Uuid) -> PathBuf {
        self.root.join(flow_run_id.to_string())
    }

    fn task_path(&self, flow_run_id: Uuid, task_name: &str) -> PathBuf {
        self.flow_run_dir(flow_run_id)
            .join(format!("{}.json", sanitize_task_name(task_name)))
    }
}

/// Task names are operator-controlled flow-definition identifiers, not
/// untrusted input, but we still refuse path separators so a malformed
/// definition can't write outside its flow run's directory.
fn sanitize_task_name(task_name: &str) -> String {
    task_name.replace(['/', '\\', '\0'], "_")
}

#[async_trait]
impl ResultBlobStore for FsResultCache {
    async fn put(
        &self,
        flow_run_id: Uuid,
        task_name: &str,
        value: &serde_json::Value,
    ) -> Result<(), CacheError> {
        let dir = self.flow_run_dir(flow_run_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.task_path(flow_run_id, task_name);
        let bytes = serde_json::to_vec_pretty(value)?;
        // Write to a temp file in the same directory then rename, so a
        // reader never observes a partially written result.
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn get(
        &self,
        flow_run_id: Uuid,
        task_name: &str,
    ) -> Result<Option<serde_json::Value>, CacheError> {
        let path = self.task_path(flow_run_id, task_name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn purge_flow_run(&self, flow_run_id: Uuid) -> Result<(), CacheError> {
        let dir = self.flow_run_dir(flow_run_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

//! Flow template lookup and graph materialization.
//!
//! [`FlowCatalog`] is the seam between the scheduler and flow storage: the
//! scheduler takes it as `Arc<dyn FlowCatalog>` rather than a concrete pool
//! type. `PgFlowCatalog` is the only production implementation;
//! `gridflow-test-utils` supplies an in-memory one for scheduler unit tests
//! that don't need a running Postgres.

use async_trait::async_trait;
use uuid::Uuid;

use gridflow_db::models::Flow;

use crate::error::{CoreError, Result};
use crate::graph::{self, FlowGraph};

#[async_trait]
pub trait FlowCatalog: Send + Sync {
    async fn get_flow(&self, flow_id: Uuid) -> Result<Flow>;

    /// Deterministically materialize `flow`'s task graph for `parameters`.
    /// Default impl reads `flow.code_location` as a path to a graph TOML
    /// file on disk and templates it; implementations backed by a
    /// different code-storage scheme (e.g. an object store) override this.
    async fn materialize_graph(
        &self,
        flow: &Flow,
        parameters: &serde_json::Value,
    ) -> Result<FlowGraph> {
        let content = tokio::fs::read_to_string(&flow.code_location)
            .await
            .map_err(|e| {
                CoreError::Materialize(format!(
                    "reading {:?}: {e}",
                    flow.code_location
                ))
            })?;
        graph::materialize(&content, parameters)
            .map_err(|e| CoreError::Materialize(e.to_string()))
    }
}

pub struct PgFlowCatalog {
    pool: sqlx::PgPool,
}

impl PgFlowCatalog {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FlowCatalog for PgFlowCatalog {
    async fn get_flow(&self, flow_id: Uuid) -> Result<Flow> {
        gridflow_db::queries::flows::get_flow(&self.pool, flow_id)
            .await
            .map_err(CoreError::from)
    }
}

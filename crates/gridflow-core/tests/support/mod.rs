//! Shared harness for the scheduler/callback/liveness integration tests.
//!
//! Wires a real Postgres (via `gridflow_test_utils::create_test_db`) to an
//! in-process [`LocalBus`] and a temp-directory [`FsResultCache`], the same
//! trio `gridflow-cli serve` wires against NATS/Postgres/the filesystem.
#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;

use sqlx::PgPool;
use tempfile::{NamedTempFile, TempDir};
use uuid::Uuid;

use gridflow_bus::EventBus;
use gridflow_cache::ResultBlobStore;
use gridflow_core::{CallbackRouter, FlowCatalog, LivenessManager, PgFlowCatalog, Scheduler, SchedulerConfig};
use gridflow_db::models::FlowEngine;
use gridflow_db::queries::flows;
use gridflow_test_utils::LocalBus;

pub struct Harness {
    pub pool: PgPool,
    pub bus: Arc<LocalBus>,
    pub cache: Arc<dyn ResultBlobStore>,
    pub scheduler: Scheduler,
    pub callback: CallbackRouter,
    pub liveness: LivenessManager,
    pub flow_id: Uuid,
    _graph_file: NamedTempFile,
    _cache_dir: TempDir,
}

/// Builds a flow whose graph TOML is `graph_toml`, plus a scheduler/callback
/// router/liveness manager sharing one Postgres pool and one [`LocalBus`].
pub async fn setup(pool: PgPool, graph_toml: &str) -> Harness {
    setup_with_config(pool, graph_toml, SchedulerConfig::default()).await
}

/// Like [`setup`] but with a caller-supplied [`SchedulerConfig`], for tests
/// that need a shorter liveness/progress timeout than the production default.
pub async fn setup_with_config(pool: PgPool, graph_toml: &str, config: SchedulerConfig) -> Harness {
    let mut graph_file = NamedTempFile::new().expect("create temp graph file");
    graph_file
        .write_all(graph_toml.as_bytes())
        .expect("write graph toml");
    let code_location = graph_file.path().to_string_lossy().to_string();

    let flow = flows::insert_flow(
        &pool,
        "test-flow",
        &serde_json::json!({}),
        FlowEngine::Process,
        &code_location,
        "main",
        3,
    )
    .await
    .expect("insert flow");

    let bus = Arc::new(LocalBus::new());
    let bus_dyn: Arc<dyn EventBus> = bus.clone();

    let cache_dir = tempfile::tempdir().expect("create temp cache dir");
    let cache: Arc<dyn ResultBlobStore> = Arc::new(gridflow_cache::fs::FsResultCache::new(cache_dir.path()));

    let catalog: Arc<dyn FlowCatalog> = Arc::new(PgFlowCatalog::new(pool.clone()));

    let scheduler = Scheduler::new(pool.clone(), bus_dyn.clone(), catalog, config.clone());
    let callback = CallbackRouter::new(pool.clone(), bus_dyn.clone(), cache.clone());
    let liveness = LivenessManager::new(pool.clone(), bus_dyn, config);

    Harness {
        pool,
        bus,
        cache,
        scheduler,
        callback,
        liveness,
        flow_id: flow.id,
        _graph_file: graph_file,
        _cache_dir: cache_dir,
    }
}

pub const LINEAR_CHAIN: &str = r#"
[[tasks]]
name = "a"
entrypoint = "tasks.a"

[[tasks]]
name = "b"
entrypoint = "tasks.b"
depends_on = ["a"]
"#;

pub const DIAMOND: &str = r#"
[[tasks]]
name = "a"
entrypoint = "tasks.a"

[[tasks]]
name = "b"
entrypoint = "tasks.b"
depends_on = ["a"]

[[tasks]]
name = "c"
entrypoint = "tasks.c"
depends_on = ["a"]

[[tasks]]
name = "d"
entrypoint = "tasks.d"
depends_on = ["b", "c"]
"#;

pub const SINGLE_TASK: &str = r#"
[[tasks]]
name = "only"
entrypoint = "tasks.only"
"#;

/// A flow with no tasks at all.
pub const EMPTY: &str = "";

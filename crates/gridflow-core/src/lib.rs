//! Workflow execution engine core: the Task Scheduler, Task Callback
//! Router, and Worker Liveness Manager, plus the flow/task DAG
//! materialization and wire messages they share.
//!
//! `gridflow-db`, `gridflow-bus`, and `gridflow-cache` own storage,
//! transport, and result blobs respectively; nothing in this crate talks
//! to Postgres, NATS, or the filesystem directly except through those
//! crates' traits.

pub mod callback;
pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod liveness;
pub mod messages;
pub mod scheduler;
pub mod streams;

pub use callback::CallbackRouter;
pub use catalog::{FlowCatalog, PgFlowCatalog};
pub use config::SchedulerConfig;
pub use error::{CoreError, Result};
pub use graph::{FlowGraph, GraphError, TaskNode};
pub use liveness::LivenessManager;
pub use scheduler::Scheduler;

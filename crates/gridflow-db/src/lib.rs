//! State store adapter: transactional persistence for flows, flow-runs,
//! flow-task-runs, flow-run-events and worker-heartbeats.
//!
//! Every mutation here is either a single `UPDATE ... WHERE id = $n AND
//! status = $from` (optimistic concurrency) or a single transaction
//! spanning a small number of related rows. Callers never read-modify-write
//! across two round trips.

pub mod config;
mod error;
pub mod models;
pub mod pool;
pub mod queries;

pub use error::{Error, Result};

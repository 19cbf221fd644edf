//! Error types for the scheduler, callback router, and liveness manager.
//!
//! Splits `thiserror` enums a caller matches on (`Conflict`-style
//! idempotency signals) from `anyhow` for everything else.
//! [`CoreError::Conflict`] and [`CoreError::NotFound`] mirror the same
//! cases `gridflow_db::Error` already distinguishes -- TS/TCR/WLM treat
//! them as "another replica already handled this" rather than a failure.

use gridflow_cache::CacheError;
use gridflow_bus::PublishError;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("row not found")]
    NotFound,

    #[error("conditional update did not apply: {0}")]
    Conflict(String),

    #[error("flow graph materialization failed: {0}")]
    Materialize(String),

    #[error("flow-run payload failed validation: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] gridflow_db::Error),

    #[error("bus error: {0}")]
    Bus(#[from] PublishError),

    #[error("result cache error: {0}")]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// True when this error represents a lost race (claim already taken,
    /// duplicate request, stale redelivery) rather than a real failure --
    /// at-least-once callers should log and return `Ok(())`, not retry.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            CoreError::Conflict(_) | CoreError::Database(gridflow_db::Error::Conflict(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

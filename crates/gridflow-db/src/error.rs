/// Errors surfaced by the state store adapter.
///
/// Distinguishing [`Error::Conflict`] from [`Error::Database`] is what lets
/// an at-least-once caller treat "someone else already claimed this row" as
/// success rather than retrying into a wall.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("row not found")]
    NotFound,

    #[error("conditional update did not apply: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

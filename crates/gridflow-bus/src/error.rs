use std::time::Duration;

/// Errors surfaced by the bus adapter. Kept separate from the NATS crate's
/// own error types so callers don't need to depend on `async-nats` directly.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("no stream matches subject {0:?}")]
    NoMatchingStream(String),

    #[error("message was rejected by the server: {0}")]
    Rejected(String),

    #[error("consumer or stream setup failed: {0}")]
    Setup(String),

    #[error("ack/nak/term failed: {0}")]
    Ack(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

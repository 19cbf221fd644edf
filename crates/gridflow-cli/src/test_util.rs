//! Shared helpers for tests that mutate process-wide environment variables.
//! Rust runs `#[test]` functions on multiple threads by default, so tests
//! that set/remove env vars (config resolution, XDG paths) must serialize
//! against each other or they'll stomp on one another's state.

use std::sync::{Mutex, OnceLock};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn lock_env() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

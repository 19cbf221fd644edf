//! Subject taxonomy and stream/consumer names.
//!
//! These are the wire-level stable names every component agrees on. They
//! are plain string builders with no dependency on the domain types in
//! `gridflow-core` so that this crate stays a thin transport layer.

/// Stream names, one per logical queue.
pub mod streams {
    pub const FLOW_RUN_EVENTS: &str = "flow_run_events";
    pub const TASK_DISPATCH: &str = "task_dispatch";
    pub const TASK_STATUS: &str = "task_status";
    pub const WORKER_HEARTBEAT: &str = "worker_heartbeat";
}

/// `flow.run.request` -- API -> core.
pub const FLOW_RUN_REQUEST: &str = "flow.run.request";

/// `flow.run.execute` -- core -> core (re-entrant drive-loop trigger).
pub const FLOW_RUN_EXECUTE: &str = "flow.run.execute";

/// `flow.run.status` -- core -> subscribers.
pub const FLOW_RUN_STATUS: &str = "flow.run.status";

/// `task.cancel` -- API -> core.
pub const TASK_CANCEL: &str = "task.cancel";

/// `task.dispatch.<engine>` -- core -> worker.
pub fn task_dispatch(engine: &str) -> String {
    format!("task.dispatch.{engine}")
}

/// Wildcard subject filter matching every `task.dispatch.*` subject.
pub const TASK_DISPATCH_WILDCARD: &str = "task.dispatch.*";

/// `task.status.<state>` -- worker -> core.
pub fn task_status(state: &str) -> String {
    format!("task.status.{state}")
}

/// Wildcard subject filter matching every `task.status.*` subject.
pub const TASK_STATUS_WILDCARD: &str = "task.status.*";

/// `task.cancel.<worker_id>` -- core -> worker, targeted cancellation.
pub fn task_cancel_worker(worker_id: &str) -> String {
    format!("task.cancel.{worker_id}")
}

/// `worker.heartbeat.<worker_id>` -- worker -> core.
pub fn worker_heartbeat(worker_id: &str) -> String {
    format!("worker.heartbeat.{worker_id}")
}

/// Wildcard subject filter matching every `worker.heartbeat.*` subject.
pub const WORKER_HEARTBEAT_WILDCARD: &str = "worker.heartbeat.*";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_dispatch_formats_engine() {
        assert_eq!(task_dispatch("process"), "task.dispatch.process");
        assert_eq!(task_dispatch("container"), "task.dispatch.container");
    }

    #[test]
    fn task_status_formats_state() {
        assert_eq!(task_status("success"), "task.status.success");
    }

    #[test]
    fn worker_heartbeat_formats_id() {
        assert_eq!(worker_heartbeat("w-1"), "worker.heartbeat.w-1");
    }
}

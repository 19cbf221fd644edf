//! Idempotent stream/consumer declaration for every subject TS, TCR, and
//! WLM touch.
//!
//! Grouping this in one place means `gridflow-cli serve` and any test
//! harness stand up the bus topology identically, rather than letting each
//! subsystem declare its own ad hoc subset.

use std::time::Duration;

use gridflow_bus::{subjects, ConsumerConfig, EventBus, RetentionPolicy, StreamConfig};

use crate::error::Result;

/// Durable consumer names, one per subscriber role.
pub mod consumers {
    pub const SCHEDULER_EXECUTE: &str = "scheduler-execute";
    pub const SCHEDULER_REQUEST: &str = "scheduler-request";
    pub const SCHEDULER_CANCEL: &str = "scheduler-cancel";
    pub const CALLBACK_TASK_STATUS: &str = "callback-task-status";
    pub const LIVENESS_HEARTBEAT: &str = "liveness-heartbeat";
}

/// Declares every stream this crate publishes to or consumes from, then the
/// durable consumers TS/TCR/WLM pull from. Safe to call on every process
/// start: `create_or_update_*` is idempotent.
pub async fn ensure_topology(bus: &dyn EventBus, ack_wait: Duration, max_deliver: i64) -> Result<()> {
    bus.create_or_update_stream(StreamConfig {
        name: subjects::streams::FLOW_RUN_EVENTS.to_string(),
        subjects: vec![
            subjects::FLOW_RUN_REQUEST.to_string(),
            subjects::FLOW_RUN_EXECUTE.to_string(),
            subjects::FLOW_RUN_STATUS.to_string(),
        ],
        retention: RetentionPolicy::Limits,
        max_age: None,
    })
    .await?;

    bus.create_or_update_stream(StreamConfig {
        name: subjects::streams::TASK_DISPATCH.to_string(),
        subjects: vec![
            subjects::TASK_DISPATCH_WILDCARD.to_string(),
            subjects::TASK_CANCEL.to_string(),
        ],
        retention: RetentionPolicy::WorkQueue,
        max_age: None,
    })
    .await?;

    bus.create_or_update_stream(StreamConfig {
        name: subjects::streams::TASK_STATUS.to_string(),
        subjects: vec![subjects::TASK_STATUS_WILDCARD.to_string()],
        retention: RetentionPolicy::WorkQueue,
        max_age: None,
    })
    .await?;

    bus.create_or_update_stream(StreamConfig {
        name: subjects::streams::WORKER_HEARTBEAT.to_string(),
        subjects: vec![subjects::WORKER_HEARTBEAT_WILDCARD.to_string()],
        retention: RetentionPolicy::Limits,
        max_age: Some(Duration::from_secs(60 * 10)),
    })
    .await?;

    bus.create_or_update_consumer(
        subjects::streams::FLOW_RUN_EVENTS,
        ConsumerConfig {
            durable_name: consumers::SCHEDULER_EXECUTE.to_string(),
            filter_subject: subjects::FLOW_RUN_EXECUTE.to_string(),
            ack_wait,
            max_deliver,
        },
    )
    .await?;

    bus.create_or_update_consumer(
        subjects::streams::FLOW_RUN_EVENTS,
        ConsumerConfig {
            durable_name: consumers::SCHEDULER_REQUEST.to_string(),
            filter_subject: subjects::FLOW_RUN_REQUEST.to_string(),
            ack_wait,
            max_deliver,
        },
    )
    .await?;

    bus.create_or_update_consumer(
        subjects::streams::TASK_DISPATCH,
        ConsumerConfig {
            durable_name: consumers::SCHEDULER_CANCEL.to_string(),
            filter_subject: subjects::TASK_CANCEL.to_string(),
            ack_wait,
            max_deliver,
        },
    )
    .await?;

    bus.create_or_update_consumer(
        subjects::streams::TASK_STATUS,
        ConsumerConfig {
            durable_name: consumers::CALLBACK_TASK_STATUS.to_string(),
            filter_subject: subjects::TASK_STATUS_WILDCARD.to_string(),
            ack_wait,
            max_deliver,
        },
    )
    .await?;

    bus.create_or_update_consumer(
        subjects::streams::WORKER_HEARTBEAT,
        ConsumerConfig {
            durable_name: consumers::LIVENESS_HEARTBEAT.to_string(),
            filter_subject: subjects::WORKER_HEARTBEAT_WILDCARD.to_string(),
            ack_wait,
            max_deliver,
        },
    )
    .await?;

    Ok(())
}

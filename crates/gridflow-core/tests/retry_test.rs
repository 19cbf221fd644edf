//! A task that fails with retry budget remaining goes back to `PENDING` and
//! is redispatched with an incremented attempt number, rather than failing
//! the flow-run outright.

mod support;

use futures::StreamExt;

use gridflow_bus::{subjects, ConsumerConfig, EventBus};
use gridflow_core::messages::{FlowRunRequestMessage, TaskDispatchMessage, TaskStatusMessage};
use gridflow_db::models::{FlowRunStatus, TaskRunStatus};
use gridflow_db::queries::{flow_runs, flow_task_runs};
use gridflow_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn failed_task_is_retried_then_succeeds() {
    let (pool, db_name) = create_test_db().await;
    let harness = support::setup(pool, support::SINGLE_TASK).await;

    gridflow_core::streams::ensure_topology(
        harness.bus.as_ref(),
        std::time::Duration::from_secs(30),
        3,
    )
    .await
    .unwrap();
    harness
        .bus
        .create_or_update_consumer(
            subjects::streams::TASK_DISPATCH,
            ConsumerConfig {
                durable_name: "probe".to_string(),
                filter_subject: subjects::TASK_DISPATCH_WILDCARD.to_string(),
                ack_wait: std::time::Duration::from_secs(30),
                max_deliver: 3,
            },
        )
        .await
        .unwrap();
    let mut dispatched = harness
        .bus
        .subscribe(subjects::streams::TASK_DISPATCH, "probe")
        .await
        .unwrap();

    let flow_run_id = harness
        .scheduler
        .handle_flow_run_request(FlowRunRequestMessage {
            flow_id: harness.flow_id,
            parameters: serde_json::json!({}),
            user_id: None,
            request_id: None,
        })
        .await
        .unwrap();

    harness.scheduler.drive(flow_run_id).await.unwrap();
    let first = dispatched.next().await.unwrap();
    let first_msg: TaskDispatchMessage = serde_json::from_slice(&first.payload).unwrap();
    assert_eq!(first_msg.attempt, 1);
    first.ack.ack().await.unwrap();

    harness
        .callback
        .handle_task_status(TaskStatusMessage {
            flow_run_id,
            task_name: "only".to_string(),
            attempt: 1,
            worker_id: "worker-1".to_string(),
            status: TaskRunStatus::Failed,
            result_inline: None,
            result_cache_key: None,
            error: Some("transient network error".to_string()),
        })
        .await
        .unwrap();

    let retried = flow_task_runs::get_task_run(&harness.pool, flow_run_id, "only")
        .await
        .unwrap();
    assert_eq!(retried.status, TaskRunStatus::Pending);
    assert_eq!(retried.retry_count, 1);

    harness.scheduler.drive(flow_run_id).await.unwrap();
    let second = dispatched.next().await.unwrap();
    let second_msg: TaskDispatchMessage = serde_json::from_slice(&second.payload).unwrap();
    assert_eq!(second_msg.attempt, 2);
    second.ack.ack().await.unwrap();

    harness
        .callback
        .handle_task_status(TaskStatusMessage {
            flow_run_id,
            task_name: "only".to_string(),
            attempt: 2,
            worker_id: "worker-1".to_string(),
            status: TaskRunStatus::Success,
            result_inline: Some(serde_json::json!({"ok": true})),
            result_cache_key: None,
            error: None,
        })
        .await
        .unwrap();

    harness.scheduler.drive(flow_run_id).await.unwrap();

    let finished = flow_runs::get_flow_run(&harness.pool, flow_run_id).await.unwrap();
    assert_eq!(finished.status, FlowRunStatus::Success);

    drop_test_db(&db_name).await;
    harness.pool.close().await;
}

#[tokio::test]
async fn flow_run_retry_resets_the_whole_graph_and_redrives_it() {
    let (pool, db_name) = create_test_db().await;
    let harness = support::setup(pool, support::SINGLE_TASK).await;

    let flow_run_id = harness
        .scheduler
        .handle_flow_run_request(FlowRunRequestMessage {
            flow_id: harness.flow_id,
            parameters: serde_json::json!({}),
            user_id: None,
            request_id: None,
        })
        .await
        .unwrap();
    harness.scheduler.drive(flow_run_id).await.unwrap();

    // Exhaust the task's own retry budget so the flow-run ends up FAILED.
    for attempt in 1..=4 {
        harness
            .callback
            .handle_task_status(TaskStatusMessage {
                flow_run_id,
                task_name: "only".to_string(),
                attempt,
                worker_id: "worker-1".to_string(),
                status: TaskRunStatus::Failed,
                result_inline: None,
                result_cache_key: None,
                error: Some("boom".to_string()),
            })
            .await
            .unwrap();
        harness.scheduler.drive(flow_run_id).await.unwrap();
    }

    let failed = flow_runs::get_flow_run(&harness.pool, flow_run_id).await.unwrap();
    assert_eq!(failed.status, FlowRunStatus::Failed);

    harness.scheduler.retry_flow_run(flow_run_id).await.unwrap();

    let restarted = flow_runs::get_flow_run(&harness.pool, flow_run_id).await.unwrap();
    assert_eq!(restarted.status, FlowRunStatus::Scheduled);
    assert_eq!(restarted.retry_count, 1);

    let reset_task = flow_task_runs::get_task_run(&harness.pool, flow_run_id, "only")
        .await
        .unwrap();
    assert_eq!(reset_task.status, TaskRunStatus::Pending);
    assert_eq!(reset_task.retry_count, 0);

    harness.scheduler.drive(flow_run_id).await.unwrap();
    let running = flow_runs::get_flow_run(&harness.pool, flow_run_id).await.unwrap();
    assert_eq!(running.status, FlowRunStatus::Running);

    drop_test_db(&db_name).await;
    harness.pool.close().await;
}

#[tokio::test]
async fn retrying_a_flow_run_that_is_not_failed_is_a_conflict() {
    let (pool, db_name) = create_test_db().await;
    let harness = support::setup(pool, support::SINGLE_TASK).await;

    let flow_run_id = harness
        .scheduler
        .handle_flow_run_request(FlowRunRequestMessage {
            flow_id: harness.flow_id,
            parameters: serde_json::json!({}),
            user_id: None,
            request_id: None,
        })
        .await
        .unwrap();

    let err = harness.scheduler.retry_flow_run(flow_run_id).await.unwrap_err();
    assert!(err.is_conflict());

    drop_test_db(&db_name).await;
    harness.pool.close().await;
}

#[tokio::test]
async fn stale_redelivery_below_current_attempt_is_dropped() {
    let (pool, db_name) = create_test_db().await;
    let harness = support::setup(pool, support::SINGLE_TASK).await;

    let flow_run_id = harness
        .scheduler
        .handle_flow_run_request(FlowRunRequestMessage {
            flow_id: harness.flow_id,
            parameters: serde_json::json!({}),
            user_id: None,
            request_id: None,
        })
        .await
        .unwrap();
    harness.scheduler.drive(flow_run_id).await.unwrap();

    harness
        .callback
        .handle_task_status(TaskStatusMessage {
            flow_run_id,
            task_name: "only".to_string(),
            attempt: 1,
            worker_id: "worker-1".to_string(),
            status: TaskRunStatus::Failed,
            result_inline: None,
            result_cache_key: None,
            error: Some("boom".to_string()),
        })
        .await
        .unwrap();

    let after_retry = flow_task_runs::get_task_run(&harness.pool, flow_run_id, "only")
        .await
        .unwrap();
    assert_eq!(after_retry.retry_count, 1);

    // A redelivered attempt-1 message (the original failure, replayed by the
    // bus) must not be allowed to retry the task a second time.
    harness
        .callback
        .handle_task_status(TaskStatusMessage {
            flow_run_id,
            task_name: "only".to_string(),
            attempt: 1,
            worker_id: "worker-1".to_string(),
            status: TaskRunStatus::Failed,
            result_inline: None,
            result_cache_key: None,
            error: Some("boom".to_string()),
        })
        .await
        .unwrap();

    let unchanged = flow_task_runs::get_task_run(&harness.pool, flow_run_id, "only")
        .await
        .unwrap();
    assert_eq!(unchanged.retry_count, 1);

    drop_test_db(&db_name).await;
    harness.pool.close().await;
}

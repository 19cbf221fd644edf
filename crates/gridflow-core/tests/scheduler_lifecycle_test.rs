//! End-to-end drive-loop coverage over a real Postgres instance: request
//! intake through dispatch, worker callbacks, and final completion.

mod support;

use futures::StreamExt;

use gridflow_bus::{subjects, ConsumerConfig, EventBus};
use gridflow_core::messages::{FlowRunRequestMessage, TaskDispatchMessage, TaskStatusMessage};
use gridflow_db::models::{FlowRunStatus, TaskRunStatus};
use gridflow_db::queries::flow_runs;
use gridflow_test_utils::{create_test_db, drop_test_db};

async fn dispatch_probe(bus: &gridflow_test_utils::LocalBus) -> gridflow_bus::MessageStream {
    bus.create_or_update_consumer(
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
    bus.subscribe(subjects::streams::TASK_DISPATCH, "probe")
        .await
        .unwrap()
}

#[tokio::test]
async fn linear_chain_runs_both_tasks_to_completion() {
    let (pool, db_name) = create_test_db().await;
    let harness = support::setup(pool, support::LINEAR_CHAIN).await;

    gridflow_core::streams::ensure_topology(
        harness.bus.as_ref(),
        std::time::Duration::from_secs(30),
        3,
    )
    .await
    .unwrap();
    let mut dispatched = dispatch_probe(&harness.bus).await;

    let flow_run_id = harness
        .scheduler
        .handle_flow_run_request(FlowRunRequestMessage {
            flow_id: harness.flow_id,
            parameters: serde_json::json!({}),
            user_id: None,
            request_id: Some("req-linear".to_string()),
        })
        .await
        .expect("accept request");

    harness.scheduler.drive(flow_run_id).await.expect("drive to dispatch a");

    let delivered = dispatched.next().await.expect("task a dispatched");
    let msg: TaskDispatchMessage = serde_json::from_slice(&delivered.payload).unwrap();
    assert_eq!(msg.task_name, "a");
    assert_eq!(msg.attempt, 1);
    assert!(msg.dependency_results.is_empty());
    delivered.ack.ack().await.unwrap();

    harness
        .callback
        .handle_task_status(TaskStatusMessage {
            flow_run_id,
            task_name: "a".to_string(),
            attempt: 1,
            worker_id: "worker-1".to_string(),
            status: TaskRunStatus::Success,
            result_inline: Some(serde_json::json!({"ok": true})),
            result_cache_key: None,
            error: None,
        })
        .await
        .expect("record a success");

    harness.scheduler.drive(flow_run_id).await.expect("drive to dispatch b");

    let delivered_b = dispatched.next().await.expect("task b dispatched");
    let msg_b: TaskDispatchMessage = serde_json::from_slice(&delivered_b.payload).unwrap();
    assert_eq!(msg_b.task_name, "b");
    assert_eq!(
        msg_b.dependency_results.get("a").map(String::as_str),
        Some(gridflow_core::callback::cache_key(flow_run_id, "a")).as_deref()
    );
    delivered_b.ack.ack().await.unwrap();

    harness
        .callback
        .handle_task_status(TaskStatusMessage {
            flow_run_id,
            task_name: "b".to_string(),
            attempt: 1,
            worker_id: "worker-1".to_string(),
            status: TaskRunStatus::Success,
            result_inline: None,
            result_cache_key: Some("result_cache/manual/b.json".to_string()),
            error: None,
        })
        .await
        .expect("record b success");

    harness.scheduler.drive(flow_run_id).await.expect("finalize");

    let finished = flow_runs::get_flow_run(&harness.pool, flow_run_id).await.unwrap();
    assert_eq!(finished.status, FlowRunStatus::Success);
    assert!(finished.finished_at.is_some());

    drop_test_db(&db_name).await;
    harness.pool.close().await;
}

#[tokio::test]
async fn diamond_dispatches_both_middle_tasks_once_root_succeeds() {
    let (pool, db_name) = create_test_db().await;
    let harness = support::setup(pool, support::DIAMOND).await;

    gridflow_core::streams::ensure_topology(
        harness.bus.as_ref(),
        std::time::Duration::from_secs(30),
        3,
    )
    .await
    .unwrap();
    let mut dispatched = dispatch_probe(&harness.bus).await;

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
    let root = dispatched.next().await.unwrap();
    let root_msg: TaskDispatchMessage = serde_json::from_slice(&root.payload).unwrap();
    assert_eq!(root_msg.task_name, "a");
    root.ack.ack().await.unwrap();

    harness
        .callback
        .handle_task_status(TaskStatusMessage {
            flow_run_id,
            task_name: "a".to_string(),
            attempt: 1,
            worker_id: "worker-1".to_string(),
            status: TaskRunStatus::Success,
            result_inline: None,
            result_cache_key: Some("result_cache/manual/a.json".to_string()),
            error: None,
        })
        .await
        .unwrap();

    harness.scheduler.drive(flow_run_id).await.unwrap();

    let mut names = Vec::new();
    for _ in 0..2 {
        let delivered = dispatched.next().await.unwrap();
        let msg: TaskDispatchMessage = serde_json::from_slice(&delivered.payload).unwrap();
        names.push(msg.task_name.clone());
        delivered.ack.ack().await.unwrap();
    }
    names.sort();
    assert_eq!(names, vec!["b".to_string(), "c".to_string()]);

    drop_test_db(&db_name).await;
    harness.pool.close().await;
}

#[tokio::test]
async fn zero_task_flow_run_goes_straight_to_success() {
    let (pool, db_name) = create_test_db().await;
    let harness = support::setup(pool, support::EMPTY).await;

    let flow_run_id = harness
        .scheduler
        .handle_flow_run_request(FlowRunRequestMessage {
            flow_id: harness.flow_id,
            parameters: serde_json::json!({}),
            user_id: None,
            request_id: None,
        })
        .await
        .expect("accept request");

    harness
        .scheduler
        .drive(flow_run_id)
        .await
        .expect("drive an empty graph straight through");

    let finished = flow_runs::get_flow_run(&harness.pool, flow_run_id).await.unwrap();
    assert_eq!(finished.status, FlowRunStatus::Success);
    assert!(finished.started_at.is_some());
    assert!(finished.finished_at.is_some());
    assert_eq!(finished.task_statuses, serde_json::json!({}));

    drop_test_db(&db_name).await;
    harness.pool.close().await;
}

#[tokio::test]
async fn duplicate_flow_run_request_is_rejected_not_double_dispatched() {
    let (pool, db_name) = create_test_db().await;
    let harness = support::setup(pool, support::SINGLE_TASK).await;

    let request = FlowRunRequestMessage {
        flow_id: harness.flow_id,
        parameters: serde_json::json!({}),
        user_id: None,
        request_id: Some("dup-req".to_string()),
    };

    let first = harness
        .scheduler
        .handle_flow_run_request(request.clone())
        .await
        .expect("first request accepted");

    let second = harness.scheduler.handle_flow_run_request(request).await;
    assert!(second.is_err());
    assert!(second.unwrap_err().is_conflict());

    let run = flow_runs::get_flow_run(&harness.pool, first).await.unwrap();
    assert_eq!(run.status, FlowRunStatus::Scheduled);

    drop_test_db(&db_name).await;
    harness.pool.close().await;
}

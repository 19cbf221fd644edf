//! `drive` is safe to call redundantly, the property the restart-recovery
//! path and at-least-once `flow.run.execute` redelivery both depend on.

mod support;

use gridflow_core::messages::FlowRunRequestMessage;
use gridflow_db::models::FlowRunStatus;
use gridflow_db::queries::{flow_runs, flow_task_runs};
use gridflow_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn redundant_drive_after_materialization_does_not_duplicate_task_runs() {
    let (pool, db_name) = create_test_db().await;
    let harness = support::setup(pool, support::LINEAR_CHAIN).await;

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

    // First drive: SCHEDULED -> PENDING -> RUNNING, task rows created.
    harness.scheduler.drive(flow_run_id).await.unwrap();
    let rows_after_first = flow_task_runs::list_task_runs_for_flow_run(&harness.pool, flow_run_id)
        .await
        .unwrap();
    assert_eq!(rows_after_first.len(), 2);

    // A redelivered `flow.run.execute` (or a restart-recovery pass) re-enters
    // `drive` on an already-RUNNING flow-run; it must not re-insert rows or
    // error.
    harness.scheduler.drive(flow_run_id).await.unwrap();
    harness.scheduler.drive(flow_run_id).await.unwrap();

    let rows_after_replay = flow_task_runs::list_task_runs_for_flow_run(&harness.pool, flow_run_id)
        .await
        .unwrap();
    assert_eq!(rows_after_replay.len(), 2);

    let run = flow_runs::get_flow_run(&harness.pool, flow_run_id).await.unwrap();
    assert_eq!(run.status, FlowRunStatus::Running);

    drop_test_db(&db_name).await;
    harness.pool.close().await;
}

#[tokio::test]
async fn sweep_of_a_healthy_flow_run_is_a_no_op() {
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

    let stuck = harness.scheduler.sweep_stuck_flow_runs().await.unwrap();
    assert_eq!(stuck, 0);

    let run = flow_runs::get_flow_run(&harness.pool, flow_run_id).await.unwrap();
    assert_eq!(run.status, FlowRunStatus::Running);

    drop_test_db(&db_name).await;
    harness.pool.close().await;
}

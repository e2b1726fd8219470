//! Orphan detection and retention over a real history store.

mod common;

use common::open_engine;
use flowy::{
    config::SchedulerConfig,
    runtime::{OrphanDetector, RetentionCleaner, RetentionReport},
    store::{FlowStatus, TaskStatus},
    FlowMetadata,
};
use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;

fn timeouts(pending_secs: u64, running_secs: u64) -> SchedulerConfig {
    SchedulerConfig {
        pending_timeout_secs: pending_secs,
        running_timeout_secs: running_secs,
        scan_batch_size: 2,
        ..SchedulerConfig::default()
    }
}

#[tokio::test]
async fn test_old_pending_rows_fail_young_ones_survive() {
    let (_dir, flowy) = open_engine().await;
    let history = flowy.history_store().clone();
    let metadata = FlowMetadata::default().to_document();

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(
            history
                .create_flow_history("f", FlowStatus::Pending, &metadata, None, None)
                .await
                .unwrap(),
        );
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Generous timeout: everything is still young
    let report = OrphanDetector::new(history.clone(), &timeouts(3600, 3600))
        .run_once(&HashSet::new())
        .await
        .unwrap();
    assert_eq!(report.total(), 0);

    // Zero timeout: everything is old except rows with a live job
    let live: HashSet<i64> = [ids[1]].into_iter().collect();
    let report = OrphanDetector::new(history.clone(), &timeouts(0, 3600))
        .run_once(&live)
        .await
        .unwrap();
    assert_eq!(report.pending_failed, 4);

    for id in &ids {
        let row = history.get_flow_history(*id).await.unwrap().unwrap();
        if *id == ids[1] {
            assert_eq!(row.status, FlowStatus::Pending);
        } else {
            assert_eq!(row.status, FlowStatus::Failed);
            assert_eq!(row.output_data.unwrap()["kind"], "Orphaned");
            assert!(row.end_time.is_some());
        }
    }
}

#[tokio::test]
async fn test_stale_running_rows_and_task_reconciliation() {
    let (_dir, flowy) = open_engine().await;
    let history = flowy.history_store().clone();
    let metadata = FlowMetadata::default().to_document();

    let idle = history
        .create_flow_history("f", FlowStatus::Running, &metadata, None, Some(Utc::now()))
        .await
        .unwrap();
    let busy = history
        .create_flow_history("f", FlowStatus::Running, &metadata, None, Some(Utc::now()))
        .await
        .unwrap();
    let busy_task = history.create_task_history(busy, "work", None, Utc::now()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let detector = OrphanDetector::new(history.clone(), &timeouts(3600, 0));
    let report = detector.run_once(&HashSet::new()).await.unwrap();
    assert_eq!(report.running_failed, 1);
    assert_eq!(report.tasks_reconciled, 0);
    assert_eq!(history.get_flow_history(idle).await.unwrap().unwrap().status, FlowStatus::Failed);
    assert_eq!(history.get_flow_history(busy).await.unwrap().unwrap().status, FlowStatus::Running);

    // Parent finishes without closing its task: the task follows the parent
    let end = Utc::now();
    assert!(history
        .finalize_flow_history(busy, FlowStatus::Completed, &json!({ "result": null }), end)
        .await
        .unwrap());
    let report = detector.run_once(&HashSet::new()).await.unwrap();
    assert_eq!(report.tasks_reconciled, 1);

    let task = history.get_task_history(busy_task).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.end_time.is_some());

    // A second pass has nothing left to do
    assert_eq!(detector.run_once(&HashSet::new()).await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_orphaned_pending_row_fails_its_running_tasks() {
    let (_dir, flowy) = open_engine().await;
    let history = flowy.history_store().clone();
    let metadata = FlowMetadata::default().to_document();

    let id = history
        .create_flow_history("f", FlowStatus::Pending, &metadata, None, None)
        .await
        .unwrap();
    let task = history.create_task_history(id, "t", None, Utc::now()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    OrphanDetector::new(history.clone(), &timeouts(0, 3600))
        .run_once(&HashSet::new())
        .await
        .unwrap();
    assert_eq!(history.get_task_history(task).await.unwrap().unwrap().status, TaskStatus::Failed);
    assert_eq!(history.running_task_count(id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_retention_removes_old_terminal_rows_and_logs() {
    let (_dir, flowy) = open_engine().await;
    let history = flowy.history_store().clone();
    let logs = flowy.logs().clone();
    let metadata = FlowMetadata::default().to_document();

    let done = history
        .create_flow_history("f", FlowStatus::Running, &metadata, None, Some(Utc::now()))
        .await
        .unwrap();
    history.create_task_history(done, "t", None, Utc::now()).await.unwrap();
    history
        .finalize_flow_history(done, FlowStatus::Completed, &json!({}), Utc::now())
        .await
        .unwrap();
    let active = history
        .create_flow_history("f", FlowStatus::Running, &metadata, None, Some(Utc::now()))
        .await
        .unwrap();

    logs.append(done, "INFO", "old line").await.unwrap();
    logs.release(done).await;
    logs.append(active, "INFO", "still open").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = RetentionCleaner::new(history.clone(), logs.clone(), chrono::Duration::zero(), 1)
        .run_once()
        .await
        .unwrap();
    assert_eq!(report.flows_deleted, 1);
    assert_eq!(report.logs_deleted, 1);

    assert!(history.get_flow_history(done).await.unwrap().is_none());
    assert!(history.list_task_histories(done).await.unwrap().is_empty());
    assert!(history.get_flow_history(active).await.unwrap().is_some());
    assert!(logs.read(done).await.unwrap().is_none());
    assert!(logs.read(active).await.unwrap().is_some());

    // Window wider than the data: nothing goes
    let report = RetentionCleaner::new(history, logs, chrono::Duration::days(30), 10)
        .run_once()
        .await
        .unwrap();
    assert_eq!(report, RetentionReport::default());
}

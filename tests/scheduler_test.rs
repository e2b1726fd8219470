//! Scheduler service: reconciliation, concurrency caps, ad-hoc runs and
//! trigger administration.

mod common;

use common::{open_engine, wait_for_status};
use flowy::{
    runtime::{trigger_job_id, JobKind, SkipReason},
    store::FlowStatus,
    FireOutcome, FlowDefinition, FlowyError, NewTrigger, TriggerUpdate,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Far enough away that no test ever sees a real firing
const NEVER: &str = "0 0 1 1 *";

async fn define_noop(flowy: &flowy::Flowy, id: &str) {
    flowy
        .define(FlowDefinition::new(id, id, |_: Value| async move { Ok::<_, anyhow::Error>(()) }))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconcile_is_idempotent() {
    let (_dir, flowy) = open_engine().await;
    define_noop(&flowy, "nightly").await;

    // Created while stopped: stored only, picked up by the first reconcile
    let a = flowy
        .triggers()
        .create_trigger(NewTrigger::new("nightly", "a", NEVER))
        .await
        .unwrap();
    let b = flowy
        .triggers()
        .create_trigger(NewTrigger::new("nightly", "b", "0 0 0 1 1 *"))
        .await
        .unwrap();
    assert!(flowy.job_status(&trigger_job_id(a.id)).await.is_none());

    flowy.start().await.unwrap();
    assert!(flowy.job_status(&trigger_job_id(a.id)).await.is_some());
    assert!(flowy.job_status(&trigger_job_id(b.id)).await.is_some());

    let first = flowy.scheduler().reconcile().await.unwrap();
    let second = flowy.scheduler().reconcile().await.unwrap();
    assert_eq!(first.actions(), 0);
    assert_eq!(second.actions(), 0);

    // Disable through the service, then reconcile again: nothing to repair
    flowy.triggers().set_enabled(a.id, false).await.unwrap();
    let status = flowy.job_status(&trigger_job_id(a.id)).await.unwrap();
    assert!(status.paused);
    assert_eq!(status.kind, JobKind::Cron);
    assert_eq!(flowy.scheduler().reconcile().await.unwrap().actions(), 0);

    flowy.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconcile_repairs_drift() {
    let (_dir, flowy) = open_engine().await;
    define_noop(&flowy, "drift").await;
    flowy.start().await.unwrap();

    let trigger = flowy
        .triggers()
        .create_trigger(NewTrigger::new("drift", "t", NEVER))
        .await
        .unwrap();
    let job_id = trigger_job_id(trigger.id);

    // Drop the live job behind the service's back
    assert!(flowy.scheduler().remove_job(trigger.id).await.unwrap());
    let report = flowy.scheduler().reconcile().await.unwrap();
    assert_eq!(report.created, 1);
    assert!(flowy.job_status(&job_id).await.is_some());

    // Pause the live job while the row stays enabled
    flowy.scheduler().pause_job(trigger.id).await;
    let report = flowy.scheduler().reconcile().await.unwrap();
    assert_eq!(report.resumed, 1);
    assert!(!flowy.job_status(&job_id).await.unwrap().paused);

    // Schedule change replaces the job in place
    flowy
        .triggers()
        .update_trigger(
            trigger.id,
            TriggerUpdate {
                cron_expression: Some("30 4 * * 1-5".to_string()),
                ..TriggerUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(flowy.scheduler().reconcile().await.unwrap().actions(), 0);

    // Deleting the row removes the job
    flowy.triggers().delete_trigger(trigger.id).await.unwrap();
    assert!(flowy.job_status(&job_id).await.is_none());
    assert!(flowy.scheduler().job_ids().await.is_empty());

    flowy.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconcile_follows_rows_edited_in_the_store() {
    let (_dir, flowy) = open_engine().await;
    define_noop(&flowy, "edited").await;
    flowy.start().await.unwrap();

    let trigger = flowy
        .triggers()
        .create_trigger(NewTrigger::new("edited", "t", NEVER))
        .await
        .unwrap();
    let job_id = trigger_job_id(trigger.id);
    let store = flowy.definition_store();

    // Schedule edited directly in the store: replaced once, then stable
    store
        .update_trigger(
            trigger.id,
            &TriggerUpdate {
                cron_expression: Some("*/15 8-18 * * 1-5".to_string()),
                ..TriggerUpdate::default()
            },
        )
        .await
        .unwrap();
    let report = flowy.scheduler().reconcile().await.unwrap();
    assert_eq!(report.replaced, 1);
    assert_eq!(report.actions(), 1);
    assert_eq!(flowy.scheduler().reconcile().await.unwrap().actions(), 0);

    store
        .update_trigger(
            trigger.id,
            &TriggerUpdate {
                max_instances: Some(3),
                ..TriggerUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(flowy.scheduler().reconcile().await.unwrap().replaced, 1);
    assert_eq!(flowy.scheduler().reconcile().await.unwrap().actions(), 0);

    // Disabled row with a running job gets paused
    assert!(store.set_trigger_enabled(trigger.id, false).await.unwrap());
    let report = flowy.scheduler().reconcile().await.unwrap();
    assert_eq!(report.paused, 1);
    assert!(flowy.job_status(&job_id).await.unwrap().paused);
    assert_eq!(flowy.scheduler().reconcile().await.unwrap().actions(), 0);

    // Row deleted behind the service: the live job goes too
    assert!(store.delete_trigger(trigger.id).await.unwrap());
    let report = flowy.scheduler().reconcile().await.unwrap();
    assert_eq!(report.removed, 1);
    assert!(flowy.job_status(&job_id).await.is_none());
    assert!(report.errors.is_empty());

    flowy.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_max_instances_holds_across_restart() {
    let (_dir, flowy) = open_engine().await;
    flowy
        .define(FlowDefinition::new("long", "Long", |_: Value| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, anyhow::Error>(())
        }))
        .await
        .unwrap();
    flowy.start().await.unwrap();

    let trigger = flowy
        .triggers()
        .create_trigger(NewTrigger::new("long", "single", NEVER).with_max_instances(1))
        .await
        .unwrap();
    let FireOutcome::Started(handle) = flowy.scheduler().fire_trigger(trigger.id).await.unwrap() else {
        panic!("first firing should start");
    };

    flowy.scheduler().stop().await.unwrap();
    flowy.scheduler().start().await.unwrap();
    assert_eq!(flowy.job_status(&trigger_job_id(trigger.id)).await.unwrap().in_flight, 1);
    let outcome = flowy.scheduler().fire_trigger(trigger.id).await.unwrap();
    assert!(matches!(outcome, FireOutcome::Skipped(SkipReason::MaxInstances)));

    handle.await.unwrap();
    let FireOutcome::Started(handle) = flowy.scheduler().fire_trigger(trigger.id).await.unwrap() else {
        panic!("firing after the run finished should start");
    };
    handle.await.unwrap();

    flowy.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_max_instances_skips_overlapping_firing() {
    let (_dir, flowy) = open_engine().await;
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    flowy
        .define(FlowDefinition::new("slow", "Slow", move |_: Value| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok::<_, anyhow::Error>(())
            }
        }))
        .await
        .unwrap();
    flowy.start().await.unwrap();

    let trigger = flowy
        .triggers()
        .create_trigger(NewTrigger::new("slow", "capped", NEVER).with_max_instances(1))
        .await
        .unwrap();

    let first = flowy.scheduler().fire_trigger(trigger.id).await.unwrap();
    let second = flowy.scheduler().fire_trigger(trigger.id).await.unwrap();
    assert!(matches!(second, FireOutcome::Skipped(SkipReason::MaxInstances)));

    let FireOutcome::Started(handle) = first else {
        panic!("first firing should start");
    };
    handle.await.unwrap();

    // Slot freed once the first execution finished
    let third = flowy.scheduler().fire_trigger(trigger.id).await.unwrap();
    let FireOutcome::Started(handle) = third else {
        panic!("third firing should start");
    };
    handle.await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    let page = flowy.flow_history(Some("slow"), None, 1, 10).await.unwrap();
    assert_eq!(page.total, 2);
    let row = &page.items[0];
    assert_eq!(row.status, FlowStatus::Completed);
    assert_eq!(row.flow_metadata["trigger_type"], "scheduled");
    assert_eq!(row.flow_metadata["trigger_id"], trigger.id);
    assert_eq!(row.flow_metadata["trigger_name"], "capped");

    flowy.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disabled_trigger_firing_is_skipped() {
    let (_dir, flowy) = open_engine().await;
    define_noop(&flowy, "quiet").await;
    flowy.start().await.unwrap();

    let trigger = flowy
        .triggers()
        .create_trigger(NewTrigger::new("quiet", "t", NEVER))
        .await
        .unwrap();
    flowy.triggers().set_enabled(trigger.id, false).await.unwrap();

    let outcome = flowy.scheduler().fire_trigger(trigger.id).await.unwrap();
    assert!(matches!(outcome, FireOutcome::Skipped(SkipReason::Paused)));
    let outcome = flowy.scheduler().fire_trigger(9999).await.unwrap();
    assert!(matches!(outcome, FireOutcome::Skipped(SkipReason::NoLiveJob)));

    flowy.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_schedule_now_promotes_the_pending_row() {
    let (_dir, flowy) = open_engine().await;
    flowy
        .define(FlowDefinition::new("adhoc", "Adhoc", |args: Value| async move {
            Ok::<_, anyhow::Error>(args["x"].as_i64().unwrap_or(0) * 3)
        }))
        .await
        .unwrap();

    // Starts the scheduler on demand
    let handle = flowy
        .schedule_now("adhoc", json!({ "x": 4 }), Some(Duration::from_millis(200)))
        .await
        .unwrap();
    assert!(flowy.scheduler().is_running().await);
    assert_eq!(handle.job_id, format!("adhoc_{}", handle.flow_history_id));

    let row = flowy
        .history_store()
        .get_flow_history(handle.flow_history_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.flow_metadata["trigger_type"], "immediate");

    assert!(wait_for_status(&flowy, handle.flow_history_id, FlowStatus::Completed, Duration::from_secs(10)).await);

    let page = flowy.flow_history(Some("adhoc"), None, 1, 10).await.unwrap();
    assert_eq!(page.total, 1);
    let row = &page.items[0];
    assert_eq!(row.id, handle.flow_history_id);
    assert_eq!(row.output_data, Some(json!({ "result": 12 })));
    assert_eq!(row.flow_metadata["flow_history_id"], handle.flow_history_id);

    flowy.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_schedule_now_rejects_unknown_flow() {
    let (_dir, flowy) = open_engine().await;
    let err = flowy.schedule_now("ghost", json!({}), None).await.unwrap_err();
    assert!(matches!(err, FlowyError::NotFound { .. }));
    assert_eq!(flowy.flow_history(None, None, 1, 10).await.unwrap().total, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_trigger_validation() {
    let (_dir, flowy) = open_engine().await;
    define_noop(&flowy, "target").await;
    let triggers = flowy.triggers();

    let bad_cron = triggers
        .create_trigger(NewTrigger::new("target", "bad", "every day at noon"))
        .await;
    assert!(matches!(bad_cron, Err(FlowyError::Validation(_))));

    let zero = triggers
        .create_trigger(NewTrigger::new("target", "zero", NEVER).with_max_instances(0))
        .await;
    assert!(matches!(zero, Err(FlowyError::Validation(_))));

    let unnamed = triggers.create_trigger(NewTrigger::new("target", "  ", NEVER)).await;
    assert!(matches!(unnamed, Err(FlowyError::Validation(_))));

    let unknown_flow = triggers.create_trigger(NewTrigger::new("nope", "x", NEVER)).await;
    assert!(matches!(unknown_flow, Err(FlowyError::Validation(_))));

    assert!(triggers.list_triggers_for_flow("target").await.unwrap().is_empty());

    let missing = triggers.update_trigger(42, TriggerUpdate::default()).await;
    assert!(matches!(missing, Err(FlowyError::NotFound { .. })));
    assert!(matches!(triggers.delete_trigger(42).await, Err(FlowyError::NotFound { .. })));
    assert!(matches!(triggers.set_enabled(42, true).await, Err(FlowyError::NotFound { .. })));

    let ok = triggers
        .create_trigger(
            NewTrigger::new("target", "weekdays", "0 9 * * 1-5")
                .with_params(json!({ "mode": "full" }))
                .with_max_instances(2),
        )
        .await
        .unwrap();
    let stored = triggers.get_trigger(ok.id).await.unwrap().unwrap();
    assert!(stored.enabled);
    assert_eq!(stored.max_instances, 2);
    assert_eq!(stored.trigger_params, json!({ "mode": "full" }));

    let bad_update = triggers
        .update_trigger(
            ok.id,
            TriggerUpdate {
                cron_expression: Some("* *".to_string()),
                ..TriggerUpdate::default()
            },
        )
        .await;
    assert!(matches!(bad_update, Err(FlowyError::Validation(_))));
    assert_eq!(triggers.get_trigger(ok.id).await.unwrap().unwrap().cron_expression, "0 9 * * 1-5");
}

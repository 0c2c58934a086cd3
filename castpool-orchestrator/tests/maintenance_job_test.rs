mod common;

use castpool_common::bus::{vm_idle_source, AlertLevel, PoolEvent};
use castpool_common::{PoolConfigPatch, VmStatus};
use castpool_orchestrator::maintenance_job::MaintenanceJob;
use chrono::{Duration as ChronoDuration, Utc};
use common::harness;

#[tokio::test]
async fn idle_vms_are_reported_once() {
    let h = harness(2, 0).await;
    h.pool
        .update_config(&PoolConfigPatch {
            warm_count: Some(1),
            cold_count: Some(0),
            ..Default::default()
        })
        .await
        .unwrap();
    h.pool.assign_vm("comp-1", Some("vm-run0")).await.unwrap();
    let job = MaintenanceJob::new(h.pool.clone(), h.alerts.clone(), h.events.clone());
    let mut events = h.pool.subscribe_events();

    let fresh = job.run_once(Utc::now()).await;
    assert!(fresh.reconciled);
    assert!(fresh.newly_idle.is_empty());

    let later = Utc::now() + ChronoDuration::hours(2);
    let summary = job.run_once(later).await;
    assert_eq!(summary.newly_idle, vec!["vm-run0".to_string(), "vm-run1".to_string()]);

    // Only the assigned one produces an alert.
    let created = h.alerts.created.lock().unwrap().clone();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].0, "comp-1");
    assert_eq!(created[0].1.source_id, vm_idle_source("vm-run0"));
    assert_eq!(created[0].1.level, AlertLevel::Info);

    let mut idle_events = 0;
    while let Ok(evt) = events.try_recv() {
        if let PoolEvent::VmIdle { idle_minutes, .. } = evt {
            assert!(idle_minutes >= 119);
            idle_events += 1;
        }
    }
    assert_eq!(idle_events, 2);

    let again = job.run_once(later).await;
    assert!(again.newly_idle.is_empty());
    assert_eq!(h.alerts.created.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn in_use_vms_are_never_idle() {
    let h = harness(1, 0).await;
    h.pool
        .update_config(&PoolConfigPatch {
            warm_count: Some(1),
            cold_count: Some(0),
            ..Default::default()
        })
        .await
        .unwrap();
    h.pool.assign_vm("comp-1", None).await.unwrap();
    h.pool.mark_vm_in_use("vm-run0").await.unwrap();

    let job = MaintenanceJob::new(h.pool.clone(), h.alerts.clone(), h.events.clone());
    let summary = job.run_once(Utc::now() + ChronoDuration::hours(5)).await;
    assert!(summary.newly_idle.is_empty());
}

#[tokio::test(start_paused = true)]
async fn tops_up_the_warm_pool() {
    let h = harness(0, 3).await;
    let job = MaintenanceJob::new(h.pool.clone(), h.alerts.clone(), h.events.clone());

    let summary = job.run_once(Utc::now()).await;
    assert_eq!(summary.started, 2);
    h.pool.tasks().wait_idle().await;
    assert_eq!(h.pool.get_pool_status().await.counts.available, 2);

    let summary = job.run_once(Utc::now()).await;
    assert_eq!(summary.started, 0);
}

#[tokio::test]
async fn recovers_from_a_provider_outage() {
    let h = harness(1, 0).await;
    h.mock.remove_instance("i-run0").await;
    for _ in 0..3 {
        h.mock
            .fail_next_api(castpool_providers::mock::OP_DESCRIBE, "UnauthorizedOperation")
            .await;
    }
    let job = MaintenanceJob::new(h.pool.clone(), h.alerts.clone(), h.events.clone());

    let summary = job.run_once(Utc::now()).await;
    assert!(!summary.reconciled);
    assert_eq!(h.pool.get_vm("vm-run0").await.map(|vm| vm.status), Some(VmStatus::Available));

    // Injected failures were consumed one per pass (not retryable).
    job.run_once(Utc::now()).await;
    job.run_once(Utc::now()).await;
    let summary = job.run_once(Utc::now()).await;
    assert!(summary.reconciled);
    assert!(h.pool.get_vm("vm-run0").await.is_none());
}

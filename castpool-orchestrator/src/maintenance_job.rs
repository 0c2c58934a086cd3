use castpool_common::bus::{vm_idle_source, AlertLevel, NewAlert, PoolEvent};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::alerts::AlertSink;
use crate::events::EventBus;
use crate::pool_manager::PoolManager;

/// job-maintenance: reconcile, keep the warm pool topped up, surface idle VMs.
pub async fn run(job: Arc<MaintenanceJob>, period: std::time::Duration) {
    let mut interval = tokio::time::interval(period);
    tracing::info!(period_secs = period.as_secs(), "🧹 job-maintenance started");

    loop {
        interval.tick().await;
        job.run_once(Utc::now()).await;
    }
}

pub struct MaintenanceJob {
    pool: Arc<PoolManager>,
    alerts: Arc<dyn AlertSink>,
    events: EventBus,
    // VMs already reported idle; cleared once they leave the idle set.
    reported_idle: Mutex<HashSet<String>>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct MaintenanceSummary {
    pub reconciled: bool,
    pub started: usize,
    pub newly_idle: Vec<String>,
}

impl MaintenanceJob {
    pub fn new(pool: Arc<PoolManager>, alerts: Arc<dyn AlertSink>, events: EventBus) -> Self {
        Self {
            pool,
            alerts,
            events,
            reported_idle: Mutex::new(HashSet::new()),
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> MaintenanceSummary {
        let mut summary = MaintenanceSummary::default();

        match self.pool.reconcile().await {
            Ok(report) => {
                summary.reconciled = true;
                if report.added + report.removed + report.corrected > 0 {
                    tracing::info!(
                        added = report.added,
                        removed = report.removed,
                        corrected = report.corrected,
                        "job-maintenance: pool reconciled"
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "job-maintenance: reconcile failed"),
        }

        match self.pool.ensure_min_warm_vms().await {
            Ok(outcomes) => summary.started = outcomes.iter().filter(|o| o.started).count(),
            Err(e) => tracing::warn!(error = %e, "job-maintenance: ensure-warm failed"),
        }

        summary.newly_idle = self.report_idle(now).await;
        summary
    }

    async fn report_idle(&self, now: DateTime<Utc>) -> Vec<String> {
        let idle = self.pool.idle_vms(now).await;
        let idle_ids: HashSet<String> = idle.iter().map(|vm| vm.vm_id.clone()).collect();

        let mut reported = self.reported_idle.lock().await;
        reported.retain(|vm_id| idle_ids.contains(vm_id));

        let mut newly = Vec::new();
        for vm in idle {
            if !reported.insert(vm.vm_id.clone()) {
                continue;
            }
            let idle_minutes = (now - vm.last_state_change).num_minutes();
            self.events.publish(PoolEvent::VmIdle {
                vm_id: vm.vm_id.clone(),
                idle_minutes,
            });
            if let Some(workload_id) = vm.assigned_to.as_deref() {
                let alert = NewAlert {
                    level: AlertLevel::Info,
                    category: "cost".to_string(),
                    title: "VM idle".to_string(),
                    message: format!(
                        "VM {} has been assigned without activity for {} minutes",
                        vm.name, idle_minutes
                    ),
                    source_id: vm_idle_source(&vm.vm_id),
                    metadata: serde_json::json!({ "vmId": vm.vm_id, "idleMinutes": idle_minutes }),
                };
                if let Err(e) = self.alerts.create_alert(workload_id, alert).await {
                    tracing::warn!(vm_id = %vm.vm_id, workload_id, error = %e, "failed to raise idle alert");
                }
            }
            newly.push(vm.vm_id);
        }
        newly
    }
}

//! Health monitor: periodic probe of every running VM, streak thresholds, alerts.
//!
//! One pass/fail streak per VM: a probe passes when the status endpoint answers and
//! reports the control plane connected. The alert raised on a threshold crossing
//! depends on which of the two conditions failed.

use castpool_common::bus::{
    health_alert_sources, obs_disconnected_source, vm_unreachable_source, AlertLevel, NewAlert, PoolEvent,
};
use castpool_common::{VmRecord, VmServices, VmStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::alerts::AlertSink;
use crate::events::EventBus;
use crate::pool_manager::{HealthVerdict, PoolError, PoolManager};
use crate::resource_client::{ResourceClient, DEFAULT_PROBE_TIMEOUT};

const RESOLVED_BY: &str = "health-monitor";

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub unhealthy_threshold: u32,
    pub recovery_threshold: u32,
    pub probe_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            unhealthy_threshold: 3,
            recovery_threshold: 2,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Process-local streak state for one VM.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmHealthState {
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub last_result: Option<VmServices>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub vm_id: String,
    pub healthy: bool,
    pub services: VmServices,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transitioned_to: Option<VmStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatusReport {
    pub running: bool,
    pub unhealthy_threshold: u32,
    pub recovery_threshold: u32,
    pub vms: BTreeMap<String, VmHealthState>,
}

pub struct HealthMonitor {
    pool: Arc<PoolManager>,
    client: Arc<ResourceClient>,
    alerts: Arc<dyn AlertSink>,
    events: EventBus,
    config: HealthMonitorConfig,
    streaks: Mutex<BTreeMap<String, VmHealthState>>,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        pool: Arc<PoolManager>,
        client: Arc<ResourceClient>,
        alerts: Arc<dyn AlertSink>,
        events: EventBus,
        config: HealthMonitorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            client,
            alerts,
            events,
            config,
            streaks: Mutex::new(BTreeMap::new()),
            handle: StdMutex::new(None),
        })
    }

    fn handle_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn the control loop. Calling it twice keeps the running loop.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.handle_slot();
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        let this = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            tracing::info!("🏥 health monitor started");
            loop {
                this.check_all().await;
                // Interval is re-read every tick so config updates apply without restart.
                let interval_ms = this.pool.get_config().await.health_check_interval_ms;
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle_slot().take() {
            handle.abort();
            tracing::info!("health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle_slot()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// One cycle: probe every target concurrently, join, then emit a summary.
    pub async fn check_all(&self) -> Vec<HealthCheckResult> {
        let vms = self.pool.health_check_targets().await;
        // A VM that left the probe set (stopped, starting, gone) starts its next streak from zero.
        let targets: HashSet<&str> = vms.iter().map(|vm| vm.vm_id.as_str()).collect();
        self.streaks
            .lock()
            .await
            .retain(|vm_id, _| targets.contains(vm_id.as_str()));

        let results: Vec<HealthCheckResult> =
            futures_util::future::join_all(vms.into_iter().map(|vm| self.check_vm(vm)))
                .await
                .into_iter()
                .flatten()
                .collect();

        let healthy = results.iter().filter(|r| r.healthy).count();
        let counts = self.pool.get_pool_status().await.counts;
        tracing::debug!(checked = results.len(), healthy, "health cycle completed");
        self.events.publish(PoolEvent::HealthCycleCompleted {
            checked: results.len(),
            healthy,
            unhealthy: results.len() - healthy,
            counts,
        });
        results
    }

    pub async fn force_health_check_all(&self) -> Vec<HealthCheckResult> {
        self.check_all().await
    }

    pub async fn force_health_check(&self, vm_id: &str) -> Result<HealthCheckResult, PoolError> {
        let vm = self
            .pool
            .get_vm(vm_id)
            .await
            .ok_or_else(|| PoolError::VmNotFound(vm_id.to_string()))?;
        if vm.public_ip.is_none() {
            return Err(PoolError::VmNotAvailable {
                vm_id: vm.vm_id,
                status: vm.status,
            });
        }
        self.check_vm(vm)
            .await
            .ok_or_else(|| PoolError::VmNotFound(vm_id.to_string()))
    }

    pub async fn get_health_status(&self) -> HealthStatusReport {
        HealthStatusReport {
            running: self.is_running(),
            unhealthy_threshold: self.config.unhealthy_threshold,
            recovery_threshold: self.config.recovery_threshold,
            vms: self.streaks.lock().await.clone(),
        }
    }

    /// Probe one VM and act on the result. Never fails; store and alert errors
    /// are logged so one VM cannot poison the cycle.
    async fn check_vm(&self, vm: VmRecord) -> Option<HealthCheckResult> {
        let ip = vm.public_ip.clone()?;
        let port = self.pool.get_config().await.service_port;
        let services = self
            .client
            .check_instance_services(&ip, port, self.config.probe_timeout)
            .await;
        let healthy = services.is_fully_healthy();

        let verdict = {
            let mut streaks = self.streaks.lock().await;
            let state = streaks.entry(vm.vm_id.clone()).or_default();
            state.last_check = Some(services.checked_at);
            state.last_result = Some(services.clone());
            if healthy {
                state.consecutive_successes += 1;
                state.consecutive_failures = 0;
            } else {
                state.consecutive_failures += 1;
                state.consecutive_successes = 0;
            }

            if !healthy && state.consecutive_failures >= self.config.unhealthy_threshold && vm.status != VmStatus::Error {
                HealthVerdict::Unhealthy {
                    reason: failure_reason(&services),
                }
            } else if healthy && vm.status == VmStatus::Error && state.consecutive_successes >= self.config.recovery_threshold {
                HealthVerdict::Recovered
            } else {
                HealthVerdict::Observed
            }
        };

        let transitioned_to = match self.pool.apply_health(&vm.vm_id, services.clone(), verdict.clone()).await {
            Ok(Some(update)) => update.transitioned_to,
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(vm_id = %vm.vm_id, error = %e, "failed to record health result");
                None
            }
        };

        match (&verdict, transitioned_to) {
            (HealthVerdict::Unhealthy { reason }, Some(_)) => {
                if let Some(workload_id) = vm.assigned_to.as_deref() {
                    self.raise(&vm, workload_id, &services, reason).await;
                }
            }
            (HealthVerdict::Recovered, Some(_)) => {
                if let Some(state) = self.streaks.lock().await.get_mut(&vm.vm_id) {
                    state.consecutive_successes = 0;
                }
            }
            _ => {}
        }
        if healthy {
            if let Some(workload_id) = vm.assigned_to.as_deref() {
                self.resolve_all(&vm.vm_id, workload_id).await;
            }
        }

        tracing::debug!(vm_id = %vm.vm_id, healthy, transitioned = ?transitioned_to, "health check");
        Some(HealthCheckResult {
            vm_id: vm.vm_id,
            healthy,
            services,
            transitioned_to,
        })
    }

    async fn raise(&self, vm: &VmRecord, workload_id: &str, services: &VmServices, reason: &str) {
        let (source_id, title, level) = if !services.reachable {
            (vm_unreachable_source(&vm.vm_id), "VM unreachable", AlertLevel::Critical)
        } else {
            (obs_disconnected_source(&vm.vm_id), "Control plane disconnected", AlertLevel::Error)
        };
        let alert = NewAlert {
            level,
            category: "infrastructure".to_string(),
            title: title.to_string(),
            message: format!(
                "VM {} failed {} consecutive health checks: {}",
                vm.name, self.config.unhealthy_threshold, reason
            ),
            source_id,
            metadata: serde_json::json!({
                "vmId": vm.vm_id,
                "instanceId": vm.instance_id,
                "publicIp": vm.public_ip,
                "responseTimeMs": services.response_time_ms,
            }),
        };
        if let Err(e) = self.alerts.create_alert(workload_id, alert).await {
            tracing::warn!(vm_id = %vm.vm_id, workload_id, error = %e, "failed to raise alert");
        }
    }

    async fn resolve_all(&self, vm_id: &str, workload_id: &str) {
        for source_id in health_alert_sources(vm_id) {
            if let Err(e) = self
                .alerts
                .resolve_by_source_id(workload_id, &source_id, RESOLVED_BY)
                .await
            {
                tracing::warn!(vm_id, workload_id, %source_id, error = %e, "failed to resolve alert");
            }
        }
    }
}

fn failure_reason(services: &VmServices) -> String {
    match (&services.reason, services.reachable) {
        (Some(reason), _) => reason.clone(),
        (None, false) => "service endpoint unreachable".to_string(),
        (None, true) => "control plane disconnected".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reason_prefers_probe_reason() {
        let mut services = VmServices::unreachable("timeout after 5000ms");
        assert_eq!(failure_reason(&services), "timeout after 5000ms");
        services.reason = None;
        assert_eq!(failure_reason(&services), "service endpoint unreachable");
        services.reachable = true;
        assert_eq!(failure_reason(&services), "control plane disconnected");
    }
}

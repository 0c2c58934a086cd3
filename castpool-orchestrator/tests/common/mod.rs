// Shared fixtures for orchestrator integration tests.
// All cloud calls go through the mock provider; nothing here touches a real account.
#![allow(dead_code)]

use async_trait::async_trait;
use castpool_common::bus::NewAlert;
use castpool_common::{VmRecord, VmServices, VmStatus};
use castpool_orchestrator::alerts::AlertSink;
use castpool_orchestrator::events::EventBus;
use castpool_orchestrator::health_monitor::{HealthMonitor, HealthMonitorConfig};
use castpool_orchestrator::pool_manager::{PoolManager, TransitionConfig};
use castpool_orchestrator::resource_client::{ResourceClient, ServiceProbe};
use castpool_orchestrator::settings::Settings;
use castpool_orchestrator::store::{MemoryStore, PoolStore};
use castpool_providers::inventory::InstanceState;
use castpool_providers::mock::MockProvider;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Probe {
    Healthy,
    Unreachable,
    Disconnected,
}

/// Probe answering from a per-IP script; unknown IPs are healthy.
#[derive(Default)]
pub struct ScriptedProbe {
    results: Mutex<HashMap<String, Probe>>,
}

impl ScriptedProbe {
    pub fn set(&self, ip: &str, result: Probe) {
        self.results.lock().unwrap().insert(ip.to_string(), result);
    }
}

#[async_trait]
impl ServiceProbe for ScriptedProbe {
    async fn check(&self, ip: &str, _port: u16, _timeout: Duration) -> VmServices {
        let result = self.results.lock().unwrap().get(ip).copied().unwrap_or(Probe::Healthy);
        match result {
            Probe::Healthy => VmServices {
                reachable: true,
                control_plane_connected: true,
                reason: None,
                response_time_ms: Some(12),
                checked_at: Utc::now(),
            },
            Probe::Unreachable => VmServices::unreachable("connection failed: refused"),
            Probe::Disconnected => VmServices {
                reachable: true,
                control_plane_connected: false,
                reason: Some("control plane disconnected".to_string()),
                response_time_ms: Some(12),
                checked_at: Utc::now(),
            },
        }
    }
}

#[derive(Default)]
pub struct RecordingAlerts {
    pub created: Mutex<Vec<(String, NewAlert)>>,
    pub resolved: Mutex<Vec<(String, String)>>,
}

impl RecordingAlerts {
    pub fn created_sources(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(_, alert)| alert.source_id.clone())
            .collect()
    }

    pub fn resolved_sources(&self) -> Vec<String> {
        self.resolved
            .lock()
            .unwrap()
            .iter()
            .map(|(_, source)| source.clone())
            .collect()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn create_alert(&self, workload_id: &str, alert: NewAlert) -> anyhow::Result<()> {
        self.created.lock().unwrap().push((workload_id.to_string(), alert));
        Ok(())
    }

    async fn resolve_by_source_id(&self, workload_id: &str, source_id: &str, _resolved_by: &str) -> anyhow::Result<()> {
        self.resolved
            .lock()
            .unwrap()
            .push((workload_id.to_string(), source_id.to_string()));
        Ok(())
    }
}

pub struct Harness {
    pub mock: Arc<MockProvider>,
    pub store: Arc<MemoryStore>,
    pub probe: Arc<ScriptedProbe>,
    pub alerts: Arc<RecordingAlerts>,
    pub events: EventBus,
    pub client: Arc<ResourceClient>,
    pub pool: Arc<PoolManager>,
}

impl Harness {
    pub fn monitor(&self) -> Arc<HealthMonitor> {
        HealthMonitor::new(
            self.pool.clone(),
            self.client.clone(),
            self.alerts.clone(),
            self.events.clone(),
            HealthMonitorConfig::default(),
        )
    }

    pub async fn vm(&self, vm_id: &str) -> VmRecord {
        self.pool.get_vm(vm_id).await.expect("vm in pool")
    }

    pub async fn ip_of(&self, vm_id: &str) -> String {
        self.vm(vm_id).await.public_ip.expect("vm has public ip")
    }
}

pub fn pool_tags() -> HashMap<String, String> {
    Settings::default().ownership_tags()
}

/// Mock fleet of `running` instances (`vm-run{n}`) and `stopped` ones (`vm-cold{n}`),
/// reconciled into a fresh in-memory pool.
pub async fn harness(running: usize, stopped: usize) -> Harness {
    let mock = Arc::new(MockProvider::new());
    for n in 0..running {
        mock.add_instance(&format!("i-run{}", n), InstanceState::Running, pool_tags()).await;
    }
    for n in 0..stopped {
        mock.add_instance(&format!("i-cold{}", n), InstanceState::Stopped, pool_tags()).await;
    }
    // Not ours: must never show up in the pool.
    mock.add_instance("i-foreign", InstanceState::Running, HashMap::new()).await;

    let store = Arc::new(MemoryStore::new());
    let probe = Arc::new(ScriptedProbe::default());
    let alerts = Arc::new(RecordingAlerts::default());
    let events = EventBus::default();
    let client = Arc::new(ResourceClient::new(mock.clone(), probe.clone()));
    let pool = PoolManager::new(
        client.clone(),
        store.clone() as Arc<dyn PoolStore>,
        events.clone(),
        TransitionConfig::default(),
    );
    pool.initialize_pool().await.expect("pool initializes");

    Harness {
        mock,
        store,
        probe,
        alerts,
        events,
        client,
        pool,
    }
}

/// Every non-null assignment is unique and sits on an ASSIGNED/IN_USE/ERROR VM.
pub async fn assert_invariants(pool: &PoolManager) {
    let status = pool.get_pool_status().await;
    let mut owners = HashSet::new();
    for vm in &status.vms {
        if let Some(owner) = vm.assigned_to.as_deref() {
            assert!(
                matches!(vm.status, VmStatus::Assigned | VmStatus::InUse | VmStatus::Error),
                "{} assigned to {} while {}",
                vm.vm_id,
                owner,
                vm.status
            );
            assert!(owners.insert(owner.to_string()), "{} owns two VMs", owner);
        }
    }
}

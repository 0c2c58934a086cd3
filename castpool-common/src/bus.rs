use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{PoolCounts, VmStatus};

// -----------------------------------------------------------------------------
// Store paths (logical; backends map them onto their own key scheme)
// -----------------------------------------------------------------------------

pub const PATH_POOL_CONFIG: &str = "pool/config";
pub const PATH_POOL_VMS: &str = "pool/vms";

pub fn vm_path(vm_id: &str) -> String {
    format!("{}/{}", PATH_POOL_VMS, vm_id)
}

pub fn workload_address_path(workload_id: &str) -> String {
    format!("workload/{}/config/vmAddress", workload_id)
}

// -----------------------------------------------------------------------------
// Channels / Streams
// -----------------------------------------------------------------------------

pub const CHANNEL_POOL_CHANGES: &str = "pool:changes";
pub const CHANNEL_POOL_EVENTS: &str = "pool:events";
pub const CHANNEL_ALERTS: &str = "alerts";

// -----------------------------------------------------------------------------
// Workload address
// -----------------------------------------------------------------------------

/// Published at `workload/{id}/config/vmAddress` so the workload can find its machine.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmAddress {
    pub vm_id: String,
    pub ip: String,
    pub port: u16,
    pub address: String,
    pub assigned_at: DateTime<Utc>,
}

impl VmAddress {
    pub fn new(vm_id: &str, ip: &str, port: u16) -> Self {
        Self {
            vm_id: vm_id.to_string(),
            ip: ip.to_string(),
            port,
            address: format!("{}:{}", ip, port),
            assigned_at: Utc::now(),
        }
    }
}

// -----------------------------------------------------------------------------
// Pool lifecycle events (EVT:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum PoolEvent {
    #[serde(rename = "EVT:VM_ASSIGNED")]
    VmAssigned { vm_id: String, workload_id: String, address: Option<String> },
    #[serde(rename = "EVT:VM_RELEASED")]
    VmReleased { vm_id: String, workload_id: String },
    #[serde(rename = "EVT:VM_IN_USE")]
    VmInUse { vm_id: String, workload_id: String },
    #[serde(rename = "EVT:VM_STARTING")]
    VmStarting { vm_id: String },
    #[serde(rename = "EVT:VM_READY")]
    VmReady { vm_id: String, services_ready: bool },
    #[serde(rename = "EVT:VM_STOPPING")]
    VmStopping { vm_id: String },
    #[serde(rename = "EVT:VM_STOPPED")]
    VmStopped { vm_id: String },
    #[serde(rename = "EVT:VM_ERROR")]
    VmError { vm_id: String, reason: String },
    #[serde(rename = "EVT:VM_RECOVERED")]
    VmRecovered { vm_id: String, status: VmStatus },
    #[serde(rename = "EVT:VM_IDLE")]
    VmIdle { vm_id: String, idle_minutes: i64 },
    #[serde(rename = "EVT:VM_PROVISIONED")]
    VmProvisioned { vm_id: String, instance_id: String },
    #[serde(rename = "EVT:VM_TERMINATED")]
    VmTerminated { vm_id: String },
    #[serde(rename = "EVT:POOL_RECONCILED")]
    PoolReconciled { added: usize, removed: usize, corrected: usize },
    #[serde(rename = "EVT:HEALTH_CYCLE_COMPLETED")]
    HealthCycleCompleted { checked: usize, healthy: usize, unhealthy: usize, counts: PoolCounts },
}

impl PoolEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolEvent::VmAssigned { .. } => "EVT:VM_ASSIGNED",
            PoolEvent::VmReleased { .. } => "EVT:VM_RELEASED",
            PoolEvent::VmInUse { .. } => "EVT:VM_IN_USE",
            PoolEvent::VmStarting { .. } => "EVT:VM_STARTING",
            PoolEvent::VmReady { .. } => "EVT:VM_READY",
            PoolEvent::VmStopping { .. } => "EVT:VM_STOPPING",
            PoolEvent::VmStopped { .. } => "EVT:VM_STOPPED",
            PoolEvent::VmError { .. } => "EVT:VM_ERROR",
            PoolEvent::VmRecovered { .. } => "EVT:VM_RECOVERED",
            PoolEvent::VmIdle { .. } => "EVT:VM_IDLE",
            PoolEvent::VmProvisioned { .. } => "EVT:VM_PROVISIONED",
            PoolEvent::VmTerminated { .. } => "EVT:VM_TERMINATED",
            PoolEvent::PoolReconciled { .. } => "EVT:POOL_RECONCILED",
            PoolEvent::HealthCycleCompleted { .. } => "EVT:HEALTH_CYCLE_COMPLETED",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub event: PoolEvent,
    pub source: String,
}

impl EventEnvelope {
    pub fn new(event: PoolEvent, source: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            event,
            source: source.to_string(),
        }
    }
}

// -----------------------------------------------------------------------------
// Alerts (consumed contract: createAlert / resolveBySourceId)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewAlert {
    pub level: AlertLevel,
    pub category: String,
    pub title: String,
    pub message: String,
    pub source_id: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

pub fn vm_unreachable_source(vm_id: &str) -> String {
    format!("vm-unreachable-{}", vm_id)
}

pub fn obs_disconnected_source(vm_id: &str) -> String {
    format!("obs-disconnected-{}", vm_id)
}

pub fn vm_idle_source(vm_id: &str) -> String {
    format!("vm-idle-{}", vm_id)
}

/// Every sourceId the health monitor may raise for a VM.
pub fn health_alert_sources(vm_id: &str) -> [String; 2] {
    [vm_unreachable_source(vm_id), obs_disconnected_source(vm_id)]
}

/// Wire form used when alerts are forwarded over the bus.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum AlertCommand {
    #[serde(rename = "CMD:CREATE_ALERT")]
    Create { workload_id: String, alert: NewAlert },
    #[serde(rename = "CMD:RESOLVE_ALERT")]
    Resolve { workload_id: String, source_id: String, resolved_by: String },
}

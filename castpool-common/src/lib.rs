use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod bus;

// --- Enums ---

/// Lifecycle status of a pooled VM.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmStatus {
    Available, // Running, unassigned, ready to hand out
    Assigned,  // Handed to a workload, not yet live
    InUse,     // Workload is actively using it
    Stopped,   // Cold reserve
    Starting,  // Start requested, waiting for convergence
    Stopping,  // Stop requested, waiting for convergence
    Error,     // Failed health or convergence
}

impl VmStatus {
    pub const ALL: [VmStatus; 7] = [
        VmStatus::Available,
        VmStatus::Assigned,
        VmStatus::InUse,
        VmStatus::Stopped,
        VmStatus::Starting,
        VmStatus::Stopping,
        VmStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Available => "AVAILABLE",
            VmStatus::Assigned => "ASSIGNED",
            VmStatus::InUse => "IN_USE",
            VmStatus::Stopped => "STOPPED",
            VmStatus::Starting => "STARTING",
            VmStatus::Stopping => "STOPPING",
            VmStatus::Error => "ERROR",
        }
    }

    /// Statuses that may carry an `assigned_to` value. ERROR keeps the owner of an
    /// assigned VM that failed health checks so recovery can hand it back.
    pub fn allows_assignment(&self) -> bool {
        matches!(self, VmStatus::Assigned | VmStatus::InUse | VmStatus::Error)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, VmStatus::Starting | VmStatus::Stopping)
    }
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Entities ---

/// Last health snapshot reported by the VM's own status endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmServices {
    pub reachable: bool,
    pub control_plane_connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    pub checked_at: DateTime<Utc>,
}

impl VmServices {
    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self {
            reachable: false,
            control_plane_connected: false,
            reason: Some(reason.into()),
            response_time_ms: None,
            checked_at: Utc::now(),
        }
    }

    pub fn is_fully_healthy(&self) -> bool {
        self.reachable && self.control_plane_connected
    }
}

/// One record per cloud instance owned by the pool.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmRecord {
    pub vm_id: String,
    pub instance_id: String,
    pub name: String,
    pub status: VmStatus,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub instance_type: String,
    pub availability_zone: Option<String>,
    pub launch_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub assigned_to: Option<String>,
    pub services: Option<VmServices>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
    pub error_reason: Option<String>,
}

impl VmRecord {
    /// Default display label: the trailing part of the instance id.
    pub fn default_name(instance_id: &str) -> String {
        let suffix: String = instance_id
            .chars()
            .rev()
            .take(8)
            .collect::<String>()
            .chars()
            .rev()
            .collect();
        format!("vm-{}", suffix)
    }

    /// Move to `status`, stamping the change time. Going STOPPED drops runtime-only fields.
    pub fn set_status(&mut self, status: VmStatus, now: DateTime<Utc>) {
        if self.status != status {
            self.last_state_change = now;
        }
        self.status = status;
        if status == VmStatus::Stopped {
            self.public_ip = None;
            self.private_ip = None;
            self.services = None;
        }
        if status != VmStatus::Error {
            self.error_reason = None;
        }
        if !status.allows_assignment() {
            self.assigned_to = None;
        }
    }

    pub fn mark_error(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.set_status(VmStatus::Error, now);
        self.error_reason = Some(reason.into());
    }

    /// `ip:port` the assigned workload should connect to.
    pub fn address(&self, port: u16) -> Option<String> {
        self.public_ip
            .as_deref()
            .map(|ip| format!("{}:{}", ip, port))
    }
}

// --- Configuration ---

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid pool config: {0}")]
    Invalid(String),
}

/// Runtime-mutable pool sizing and timing, persisted at `pool/config`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PoolConfig {
    pub warm_count: usize,
    pub cold_count: usize,
    pub max_instances: usize,
    pub health_check_interval_ms: u64,
    pub idle_timeout_minutes: u64,
    pub service_port: u16,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            warm_count: 2,
            cold_count: 2,
            max_instances: 6,
            health_check_interval_ms: 30_000,
            idle_timeout_minutes: 60,
            service_port: 8080,
        }
    }
}

/// Partial update for [`PoolConfig`]. Unknown keys are rejected.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PoolConfigPatch {
    pub warm_count: Option<usize>,
    pub cold_count: Option<usize>,
    pub max_instances: Option<usize>,
    pub health_check_interval_ms: Option<u64>,
    pub idle_timeout_minutes: Option<u64>,
    pub service_port: Option<u16>,
}

impl PoolConfig {
    pub fn merge(&self, patch: &PoolConfigPatch) -> PoolConfig {
        PoolConfig {
            warm_count: patch.warm_count.unwrap_or(self.warm_count),
            cold_count: patch.cold_count.unwrap_or(self.cold_count),
            max_instances: patch.max_instances.unwrap_or(self.max_instances),
            health_check_interval_ms: patch
                .health_check_interval_ms
                .unwrap_or(self.health_check_interval_ms),
            idle_timeout_minutes: patch.idle_timeout_minutes.unwrap_or(self.idle_timeout_minutes),
            service_port: patch.service_port.unwrap_or(self.service_port),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_instances == 0 {
            return Err(ConfigError::Invalid("maxInstances must be at least 1".into()));
        }
        if self.warm_count + self.cold_count > self.max_instances {
            return Err(ConfigError::Invalid(format!(
                "warmCount + coldCount ({}) exceeds maxInstances ({})",
                self.warm_count + self.cold_count,
                self.max_instances
            )));
        }
        if self.health_check_interval_ms < 1_000 {
            return Err(ConfigError::Invalid(
                "healthCheckIntervalMs must be at least 1000".into(),
            ));
        }
        if self.service_port == 0 {
            return Err(ConfigError::Invalid("servicePort must be non-zero".into()));
        }
        Ok(())
    }
}

// --- Read models ---

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolCounts {
    pub total: usize,
    pub available: usize,
    pub assigned: usize,
    pub in_use: usize,
    pub stopped: usize,
    pub starting: usize,
    pub stopping: usize,
    pub error: usize,
}

impl PoolCounts {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a VmRecord>) -> Self {
        let mut counts = PoolCounts::default();
        for vm in records {
            counts.total += 1;
            match vm.status {
                VmStatus::Available => counts.available += 1,
                VmStatus::Assigned => counts.assigned += 1,
                VmStatus::InUse => counts.in_use += 1,
                VmStatus::Stopped => counts.stopped += 1,
                VmStatus::Starting => counts.starting += 1,
                VmStatus::Stopping => counts.stopping += 1,
                VmStatus::Error => counts.error += 1,
            }
        }
        counts
    }

    pub fn warm(&self) -> usize {
        self.available + self.assigned + self.in_use
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub config: PoolConfig,
    pub counts: PoolCounts,
    pub vms: Vec<VmRecord>,
}

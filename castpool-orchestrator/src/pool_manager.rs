//! Pool Manager: authoritative VM lifecycle, assignment/release, warm-pool upkeep.
//!
//! Every mutation is a conditional write against the shared store (status must still
//! be what this process read). The in-process cache is fed by the store's change
//! stream and by our own successful writes.

use castpool_common::bus::{PoolEvent, VmAddress};
use castpool_common::{ConfigError, PoolConfig, PoolConfigPatch, PoolCounts, PoolStatus, VmRecord, VmServices, VmStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

use crate::events::EventBus;
use crate::reconciliation::{self, TAG_VM_ID};
use crate::resource_client::{LaunchSpec, ResourceClient};
use crate::state_machine::{self, Operation};
use crate::store::{PoolStore, StoreChange, StoreError};
use crate::transitions::{Convergence, Reservation, TransitionTasks};

/// Seconds a caller should wait before retrying after a `VmStarting` hint.
pub const STARTING_RETRY_AFTER_SECS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("VM {0} not found")]
    VmNotFound(String),
    #[error("VM {vm_id} is not available (status {status})")]
    VmNotAvailable { vm_id: String, status: VmStatus },
    #[error("no VM available for workload {0}")]
    NoVmAvailable(String),
    #[error("VM {vm_id} is starting, try again shortly")]
    VmStarting { vm_id: String, retry_after_secs: u64 },
    #[error("cannot {operation} VM {vm_id} in status {from}: requires {}", .operation.precondition())]
    InvalidTransition {
        vm_id: String,
        from: VmStatus,
        operation: Operation,
    },
    #[error("pool is at maxInstances ({max})")]
    MaxInstancesReached { max: usize },
    #[error("VM {vm_id} was modified concurrently, retry")]
    Conflict { vm_id: String },
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("provider call failed: {0:#}")]
    Provider(anyhow::Error),
}

impl PoolError {
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            PoolError::VmStarting { retry_after_secs, .. } => Some(*retry_after_secs),
            PoolError::NoVmAvailable(_) => Some(STARTING_RETRY_AFTER_SECS * 2),
            _ => None,
        }
    }
}

/// Bounds for background start/stop convergence. `poll_interval` is handed to the
/// resource client, which clamps it to 5-15s.
#[derive(Debug, Clone)]
pub struct TransitionConfig {
    pub convergence_timeout: Duration,
    pub poll_interval: Duration,
    pub services_ready_timeout: Duration,
    pub services_poll_interval: Duration,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            convergence_timeout: Duration::from_secs(180),
            poll_interval: Duration::from_secs(10),
            services_ready_timeout: Duration::from_secs(120),
            services_poll_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub vm: VmRecord,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmOutcome {
    pub vm_id: String,
    pub started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub added: usize,
    pub removed: usize,
    pub corrected: usize,
    pub resumed: usize,
}

/// What a health check concluded for one VM.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthVerdict {
    /// Record the snapshot only.
    Observed,
    /// Unhealthy threshold crossed.
    Unhealthy { reason: String },
    /// Recovery threshold crossed.
    Recovered,
}

#[derive(Debug, Clone)]
pub struct HealthUpdate {
    pub vm: VmRecord,
    /// Set when the verdict moved the VM to a new status.
    pub transitioned_to: Option<VmStatus>,
}

struct Cache {
    config: PoolConfig,
    vms: BTreeMap<String, VmRecord>,
}

pub struct PoolManager {
    client: Arc<ResourceClient>,
    store: Arc<dyn PoolStore>,
    events: EventBus,
    tasks: TransitionTasks,
    transition: TransitionConfig,
    cache: RwLock<Cache>,
}

impl PoolManager {
    pub fn new(
        client: Arc<ResourceClient>,
        store: Arc<dyn PoolStore>,
        events: EventBus,
        transition: TransitionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            store,
            events,
            tasks: TransitionTasks::new(),
            transition,
            cache: RwLock::new(Cache {
                config: PoolConfig::default(),
                vms: BTreeMap::new(),
            }),
        })
    }

    pub fn tasks(&self) -> &TransitionTasks {
        &self.tasks
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    // -------------------------------------------------------------------------
    // Startup / sync
    // -------------------------------------------------------------------------

    /// Load (or seed) config, reconcile with the provider and follow store changes.
    pub async fn initialize_pool(self: &Arc<Self>) -> Result<PoolStatus, PoolError> {
        self.spawn_cache_listener();

        let config = match self.store.get_config().await? {
            Some(cfg) => cfg,
            None => {
                let cfg = PoolConfig::default();
                self.store.put_config(&cfg).await?;
                tracing::info!("seeded default pool config");
                cfg
            }
        };
        self.cache.write().await.config = config;

        let report = self.reconcile().await?;
        let status = self.get_pool_status().await;
        tracing::info!(
            total = status.counts.total,
            available = status.counts.available,
            stopped = status.counts.stopped,
            added = report.added,
            removed = report.removed,
            "✅ pool initialized"
        );
        Ok(status)
    }

    fn spawn_cache_listener(self: &Arc<Self>) {
        let mut rx = self.store.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let change = match rx.recv().await {
                    Ok(change) => Some(change),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "pool change stream lagged, resyncing cache");
                        None
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(this) = weak.upgrade() else {
                    break;
                };
                let res = match change {
                    Some(change) => this.apply_store_change(change).await,
                    None => this.resync_cache().await,
                };
                if let Err(e) = res {
                    tracing::warn!(error = %e, "failed to refresh pool cache");
                }
            }
        });
    }

    async fn apply_store_change(&self, change: StoreChange) -> Result<(), StoreError> {
        match change {
            StoreChange::Config => {
                if let Some(config) = self.store.get_config().await? {
                    self.cache.write().await.config = config;
                }
            }
            StoreChange::Vm { vm_id } => {
                let fresh = self.store.get_vm(&vm_id).await?;
                let mut cache = self.cache.write().await;
                match fresh {
                    Some(vm) => {
                        cache.vms.insert(vm_id, vm);
                    }
                    None => {
                        cache.vms.remove(&vm_id);
                    }
                }
            }
            StoreChange::WorkloadAddress { .. } => {}
        }
        Ok(())
    }

    async fn resync_cache(&self) -> Result<(), StoreError> {
        let vms = self.store.list_vms().await?;
        let config = self.store.get_config().await?;
        let mut cache = self.cache.write().await;
        cache.vms = vms.into_iter().map(|vm| (vm.vm_id.clone(), vm)).collect();
        if let Some(config) = config {
            cache.config = config;
        }
        Ok(())
    }

    /// Re-runnable merge of provider state into the store.
    pub async fn reconcile(self: &Arc<Self>) -> Result<ReconcileReport, PoolError> {
        let existing = self.store.list_vms().await?;
        let instances = self
            .client
            .describe_instances(&self.client.pool_filter())
            .await
            .map_err(PoolError::Provider)?;
        let in_flight: HashSet<String> = self.tasks.in_flight().into_iter().collect();
        let plan = reconciliation::plan(&existing, &instances, &in_flight, Utc::now());

        for upsert in &plan.upserts {
            let written = match upsert.expected {
                None => {
                    self.store.put_vm(&upsert.record).await?;
                    true
                }
                Some(expected) => self.store.compare_and_set_vm(&upsert.record, expected).await?,
            };
            if written {
                self.cache_put(upsert.record.clone()).await;
                if let Some(workload_id) = upsert.dropped_owner.as_deref() {
                    tracing::warn!(vm_id = %upsert.record.vm_id, workload_id, status = %upsert.record.status, "assignment lost to out-of-band state change");
                    self.drop_workload_address(workload_id).await;
                    self.events.publish(PoolEvent::VmReleased {
                        vm_id: upsert.record.vm_id.clone(),
                        workload_id: workload_id.to_string(),
                    });
                }
            } else {
                tracing::debug!(vm_id = %upsert.record.vm_id, "record moved during reconciliation, skipped");
            }
        }

        for gone in &plan.removed {
            self.store.delete_vm(&gone.vm_id).await?;
            if let Some(workload_id) = gone.assigned_to.as_deref() {
                self.drop_workload_address(workload_id).await;
            }
            self.cache.write().await.vms.remove(&gone.vm_id);
        }

        let mut resumed = 0;
        for (vm_id, kind) in &plan.resume {
            if self.spawn_convergence(vm_id, *kind) {
                resumed += 1;
            }
        }

        let report = ReconcileReport {
            added: plan.added,
            removed: plan.removed.len(),
            corrected: plan.corrected,
            resumed,
        };
        self.events.publish(PoolEvent::PoolReconciled {
            added: report.added,
            removed: report.removed,
            corrected: report.corrected,
        });
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub async fn get_config(&self) -> PoolConfig {
        self.cache.read().await.config.clone()
    }

    pub async fn get_pool_status(&self) -> PoolStatus {
        let cache = self.cache.read().await;
        let vms: Vec<VmRecord> = cache.vms.values().cloned().collect();
        PoolStatus {
            config: cache.config.clone(),
            counts: PoolCounts::from_records(&vms),
            vms,
        }
    }

    pub async fn get_vm(&self, vm_id: &str) -> Option<VmRecord> {
        self.cache.read().await.vms.get(vm_id).cloned()
    }

    pub async fn get_vm_for_workload(&self, workload_id: &str) -> Option<VmRecord> {
        self.cache
            .read()
            .await
            .vms
            .values()
            .find(|vm| vm.assigned_to.as_deref() == Some(workload_id))
            .cloned()
    }

    /// VMs the health monitor should probe: running (or failed but still addressed).
    pub async fn health_check_targets(&self) -> Vec<VmRecord> {
        self.cache
            .read()
            .await
            .vms
            .values()
            .filter(|vm| {
                matches!(
                    vm.status,
                    VmStatus::Available | VmStatus::Assigned | VmStatus::InUse | VmStatus::Error
                ) && vm.public_ip.is_some()
            })
            .cloned()
            .collect()
    }

    /// AVAILABLE/ASSIGNED VMs untouched for longer than `idle_timeout_minutes`.
    pub async fn idle_vms(&self, now: DateTime<Utc>) -> Vec<VmRecord> {
        let cache = self.cache.read().await;
        let limit = chrono::Duration::minutes(cache.config.idle_timeout_minutes as i64);
        cache
            .vms
            .values()
            .filter(|vm| matches!(vm.status, VmStatus::Available | VmStatus::Assigned))
            .filter(|vm| now - vm.last_state_change >= limit)
            .cloned()
            .collect()
    }

    // -------------------------------------------------------------------------
    // Assignment protocol
    // -------------------------------------------------------------------------

    pub async fn assign_vm(self: &Arc<Self>, workload_id: &str, preferred_vm_id: Option<&str>) -> Result<Assignment, PoolError> {
        let port = self.get_config().await.service_port;

        if let Some(owned) = self.get_vm_for_workload(workload_id).await {
            if matches!(owned.status, VmStatus::Assigned | VmStatus::InUse) {
                tracing::info!(workload_id, vm_id = %owned.vm_id, "workload already holds a VM");
                let address = owned.address(port);
                return Ok(Assignment { vm: owned, address });
            }
            // Failed VM: let go of it and pick a healthy one.
            self.release_vm(workload_id).await?;
        }

        let candidate = match preferred_vm_id {
            Some(vm_id) => {
                let vm = self
                    .get_vm(vm_id)
                    .await
                    .ok_or_else(|| PoolError::VmNotFound(vm_id.to_string()))?;
                if state_machine::next_status(&vm, Operation::Assign).is_none() {
                    return Err(PoolError::VmNotAvailable {
                        vm_id: vm.vm_id,
                        status: vm.status,
                    });
                }
                vm
            }
            None => match self.first_with_status(VmStatus::Available).await {
                Some(vm) => vm,
                None => return Err(self.no_vm_for(workload_id).await),
            },
        };

        let mut updated = candidate.clone();
        updated.set_status(VmStatus::Assigned, Utc::now());
        updated.assigned_to = Some(workload_id.to_string());
        if !self.store.compare_and_set_vm(&updated, VmStatus::Available).await? {
            tracing::warn!(workload_id, vm_id = %updated.vm_id, "lost assignment race");
            return Err(PoolError::Conflict { vm_id: updated.vm_id });
        }
        self.cache_put(updated.clone()).await;

        let address = updated.address(port);
        match updated.public_ip.as_deref() {
            Some(ip) => {
                let published = VmAddress::new(&updated.vm_id, ip, port);
                if let Err(e) = self.store.put_workload_address(workload_id, &published).await {
                    tracing::warn!(workload_id, error = %e, "failed to publish VM address");
                }
            }
            None => tracing::warn!(workload_id, vm_id = %updated.vm_id, "assigned VM has no public address"),
        }

        tracing::info!(workload_id, vm_id = %updated.vm_id, address = ?address, "🎯 VM assigned");
        self.events.publish(PoolEvent::VmAssigned {
            vm_id: updated.vm_id.clone(),
            workload_id: workload_id.to_string(),
            address: address.clone(),
        });
        Ok(Assignment { vm: updated, address })
    }

    /// Nothing AVAILABLE: wake a cold VM and hand back a retry hint, or give up.
    async fn no_vm_for(self: &Arc<Self>, workload_id: &str) -> PoolError {
        if let Some(cold) = self.first_with_status(VmStatus::Stopped).await {
            tracing::info!(workload_id, vm_id = %cold.vm_id, "no warm VM, starting a cold one");
            return match self.start_vm(&cold.vm_id).await {
                Ok(vm) => PoolError::VmStarting {
                    vm_id: vm.vm_id,
                    retry_after_secs: STARTING_RETRY_AFTER_SECS,
                },
                Err(e) => e,
            };
        }
        if let Some(warming) = self.first_with_status(VmStatus::Starting).await {
            return PoolError::VmStarting {
                vm_id: warming.vm_id,
                retry_after_secs: STARTING_RETRY_AFTER_SECS,
            };
        }
        PoolError::NoVmAvailable(workload_id.to_string())
    }

    pub async fn mark_vm_in_use(&self, vm_id: &str) -> Result<VmRecord, PoolError> {
        let vm = self.require(vm_id, Operation::MarkInUse).await?;
        let workload_id = vm.assigned_to.clone().unwrap_or_default();
        let mut updated = vm.clone();
        updated.set_status(VmStatus::InUse, Utc::now());
        self.commit(&updated, vm.status).await?;
        self.events.publish(PoolEvent::VmInUse {
            vm_id: vm_id.to_string(),
            workload_id,
        });
        Ok(updated)
    }

    /// Release whatever VM `workload_id` holds. No VM held is a successful no-op.
    pub async fn release_vm(&self, workload_id: &str) -> Result<Option<VmRecord>, PoolError> {
        let Some(vm) = self.get_vm_for_workload(workload_id).await else {
            tracing::debug!(workload_id, "release: nothing assigned");
            return Ok(None);
        };
        let next = state_machine::next_status(&vm, Operation::Release).ok_or_else(|| PoolError::InvalidTransition {
            vm_id: vm.vm_id.clone(),
            from: vm.status,
            operation: Operation::Release,
        })?;

        let mut updated = vm.clone();
        updated.set_status(next, Utc::now());
        updated.assigned_to = None;
        self.commit(&updated, vm.status).await?;
        self.drop_workload_address(workload_id).await;

        tracing::info!(workload_id, vm_id = %vm.vm_id, status = %updated.status, "VM released");
        self.events.publish(PoolEvent::VmReleased {
            vm_id: vm.vm_id,
            workload_id: workload_id.to_string(),
        });
        Ok(Some(updated))
    }

    // -------------------------------------------------------------------------
    // Power operations (acknowledged immediately, converged in the background)
    // -------------------------------------------------------------------------

    pub async fn start_vm(self: &Arc<Self>, vm_id: &str) -> Result<VmRecord, PoolError> {
        let vm = self.require(vm_id, Operation::Start).await?;
        let slot = self.reserve(vm_id)?;
        let starting = self.enter_transient(&vm, VmStatus::Starting).await?;
        self.events.publish(PoolEvent::VmStarting {
            vm_id: vm_id.to_string(),
        });

        if let Err(e) = self.client.start_instances(&[vm.instance_id.clone()]).await {
            self.fail(&starting, VmStatus::Starting, format!("start failed: {:#}", e)).await;
            return Err(PoolError::Provider(e));
        }
        slot.spawn(self.convergence(vm_id, Convergence::Start));
        Ok(starting)
    }

    pub async fn stop_vm(self: &Arc<Self>, vm_id: &str) -> Result<VmRecord, PoolError> {
        let vm = self.require(vm_id, Operation::Stop).await?;
        let slot = self.reserve(vm_id)?;
        let stopping = self.enter_transient(&vm, VmStatus::Stopping).await?;
        self.events.publish(PoolEvent::VmStopping {
            vm_id: vm_id.to_string(),
        });

        if let Err(e) = self.client.stop_instances(&[vm.instance_id.clone()], false).await {
            self.fail(&stopping, VmStatus::Stopping, format!("stop failed: {:#}", e)).await;
            return Err(PoolError::Provider(e));
        }
        slot.spawn(self.convergence(vm_id, Convergence::Stop));
        Ok(stopping)
    }

    pub async fn reboot_vm(self: &Arc<Self>, vm_id: &str) -> Result<VmRecord, PoolError> {
        let vm = self.require(vm_id, Operation::Reboot).await?;
        let slot = self.reserve(vm_id)?;
        let starting = self.enter_transient(&vm, VmStatus::Starting).await?;
        self.events.publish(PoolEvent::VmStarting {
            vm_id: vm_id.to_string(),
        });

        if let Err(e) = self.client.reboot_instances(&[vm.instance_id.clone()]).await {
            self.fail(&starting, VmStatus::Starting, format!("reboot failed: {:#}", e)).await;
            return Err(PoolError::Provider(e));
        }
        slot.spawn(self.convergence(vm_id, Convergence::Start));
        Ok(starting)
    }

    /// Terminate an unassigned STOPPED/ERROR VM and drop its record.
    pub async fn terminate_vm(&self, vm_id: &str) -> Result<(), PoolError> {
        let vm = self.require(vm_id, Operation::Terminate).await?;
        self.client
            .terminate_instances(&[vm.instance_id.clone()])
            .await
            .map_err(PoolError::Provider)?;
        self.store.delete_vm(vm_id).await?;
        self.cache.write().await.vms.remove(vm_id);
        tracing::info!(vm_id, instance_id = %vm.instance_id, "🗑️ VM terminated");
        self.events.publish(PoolEvent::VmTerminated {
            vm_id: vm_id.to_string(),
        });
        Ok(())
    }

    /// Launch a new tagged instance, register it STARTING and converge it like a start.
    pub async fn provision_vm(self: &Arc<Self>, name: Option<String>) -> Result<VmRecord, PoolError> {
        let max = self.get_config().await.max_instances;
        let total = self.cache.read().await.vms.len();
        if total >= max {
            return Err(PoolError::MaxInstancesReached { max });
        }

        let uuid = uuid::Uuid::new_v4().simple().to_string();
        let vm_id = format!("vm-{}", &uuid[..12]);
        let slot = self.reserve(&vm_id)?;
        let spec = LaunchSpec {
            name: name.unwrap_or_else(|| format!("castpool-{}", vm_id)),
            tags: HashMap::from([(TAG_VM_ID.to_string(), vm_id.clone())]),
            ..Default::default()
        };
        let info = self.client.launch_instance(&spec).await.map_err(PoolError::Provider)?;

        let now = Utc::now();
        let vm = VmRecord {
            vm_id: vm_id.clone(),
            instance_id: info.instance_id.clone(),
            name: info.name.clone().unwrap_or_else(|| spec.name.clone()),
            status: VmStatus::Starting,
            public_ip: info.public_ip.clone(),
            private_ip: info.private_ip.clone(),
            instance_type: info.instance_type.clone(),
            availability_zone: info.availability_zone.clone(),
            launch_time: info.launch_time,
            tags: info.tags.clone(),
            assigned_to: None,
            services: None,
            last_health_check: None,
            last_state_change: now,
            error_reason: None,
        };
        self.store.put_vm(&vm).await?;
        self.cache_put(vm.clone()).await;
        tracing::info!(vm_id = %vm_id, instance_id = %info.instance_id, "🚀 VM provisioned");
        self.events.publish(PoolEvent::VmProvisioned {
            vm_id: vm_id.clone(),
            instance_id: info.instance_id,
        });
        slot.spawn(self.convergence(&vm_id, Convergence::Start));
        Ok(vm)
    }

    /// Start enough STOPPED VMs to bring the warm pool up to `warm_count`.
    /// VMs already STARTING count towards the gap.
    pub async fn ensure_min_warm_vms(self: &Arc<Self>) -> Result<Vec<WarmOutcome>, PoolError> {
        let status = self.get_pool_status().await;
        let have = status.counts.warm() + status.counts.starting;
        let gap = status.config.warm_count.saturating_sub(have);
        if gap == 0 {
            return Ok(Vec::new());
        }

        let cold: Vec<String> = status
            .vms
            .iter()
            .filter(|vm| vm.status == VmStatus::Stopped)
            .take(gap)
            .map(|vm| vm.vm_id.clone())
            .collect();
        if cold.len() < gap {
            tracing::warn!(gap, available = cold.len(), "not enough cold VMs to fill warm pool");
        }

        let mut outcomes = Vec::with_capacity(cold.len());
        for vm_id in cold {
            let outcome = match self.start_vm(&vm_id).await {
                Ok(_) => WarmOutcome {
                    vm_id,
                    started: true,
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(vm_id = %vm_id, error = %e, "warm-up start failed");
                    WarmOutcome {
                        vm_id,
                        started: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    pub async fn update_config(&self, patch: &PoolConfigPatch) -> Result<PoolConfig, PoolError> {
        let merged = self.get_config().await.merge(patch);
        merged.validate()?;
        self.store.put_config(&merged).await?;
        self.cache.write().await.config = merged.clone();
        tracing::info!(?merged, "pool config updated");
        Ok(merged)
    }

    // -------------------------------------------------------------------------
    // Health monitor entry point
    // -------------------------------------------------------------------------

    /// Persist a probe snapshot and, if the verdict says so, the threshold transition.
    /// Returns `None` when the VM vanished or moved on since it was selected.
    pub async fn apply_health(
        &self,
        vm_id: &str,
        services: VmServices,
        verdict: HealthVerdict,
    ) -> Result<Option<HealthUpdate>, PoolError> {
        let Some(vm) = self.get_vm(vm_id).await else {
            return Ok(None);
        };
        let now = Utc::now();
        let mut updated = vm.clone();
        updated.services = Some(services);
        updated.last_health_check = Some(now);

        let target = match &verdict {
            HealthVerdict::Observed => None,
            HealthVerdict::Unhealthy { .. } => state_machine::unhealthy_target(&vm),
            HealthVerdict::Recovered => state_machine::recovery_target(&vm),
        };
        if let Some(target) = target {
            updated.set_status(target, now);
            if let HealthVerdict::Unhealthy { reason } = &verdict {
                updated.error_reason = Some(reason.clone());
            }
        }

        if !self.store.compare_and_set_vm(&updated, vm.status).await? {
            tracing::debug!(vm_id, "VM changed during health check, snapshot dropped");
            return Ok(None);
        }
        self.cache_put(updated.clone()).await;

        match (target, verdict) {
            (Some(_), HealthVerdict::Unhealthy { reason }) => {
                tracing::warn!(vm_id, reason = %reason, "❌ VM marked ERROR by health monitor");
                self.events.publish(PoolEvent::VmError {
                    vm_id: vm_id.to_string(),
                    reason,
                });
            }
            (Some(status), HealthVerdict::Recovered) => {
                tracing::info!(vm_id, status = %status, "✅ VM recovered");
                self.events.publish(PoolEvent::VmRecovered {
                    vm_id: vm_id.to_string(),
                    status,
                });
            }
            _ => {}
        }
        Ok(Some(HealthUpdate {
            vm: updated,
            transitioned_to: target,
        }))
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn first_with_status(&self, status: VmStatus) -> Option<VmRecord> {
        self.cache
            .read()
            .await
            .vms
            .values()
            .find(|vm| vm.status == status && (status != VmStatus::Available || vm.assigned_to.is_none()))
            .cloned()
    }

    /// Look up `vm_id` and check `op` is legal for it.
    async fn require(&self, vm_id: &str, op: Operation) -> Result<VmRecord, PoolError> {
        let vm = self
            .get_vm(vm_id)
            .await
            .ok_or_else(|| PoolError::VmNotFound(vm_id.to_string()))?;
        if state_machine::next_status(&vm, op).is_none() {
            return Err(PoolError::InvalidTransition {
                vm_id: vm_id.to_string(),
                from: vm.status,
                operation: op,
            });
        }
        Ok(vm)
    }

    /// Conditional write + cache update; a lost race is a `Conflict`.
    async fn commit(&self, updated: &VmRecord, expected: VmStatus) -> Result<(), PoolError> {
        if !self.store.compare_and_set_vm(updated, expected).await? {
            return Err(PoolError::Conflict {
                vm_id: updated.vm_id.clone(),
            });
        }
        self.cache_put(updated.clone()).await;
        Ok(())
    }

    async fn enter_transient(&self, vm: &VmRecord, status: VmStatus) -> Result<VmRecord, PoolError> {
        let mut updated = vm.clone();
        updated.set_status(status, Utc::now());
        updated.services = None;
        self.commit(&updated, vm.status).await?;
        tracing::info!(vm_id = %vm.vm_id, from = %vm.status, to = %status, "transition initiated");
        Ok(updated)
    }

    /// Force ERROR from `expected`. Store failures are logged, never raised.
    async fn fail(&self, vm: &VmRecord, expected: VmStatus, reason: String) {
        let mut failed = vm.clone();
        failed.mark_error(reason.clone(), Utc::now());
        match self.store.compare_and_set_vm(&failed, expected).await {
            Ok(true) => self.cache_put(failed).await,
            Ok(false) => tracing::warn!(vm_id = %vm.vm_id, "VM moved on before it could be marked ERROR"),
            Err(e) => tracing::error!(vm_id = %vm.vm_id, error = %e, "failed to persist ERROR status"),
        }
        tracing::error!(vm_id = %vm.vm_id, reason = %reason, "❌ transition failed");
        self.events.publish(PoolEvent::VmError {
            vm_id: vm.vm_id.clone(),
            reason,
        });
    }

    async fn cache_put(&self, vm: VmRecord) {
        self.cache.write().await.vms.insert(vm.vm_id.clone(), vm);
    }

    async fn drop_workload_address(&self, workload_id: &str) {
        if let Err(e) = self.store.delete_workload_address(workload_id).await {
            tracing::warn!(workload_id, error = %e, "failed to clear VM address");
        }
    }

    /// Hold `vm_id` in flight for the whole power operation, so reconciliation
    /// never mistakes the transient status for an orphan while the provider call retries.
    fn reserve(&self, vm_id: &str) -> Result<Reservation, PoolError> {
        self.tasks.reserve(vm_id).ok_or_else(|| PoolError::Conflict {
            vm_id: vm_id.to_string(),
        })
    }

    fn spawn_convergence(self: &Arc<Self>, vm_id: &str, kind: Convergence) -> bool {
        self.tasks.spawn(vm_id, self.convergence(vm_id, kind))
    }

    fn convergence(self: &Arc<Self>, vm_id: &str, kind: Convergence) -> impl Future<Output = ()> + Send + 'static {
        let this = Arc::clone(self);
        let key = vm_id.to_string();
        async move {
            match kind {
                Convergence::Start => this.converge_start(&key).await,
                Convergence::Stop => this.converge_stop(&key).await,
            }
        }
    }

    async fn converge_start(&self, vm_id: &str) {
        let Some(vm) = self.get_vm(vm_id).await else {
            return;
        };
        let running = match self
            .client
            .wait_for_instance_running(&vm.instance_id, self.transition.convergence_timeout)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                self.fail(&vm, VmStatus::Starting, format!("{:#}", e)).await;
                return;
            }
        };

        let port = self.get_config().await.service_port;
        let services = match running.public_ip.as_deref() {
            Some(ip) => {
                let ready = self
                    .client
                    .wait_for_services_ready(
                        ip,
                        port,
                        self.transition.services_ready_timeout,
                        self.transition.services_poll_interval,
                    )
                    .await;
                if ready {
                    VmServices {
                        reachable: true,
                        control_plane_connected: true,
                        reason: None,
                        response_time_ms: None,
                        checked_at: Utc::now(),
                    }
                } else {
                    VmServices::unreachable(format!(
                        "services not ready within {}s",
                        self.transition.services_ready_timeout.as_secs()
                    ))
                }
            }
            None => VmServices::unreachable("no public address"),
        };
        let services_ready = services.is_fully_healthy();

        // Re-read: the record may have been refreshed while we waited.
        let Some(current) = self.get_vm(vm_id).await else {
            return;
        };
        let now = Utc::now();
        let mut ready = current.clone();
        ready.public_ip = running.public_ip.clone();
        ready.private_ip = running.private_ip.clone();
        ready.availability_zone = running.availability_zone.clone();
        ready.services = Some(services);
        ready.last_health_check = Some(now);
        ready.set_status(VmStatus::Available, now);

        match self.store.compare_and_set_vm(&ready, VmStatus::Starting).await {
            Ok(true) => {
                self.cache_put(ready).await;
                tracing::info!(vm_id, services_ready, "✅ VM ready");
                self.events.publish(PoolEvent::VmReady {
                    vm_id: vm_id.to_string(),
                    services_ready,
                });
            }
            Ok(false) => tracing::warn!(vm_id, "VM left STARTING during convergence, result dropped"),
            Err(e) => tracing::error!(vm_id, error = %e, "failed to persist AVAILABLE status"),
        }
    }

    async fn converge_stop(&self, vm_id: &str) {
        let Some(vm) = self.get_vm(vm_id).await else {
            return;
        };
        if let Err(e) = self
            .client
            .wait_for_instance_stopped(&vm.instance_id, self.transition.convergence_timeout)
            .await
        {
            self.fail(&vm, VmStatus::Stopping, format!("{:#}", e)).await;
            return;
        }

        let Some(current) = self.get_vm(vm_id).await else {
            return;
        };
        let mut stopped = current.clone();
        stopped.set_status(VmStatus::Stopped, Utc::now());
        match self.store.compare_and_set_vm(&stopped, VmStatus::Stopping).await {
            Ok(true) => {
                self.cache_put(stopped).await;
                tracing::info!(vm_id, "💤 VM stopped");
                self.events.publish(PoolEvent::VmStopped {
                    vm_id: vm_id.to_string(),
                });
            }
            Ok(false) => tracing::warn!(vm_id, "VM left STOPPING during convergence, result dropped"),
            Err(e) => tracing::error!(vm_id, error = %e, "failed to persist STOPPED status"),
        }
    }
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("provider", &self.client.provider_name())
            .field("in_flight", &self.tasks.in_flight())
            .finish()
    }
}

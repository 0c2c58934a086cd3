//! Shared pool store: durability layer and cross-process synchronization point.
//!
//! Change notifications only carry keys. Subscribers re-read the store, so a late
//! notification can never roll a cache back to an older record.

use async_trait::async_trait;
use castpool_common::bus::VmAddress;
use castpool_common::{PoolConfig, VmRecord, VmStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store closed")]
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreChange {
    Config,
    Vm { vm_id: String },
    WorkloadAddress { workload_id: String },
}

#[async_trait]
pub trait PoolStore: Send + Sync {
    async fn get_config(&self) -> Result<Option<PoolConfig>, StoreError>;
    async fn put_config(&self, config: &PoolConfig) -> Result<(), StoreError>;

    async fn list_vms(&self) -> Result<Vec<VmRecord>, StoreError>;
    async fn get_vm(&self, vm_id: &str) -> Result<Option<VmRecord>, StoreError>;
    async fn put_vm(&self, vm: &VmRecord) -> Result<(), StoreError>;

    /// Write `vm` only if the stored record still has status `expected`.
    /// Returns `false` (nothing written) when the record is missing or has moved on.
    async fn compare_and_set_vm(&self, vm: &VmRecord, expected: VmStatus) -> Result<bool, StoreError>;

    async fn delete_vm(&self, vm_id: &str) -> Result<(), StoreError>;

    async fn get_workload_address(&self, workload_id: &str) -> Result<Option<VmAddress>, StoreError>;
    async fn put_workload_address(&self, workload_id: &str, address: &VmAddress) -> Result<(), StoreError>;
    async fn delete_workload_address(&self, workload_id: &str) -> Result<(), StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

// -----------------------------------------------------------------------------
// In-memory store
// -----------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    config: Option<PoolConfig>,
    vms: BTreeMap<String, VmRecord>,
    addresses: HashMap<String, VmAddress>,
}

/// Process-local store for tests and single-node runs.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    changes: broadcast::Sender<StoreChange>,
    fail_writes: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(MemoryInner::default()),
            changes,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail with [`StoreError::Closed`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn notify(&self, change: StoreChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }
}

#[async_trait]
impl PoolStore for MemoryStore {
    async fn get_config(&self) -> Result<Option<PoolConfig>, StoreError> {
        Ok(self.inner.lock().await.config.clone())
    }

    async fn put_config(&self, config: &PoolConfig) -> Result<(), StoreError> {
        self.check_writable()?;
        self.inner.lock().await.config = Some(config.clone());
        self.notify(StoreChange::Config);
        Ok(())
    }

    async fn list_vms(&self) -> Result<Vec<VmRecord>, StoreError> {
        Ok(self.inner.lock().await.vms.values().cloned().collect())
    }

    async fn get_vm(&self, vm_id: &str) -> Result<Option<VmRecord>, StoreError> {
        Ok(self.inner.lock().await.vms.get(vm_id).cloned())
    }

    async fn put_vm(&self, vm: &VmRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        self.inner
            .lock()
            .await
            .vms
            .insert(vm.vm_id.clone(), vm.clone());
        self.notify(StoreChange::Vm {
            vm_id: vm.vm_id.clone(),
        });
        Ok(())
    }

    async fn compare_and_set_vm(&self, vm: &VmRecord, expected: VmStatus) -> Result<bool, StoreError> {
        self.check_writable()?;
        {
            let mut inner = self.inner.lock().await;
            match inner.vms.get(&vm.vm_id) {
                Some(current) if current.status == expected => {}
                _ => return Ok(false),
            }
            inner.vms.insert(vm.vm_id.clone(), vm.clone());
        }
        self.notify(StoreChange::Vm {
            vm_id: vm.vm_id.clone(),
        });
        Ok(true)
    }

    async fn delete_vm(&self, vm_id: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        self.inner.lock().await.vms.remove(vm_id);
        self.notify(StoreChange::Vm {
            vm_id: vm_id.to_string(),
        });
        Ok(())
    }

    async fn get_workload_address(&self, workload_id: &str) -> Result<Option<VmAddress>, StoreError> {
        Ok(self.inner.lock().await.addresses.get(workload_id).cloned())
    }

    async fn put_workload_address(&self, workload_id: &str, address: &VmAddress) -> Result<(), StoreError> {
        self.check_writable()?;
        self.inner
            .lock()
            .await
            .addresses
            .insert(workload_id.to_string(), address.clone());
        self.notify(StoreChange::WorkloadAddress {
            workload_id: workload_id.to_string(),
        });
        Ok(())
    }

    async fn delete_workload_address(&self, workload_id: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        self.inner.lock().await.addresses.remove(workload_id);
        self.notify(StoreChange::WorkloadAddress {
            workload_id: workload_id.to_string(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

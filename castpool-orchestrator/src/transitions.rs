use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// Which cloud-side state a background task is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    Start,
    Stop,
}

enum Slot {
    /// Claimed by a caller that is still issuing the provider call.
    Reserved,
    Running(JoinHandle<()>),
}

impl Slot {
    fn is_live(&self) -> bool {
        match self {
            Slot::Reserved => true,
            Slot::Running(handle) => !handle.is_finished(),
        }
    }
}

/// Supervised convergence tasks, at most one per VM.
///
/// Finished tasks are reaped lazily on every access, so `in_flight()` is the
/// source of truth reconciliation uses to tell an orphaned STARTING/STOPPING
/// record from one that is still being driven. A key counts as in flight from
/// the moment it is reserved, before any task exists.
#[derive(Clone, Default)]
pub struct TransitionTasks {
    inner: Arc<Mutex<HashMap<String, Slot>>>,
}

/// Claim on a key taken before the transient status is written. Spawning
/// through it hands the key over to the task; dropping it releases the key.
pub struct Reservation {
    tasks: TransitionTasks,
    key: String,
}

impl Reservation {
    pub fn spawn<F>(self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks
            .lock()
            .insert(self.key.clone(), Slot::Running(tokio::spawn(fut)));
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut tasks = self.tasks.lock();
        if matches!(tasks.get(&self.key), Some(Slot::Reserved)) {
            tasks.remove(&self.key);
        }
    }
}

impl TransitionTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        // A panicking holder cannot leave the map half-written.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `key` ahead of spawning. `None` if it is already reserved or running.
    pub fn reserve(&self, key: &str) -> Option<Reservation> {
        let mut tasks = self.lock();
        tasks.retain(|_, slot| slot.is_live());
        if tasks.contains_key(key) {
            tracing::debug!(vm_id = key, "convergence already in flight");
            return None;
        }
        tasks.insert(key.to_string(), Slot::Reserved);
        Some(Reservation {
            tasks: self.clone(),
            key: key.to_string(),
        })
    }

    /// Spawn `fut` under `key`. Returns `false` (and drops `fut`) if the key is
    /// reserved or a task for it is still running.
    pub fn spawn<F>(&self, key: &str, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock();
        tasks.retain(|_, slot| slot.is_live());
        if tasks.contains_key(key) {
            tracing::debug!(vm_id = key, "convergence already in flight");
            return false;
        }
        tasks.insert(key.to_string(), Slot::Running(tokio::spawn(fut)));
        true
    }

    pub fn in_flight(&self) -> Vec<String> {
        let mut tasks = self.lock();
        tasks.retain(|_, slot| slot.is_live());
        let mut keys: Vec<String> = tasks.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.lock().get(key).map(Slot::is_live).unwrap_or(false)
    }

    /// Await every running task, including ones spawned while waiting.
    /// Reservations are left in place.
    pub async fn wait_idle(&self) {
        loop {
            let handles: Vec<(String, JoinHandle<()>)> = {
                let mut tasks = self.lock();
                let running: Vec<String> = tasks
                    .iter()
                    .filter(|(_, slot)| matches!(slot, Slot::Running(_)))
                    .map(|(key, _)| key.clone())
                    .collect();
                running
                    .into_iter()
                    .filter_map(|key| match tasks.remove(&key) {
                        Some(Slot::Running(handle)) => Some((key, handle)),
                        _ => None,
                    })
                    .collect()
            };
            if handles.is_empty() {
                return;
            }
            for (key, handle) in handles {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        tracing::error!(vm_id = %key, "convergence task panicked");
                    }
                }
            }
        }
    }

    pub fn shutdown(&self) {
        for (key, slot) in self.lock().drain() {
            if let Slot::Running(handle) = slot {
                tracing::info!(vm_id = %key, "aborting convergence task");
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn refuses_duplicates_until_finished() {
        let tasks = TransitionTasks::new();
        let (tx, rx) = oneshot::channel::<()>();
        assert!(tasks.spawn("vm-1", async move {
            let _ = rx.await;
        }));
        assert!(!tasks.spawn("vm-1", async {}));
        assert_eq!(tasks.in_flight(), vec!["vm-1".to_string()]);

        tx.send(()).unwrap();
        tasks.wait_idle().await;
        assert!(tasks.in_flight().is_empty());
        assert!(tasks.spawn("vm-1", async {}));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_everything() {
        let tasks = TransitionTasks::new();
        tasks.spawn("vm-1", tokio::time::sleep(Duration::from_secs(3600)));
        tasks.spawn("vm-2", tokio::time::sleep(Duration::from_secs(3600)));
        assert!(tasks.is_in_flight("vm-2"));
        tasks.shutdown();
        assert!(tasks.in_flight().is_empty());
    }

    #[tokio::test]
    async fn reservation_counts_as_in_flight() {
        let tasks = TransitionTasks::new();
        let reservation = tasks.reserve("vm-1").unwrap();
        assert!(tasks.is_in_flight("vm-1"));
        assert!(tasks.reserve("vm-1").is_none());
        assert!(!tasks.spawn("vm-1", async {}));

        // Waiting does not swallow a pending reservation.
        tasks.wait_idle().await;
        assert_eq!(tasks.in_flight(), vec!["vm-1".to_string()]);

        drop(reservation);
        assert!(tasks.in_flight().is_empty());

        let reservation = tasks.reserve("vm-1").unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        reservation.spawn(async move {
            let _ = rx.await;
        });
        assert!(tasks.is_in_flight("vm-1"));
        tx.send(()).unwrap();
        tasks.wait_idle().await;
        assert!(tasks.in_flight().is_empty());
    }
}

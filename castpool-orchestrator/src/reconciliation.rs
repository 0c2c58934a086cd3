use castpool_common::{VmRecord, VmStatus};
use castpool_providers::inventory::{InstanceInfo, InstanceState};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use crate::transitions::Convergence;

/// Tag carrying the pool-local id, written at provisioning time.
pub const TAG_VM_ID: &str = "VmId";

/// Pool-local id for a discovered instance.
pub fn vm_id_for(info: &InstanceInfo) -> String {
    if let Some(id) = info.tags.get(TAG_VM_ID).filter(|v| !v.trim().is_empty()) {
        return id.trim().to_string();
    }
    let bare = info.instance_id.strip_prefix("i-").unwrap_or(&info.instance_id);
    format!("vm-{}", bare)
}

#[derive(Debug, Default)]
pub struct ReconcilePlan {
    /// Records to write (new or changed). Existing records carry the status they
    /// were read with so the write can be conditional.
    pub upserts: Vec<Upsert>,
    /// Records whose instance is gone.
    pub removed: Vec<VmRecord>,
    /// Transient records that need a fresh convergence task.
    pub resume: Vec<(String, Convergence)>,
    pub added: usize,
    pub corrected: usize,
}

#[derive(Debug)]
pub struct Upsert {
    pub record: VmRecord,
    /// `None` for records the store has never seen.
    pub expected: Option<VmStatus>,
    /// Workload whose assignment this correction clears.
    pub dropped_owner: Option<String>,
}

fn new_record(info: &InstanceInfo, vm_id: String, now: DateTime<Utc>) -> VmRecord {
    let status = match info.state {
        InstanceState::Running => VmStatus::Available,
        InstanceState::Pending => VmStatus::Starting,
        InstanceState::Stopping => VmStatus::Stopping,
        _ => VmStatus::Stopped,
    };
    let mut vm = VmRecord {
        vm_id,
        instance_id: info.instance_id.clone(),
        name: info
            .name
            .clone()
            .unwrap_or_else(|| VmRecord::default_name(&info.instance_id)),
        status,
        public_ip: None,
        private_ip: None,
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
    if status != VmStatus::Stopped {
        vm.public_ip = info.public_ip.clone();
        vm.private_ip = info.private_ip.clone();
    }
    vm
}

/// Merge the provider's view into the stored records.
///
/// The provider is authoritative for existence and power state. A stored
/// STARTING/STOPPING with no task in `in_flight` is treated as a claim to be
/// re-checked, never as truth.
pub fn plan(
    existing: &[VmRecord],
    instances: &[InstanceInfo],
    in_flight: &HashSet<String>,
    now: DateTime<Utc>,
) -> ReconcilePlan {
    let mut out = ReconcilePlan::default();
    let by_instance: HashMap<&str, &VmRecord> = existing
        .iter()
        .map(|vm| (vm.instance_id.as_str(), vm))
        .collect();
    let mut seen: HashSet<&str> = HashSet::new();

    for info in instances {
        if info.state.is_gone() {
            continue;
        }
        seen.insert(info.instance_id.as_str());

        let Some(current) = by_instance.get(info.instance_id.as_str()) else {
            let vm = new_record(info, vm_id_for(info), now);
            match vm.status {
                VmStatus::Starting => out.resume.push((vm.vm_id.clone(), Convergence::Start)),
                VmStatus::Stopping => out.resume.push((vm.vm_id.clone(), Convergence::Stop)),
                _ => {}
            }
            tracing::info!(vm_id = %vm.vm_id, instance_id = %vm.instance_id, status = %vm.status, "discovered instance");
            out.added += 1;
            out.upserts.push(Upsert {
                record: vm,
                expected: None,
                dropped_owner: None,
            });
            continue;
        };

        let mut vm = (*current).clone();
        vm.instance_type = info.instance_type.clone();
        vm.availability_zone = info.availability_zone.clone();
        vm.launch_time = info.launch_time;
        vm.tags = info.tags.clone();

        let driven = in_flight.contains(&vm.vm_id);
        let before = vm.status;
        match info.state {
            InstanceState::Running => {
                vm.public_ip = info.public_ip.clone();
                vm.private_ip = info.private_ip.clone();
                let stale = matches!(before, VmStatus::Stopped)
                    || (before.is_transient() && !driven);
                if stale {
                    let target = if vm.assigned_to.is_some() {
                        VmStatus::Assigned
                    } else {
                        VmStatus::Available
                    };
                    vm.set_status(target, now);
                }
            }
            InstanceState::Stopped => {
                let stale = matches!(
                    before,
                    VmStatus::Available | VmStatus::Assigned | VmStatus::InUse | VmStatus::Error
                ) || (before.is_transient() && !driven);
                if stale {
                    vm.set_status(VmStatus::Stopped, now);
                }
            }
            InstanceState::Pending if !driven => {
                vm.set_status(VmStatus::Starting, now);
                out.resume.push((vm.vm_id.clone(), Convergence::Start));
            }
            InstanceState::Stopping if !driven => {
                vm.set_status(VmStatus::Stopping, now);
                out.resume.push((vm.vm_id.clone(), Convergence::Stop));
            }
            _ => {}
        }

        if vm.status != before {
            tracing::warn!(
                vm_id = %vm.vm_id,
                from = %before,
                to = %vm.status,
                provider_state = %info.state,
                "correcting stale status"
            );
            out.corrected += 1;
        }
        if vm != **current {
            let dropped_owner = match (&current.assigned_to, &vm.assigned_to) {
                (Some(owner), None) => Some(owner.clone()),
                _ => None,
            };
            out.upserts.push(Upsert {
                record: vm,
                expected: Some(before),
                dropped_owner,
            });
        }
    }

    for vm in existing {
        if !seen.contains(vm.instance_id.as_str()) {
            tracing::info!(vm_id = %vm.vm_id, instance_id = %vm.instance_id, "🔴 instance gone, pruning record");
            out.removed.push(vm.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, state: InstanceState) -> InstanceInfo {
        let running = state == InstanceState::Running;
        InstanceInfo {
            instance_id: id.to_string(),
            name: None,
            state,
            public_ip: running.then(|| "203.0.113.5".to_string()),
            private_ip: running.then(|| "10.0.0.5".to_string()),
            instance_type: "g4dn.xlarge".to_string(),
            availability_zone: Some("us-east-1a".to_string()),
            launch_time: None,
            tags: HashMap::new(),
        }
    }

    fn record(info: &InstanceInfo, status: VmStatus) -> VmRecord {
        let mut vm = new_record(info, vm_id_for(info), Utc::now());
        vm.status = status;
        vm
    }

    #[test]
    fn vm_id_prefers_tag() {
        let mut i = info("i-0abc", InstanceState::Running);
        assert_eq!(vm_id_for(&i), "vm-0abc");
        i.tags.insert(TAG_VM_ID.into(), "vm-custom".into());
        assert_eq!(vm_id_for(&i), "vm-custom");
    }

    #[test]
    fn discovers_new_instances_by_state() {
        let instances = vec![
            info("i-1", InstanceState::Running),
            info("i-2", InstanceState::Stopped),
            info("i-3", InstanceState::Pending),
            info("i-4", InstanceState::Terminated),
        ];
        let plan = plan(&[], &instances, &HashSet::new(), Utc::now());
        assert_eq!(plan.added, 3);
        let status: HashMap<_, _> = plan
            .upserts
            .iter()
            .map(|u| (u.record.instance_id.as_str(), u.record.status))
            .collect();
        assert_eq!(status["i-1"], VmStatus::Available);
        assert_eq!(status["i-2"], VmStatus::Stopped);
        assert_eq!(status["i-3"], VmStatus::Starting);
        assert_eq!(plan.resume, vec![("vm-3".to_string(), Convergence::Start)]);
    }

    #[test]
    fn prunes_missing_and_keeps_assignment() {
        let running = info("i-1", InstanceState::Running);
        let mut assigned = record(&running, VmStatus::InUse);
        assigned.assigned_to = Some("comp-1".into());
        let gone = record(&info("i-9", InstanceState::Running), VmStatus::Available);

        let plan = plan(&[assigned, gone], &[running], &HashSet::new(), Utc::now());
        assert_eq!(plan.removed.len(), 1);
        assert_eq!(plan.removed[0].instance_id, "i-9");
        assert!(plan.upserts.is_empty(), "unchanged record must not be rewritten");
        assert_eq!(plan.corrected, 0);
    }

    #[test]
    fn stale_transient_is_rechecked() {
        let running = info("i-1", InstanceState::Running);
        let stopped = info("i-2", InstanceState::Stopped);
        let existing = vec![
            record(&running, VmStatus::Starting),
            record(&stopped, VmStatus::Stopping),
        ];
        let plan = plan(&existing, &[running, stopped], &HashSet::new(), Utc::now());
        assert_eq!(plan.corrected, 2);
        let by_id: HashMap<_, _> = plan
            .upserts
            .iter()
            .map(|u| (u.record.instance_id.as_str(), u))
            .collect();
        assert_eq!(by_id["i-1"].record.status, VmStatus::Available);
        assert_eq!(by_id["i-1"].expected, Some(VmStatus::Starting));
        assert_eq!(by_id["i-2"].record.status, VmStatus::Stopped);
        assert!(by_id["i-2"].record.public_ip.is_none());
    }

    #[test]
    fn driven_transient_is_left_alone() {
        let running = info("i-1", InstanceState::Running);
        let mut existing = record(&running, VmStatus::Starting);
        existing.public_ip = running.public_ip.clone();
        existing.private_ip = running.private_ip.clone();
        let in_flight = HashSet::from([existing.vm_id.clone()]);
        let plan = plan(&[existing], &[running], &in_flight, Utc::now());
        assert_eq!(plan.corrected, 0);
        assert!(plan.resume.is_empty());
    }

    #[test]
    fn orphaned_pending_gets_a_new_task() {
        let pending = info("i-1", InstanceState::Pending);
        let existing = record(&pending, VmStatus::Starting);
        let plan = plan(&[existing], &[pending], &HashSet::new(), Utc::now());
        assert_eq!(plan.resume, vec![("vm-1".to_string(), Convergence::Start)]);
        assert_eq!(plan.corrected, 0);
    }

    #[test]
    fn out_of_band_stop_drops_the_owner() {
        let stopped = info("i-1", InstanceState::Stopped);
        let mut assigned = record(&info("i-1", InstanceState::Running), VmStatus::Assigned);
        assigned.assigned_to = Some("comp-1".into());

        let plan = plan(&[assigned], &[stopped], &HashSet::new(), Utc::now());
        assert_eq!(plan.corrected, 1);
        let upsert = &plan.upserts[0];
        assert_eq!(upsert.record.status, VmStatus::Stopped);
        assert!(upsert.record.assigned_to.is_none());
        assert_eq!(upsert.dropped_owner.as_deref(), Some("comp-1"));
    }
}

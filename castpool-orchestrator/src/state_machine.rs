use castpool_common::{VmRecord, VmStatus};

/// Caller-requested operations that move a VM between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Assign,
    MarkInUse,
    Release,
    Start,
    Stop,
    Reboot,
    Terminate,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Assign => "assign",
            Operation::MarkInUse => "mark_in_use",
            Operation::Release => "release",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Reboot => "reboot",
            Operation::Terminate => "terminate",
        }
    }

    /// Human-readable precondition, used in error messages.
    pub fn precondition(&self) -> &'static str {
        match self {
            Operation::Assign => "status AVAILABLE and unassigned",
            Operation::MarkInUse => "status ASSIGNED",
            Operation::Release => "status ASSIGNED, IN_USE or ERROR with an owner",
            Operation::Start => "status STOPPED",
            Operation::Stop => "unassigned with status AVAILABLE or ERROR",
            Operation::Reboot => "unassigned with status AVAILABLE or ERROR",
            Operation::Terminate => "unassigned with status STOPPED or ERROR",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status the VM moves to when `op` is accepted, or `None` if the current
/// status/assignment forbids it. Terminate yields `STOPPING` (the record is
/// removed once the instance is gone).
pub fn next_status(vm: &VmRecord, op: Operation) -> Option<VmStatus> {
    let unassigned = vm.assigned_to.is_none();
    match (op, vm.status) {
        (Operation::Assign, VmStatus::Available) if unassigned => Some(VmStatus::Assigned),
        (Operation::MarkInUse, VmStatus::Assigned) => Some(VmStatus::InUse),
        (Operation::Release, VmStatus::Assigned | VmStatus::InUse) => Some(VmStatus::Available),
        (Operation::Release, VmStatus::Error) if !unassigned => Some(VmStatus::Error),
        (Operation::Start, VmStatus::Stopped) => Some(VmStatus::Starting),
        (Operation::Stop, VmStatus::Available | VmStatus::Error) if unassigned => Some(VmStatus::Stopping),
        (Operation::Reboot, VmStatus::Available | VmStatus::Error) if unassigned => Some(VmStatus::Starting),
        (Operation::Terminate, VmStatus::Stopped | VmStatus::Error) if unassigned => Some(VmStatus::Stopping),
        _ => None,
    }
}

/// Target of a health threshold crossed unhealthy: any running state goes ERROR once.
pub fn unhealthy_target(vm: &VmRecord) -> Option<VmStatus> {
    match vm.status {
        VmStatus::Available | VmStatus::Assigned | VmStatus::InUse => Some(VmStatus::Error),
        _ => None,
    }
}

/// Target of a health threshold crossed healthy: ERROR goes back to whatever the owner implies.
pub fn recovery_target(vm: &VmRecord) -> Option<VmStatus> {
    if vm.status != VmStatus::Error {
        return None;
    }
    Some(if vm.assigned_to.is_some() {
        VmStatus::Assigned
    } else {
        VmStatus::Available
    })
}

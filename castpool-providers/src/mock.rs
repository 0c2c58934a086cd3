use crate::inventory::{InstanceFilter, InstanceInfo, InstanceState, LaunchRequest, StateChange};
use crate::{ApiError, CloudProvider};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

pub const OP_DESCRIBE: &str = "describe_instances";
pub const OP_START: &str = "start_instances";
pub const OP_STOP: &str = "stop_instances";
pub const OP_REBOOT: &str = "reboot_instances";
pub const OP_TERMINATE: &str = "terminate_instances";
pub const OP_RUN: &str = "run_instance";
pub const OP_TAGS: &str = "create_tags";

struct MockInstance {
    info: InstanceInfo,
    // Remaining describe polls before a pending/stopping instance settles.
    settle_in: Option<u32>,
    ip_seq: u32,
}

#[derive(Default)]
struct MockState {
    instances: HashMap<String, MockInstance>,
    failures: HashMap<&'static str, VecDeque<anyhow::Error>>,
    calls: HashMap<&'static str, usize>,
    // None: transitions never settle.
    settle_polls: Option<u32>,
    next_id: u32,
}

/// In-memory provider used for local runs and tests.
///
/// Start/stop requests put instances in `pending`/`stopping`; they settle after a
/// configurable number of describe polls (0 = immediately visible on the next describe).
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                settle_polls: Some(0),
                ..Default::default()
            }),
        }
    }

    /// Number of describe polls before pending/stopping instances settle. `None` never settles.
    pub async fn set_settle_polls(&self, polls: Option<u32>) {
        self.state.lock().await.settle_polls = polls;
    }

    pub async fn add_instance(&self, instance_id: &str, state: InstanceState, tags: HashMap<String, String>) {
        let mut st = self.state.lock().await;
        st.next_id += 1;
        let ip_seq = st.next_id;
        let running = state == InstanceState::Running;
        st.instances.insert(
            instance_id.to_string(),
            MockInstance {
                info: InstanceInfo {
                    instance_id: instance_id.to_string(),
                    name: tags.get("Name").cloned(),
                    state,
                    public_ip: running.then(|| public_ip(ip_seq)),
                    private_ip: running.then(|| private_ip(ip_seq)),
                    instance_type: "g4dn.xlarge".to_string(),
                    availability_zone: Some("mock-1a".to_string()),
                    launch_time: Some(Utc::now()),
                    tags,
                },
                settle_in: None,
                ip_seq,
            },
        );
    }

    /// Simulates an instance disappearing on the provider side.
    pub async fn remove_instance(&self, instance_id: &str) {
        self.state.lock().await.instances.remove(instance_id);
    }

    pub async fn set_public_ip(&self, instance_id: &str, ip: Option<&str>) {
        if let Some(inst) = self.state.lock().await.instances.get_mut(instance_id) {
            inst.info.public_ip = ip.map(|s| s.to_string());
        }
    }

    pub async fn instance_state(&self, instance_id: &str) -> Option<InstanceState> {
        self.state
            .lock()
            .await
            .instances
            .get(instance_id)
            .map(|i| i.info.state)
    }

    /// Queue an error to be returned by the next call to `op`.
    pub async fn fail_next(&self, op: &'static str, err: anyhow::Error) {
        self.state
            .lock()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub async fn fail_next_api(&self, op: &'static str, code: &str) {
        self.fail_next(op, ApiError::new(code, "injected by mock").into())
            .await;
    }

    pub async fn calls(&self, op: &'static str) -> usize {
        self.state.lock().await.calls.get(op).copied().unwrap_or(0)
    }

    fn enter(st: &mut MockState, op: &'static str) -> Result<()> {
        *st.calls.entry(op).or_default() += 1;
        if let Some(err) = st.failures.get_mut(op).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        Ok(())
    }

    fn begin_transition(st: &mut MockState, id: &str, target: InstanceState) -> Result<StateChange> {
        let settle = st.settle_polls;
        let inst = st.instances.get_mut(id).ok_or_else(|| {
            anyhow::Error::from(ApiError::new(
                "InvalidInstanceID.NotFound",
                format!("The instance ID '{}' does not exist", id),
            ))
        })?;
        let previous = inst.info.state;
        let intermediate = match target {
            InstanceState::Running => InstanceState::Pending,
            InstanceState::Stopped => InstanceState::Stopping,
            other => other,
        };
        if previous == target {
            return Ok(StateChange {
                instance_id: id.to_string(),
                previous,
                current: target,
            });
        }
        inst.info.state = intermediate;
        inst.settle_in = settle;
        Ok(StateChange {
            instance_id: id.to_string(),
            previous,
            current: intermediate,
        })
    }

    fn advance(inst: &mut MockInstance) {
        let Some(remaining) = inst.settle_in else {
            return;
        };
        if remaining > 0 {
            inst.settle_in = Some(remaining - 1);
            return;
        }
        match inst.info.state {
            InstanceState::Pending => {
                inst.info.state = InstanceState::Running;
                inst.info.public_ip = Some(public_ip(inst.ip_seq));
                inst.info.private_ip = Some(private_ip(inst.ip_seq));
            }
            InstanceState::Stopping => {
                inst.info.state = InstanceState::Stopped;
                inst.info.public_ip = None;
                inst.info.private_ip = None;
            }
            InstanceState::ShuttingDown => {
                inst.info.state = InstanceState::Terminated;
                inst.info.public_ip = None;
                inst.info.private_ip = None;
            }
            _ => {}
        }
        inst.settle_in = None;
    }
}

fn public_ip(seq: u32) -> String {
    format!("203.0.113.{}", seq % 250 + 1)
}

fn private_ip(seq: u32) -> String {
    format!("10.0.0.{}", seq % 250 + 1)
}

#[async_trait]
impl CloudProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn describe_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceInfo>> {
        let mut st = self.state.lock().await;
        Self::enter(&mut st, OP_DESCRIBE)?;
        let mut out = Vec::new();
        for inst in st.instances.values_mut() {
            if !filter.instance_ids.is_empty() && !filter.instance_ids.contains(&inst.info.instance_id) {
                continue;
            }
            Self::advance(inst);
            if filter.matches(&inst.info) {
                out.push(inst.info.clone());
            }
        }
        out.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(out)
    }

    async fn start_instances(&self, instance_ids: &[String]) -> Result<Vec<StateChange>> {
        let mut st = self.state.lock().await;
        Self::enter(&mut st, OP_START)?;
        instance_ids
            .iter()
            .map(|id| Self::begin_transition(&mut st, id, InstanceState::Running))
            .collect()
    }

    async fn stop_instances(&self, instance_ids: &[String], _force: bool) -> Result<Vec<StateChange>> {
        let mut st = self.state.lock().await;
        Self::enter(&mut st, OP_STOP)?;
        instance_ids
            .iter()
            .map(|id| Self::begin_transition(&mut st, id, InstanceState::Stopped))
            .collect()
    }

    async fn reboot_instances(&self, instance_ids: &[String]) -> Result<()> {
        let mut st = self.state.lock().await;
        Self::enter(&mut st, OP_REBOOT)?;
        for id in instance_ids {
            if !st.instances.contains_key(id) {
                return Err(ApiError::new(
                    "InvalidInstanceID.NotFound",
                    format!("The instance ID '{}' does not exist", id),
                )
                .into());
            }
        }
        Ok(())
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<Vec<StateChange>> {
        let mut st = self.state.lock().await;
        Self::enter(&mut st, OP_TERMINATE)?;
        instance_ids
            .iter()
            .map(|id| Self::begin_transition(&mut st, id, InstanceState::ShuttingDown))
            .collect()
    }

    async fn run_instance(&self, request: &LaunchRequest) -> Result<InstanceInfo> {
        let mut st = self.state.lock().await;
        Self::enter(&mut st, OP_RUN)?;
        st.next_id += 1;
        let seq = st.next_id;
        let instance_id = format!("i-mock{:08x}", seq);
        let mut tags = request.tags.clone();
        tags.insert("Name".to_string(), request.name.clone());
        let info = InstanceInfo {
            instance_id: instance_id.clone(),
            name: Some(request.name.clone()),
            state: InstanceState::Pending,
            public_ip: None,
            private_ip: None,
            instance_type: request.instance_type.clone(),
            availability_zone: Some("mock-1a".to_string()),
            launch_time: Some(Utc::now()),
            tags,
        };
        let settle_in = st.settle_polls;
        st.instances.insert(
            instance_id,
            MockInstance {
                info: info.clone(),
                settle_in,
                ip_seq: seq,
            },
        );
        Ok(info)
    }

    async fn create_tags(&self, instance_ids: &[String], tags: &HashMap<String, String>) -> Result<()> {
        let mut st = self.state.lock().await;
        Self::enter(&mut st, OP_TAGS)?;
        for id in instance_ids {
            if let Some(inst) = st.instances.get_mut(id) {
                inst.info.tags.extend(tags.clone());
            }
        }
        Ok(())
    }
}

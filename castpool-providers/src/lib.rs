use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Raw cloud compute calls. Implementations do not retry; callers wrap them.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &'static str;

    // For Reconciliation. Zero matches is an empty Vec, never an error.
    async fn describe_instances(
        &self,
        filter: &inventory::InstanceFilter,
    ) -> Result<Vec<inventory::InstanceInfo>>;

    async fn start_instances(&self, instance_ids: &[String]) -> Result<Vec<inventory::StateChange>>;

    async fn stop_instances(
        &self,
        instance_ids: &[String],
        force: bool,
    ) -> Result<Vec<inventory::StateChange>>;

    // Reboot is acknowledged without a state change payload.
    async fn reboot_instances(&self, instance_ids: &[String]) -> Result<()>;

    async fn terminate_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<inventory::StateChange>>;

    /// Launch exactly one instance.
    async fn run_instance(&self, request: &inventory::LaunchRequest) -> Result<inventory::InstanceInfo>;

    async fn create_tags(&self, instance_ids: &[String], tags: &HashMap<String, String>) -> Result<()>;
}

/// Error reported by the provider API itself (as opposed to transport failures).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub status: Option<u16>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

pub mod inventory {
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub enum InstanceState {
        Pending,
        Running,
        ShuttingDown,
        Terminated,
        Stopping,
        Stopped,
        Unknown,
    }

    impl InstanceState {
        pub fn from_name(name: &str) -> Self {
            match name.trim().to_lowercase().as_str() {
                "pending" => InstanceState::Pending,
                "running" => InstanceState::Running,
                "shutting-down" => InstanceState::ShuttingDown,
                "terminated" => InstanceState::Terminated,
                "stopping" => InstanceState::Stopping,
                "stopped" => InstanceState::Stopped,
                _ => InstanceState::Unknown,
            }
        }

        pub fn as_str(&self) -> &'static str {
            match self {
                InstanceState::Pending => "pending",
                InstanceState::Running => "running",
                InstanceState::ShuttingDown => "shutting-down",
                InstanceState::Terminated => "terminated",
                InstanceState::Stopping => "stopping",
                InstanceState::Stopped => "stopped",
                InstanceState::Unknown => "unknown",
            }
        }

        /// Gone for good (or about to be).
        pub fn is_gone(&self) -> bool {
            matches!(self, InstanceState::ShuttingDown | InstanceState::Terminated)
        }
    }

    impl std::fmt::Display for InstanceState {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /// Normalized view of one provider instance.
    #[derive(Clone, Debug, PartialEq)]
    pub struct InstanceInfo {
        pub instance_id: String,
        pub name: Option<String>,
        pub state: InstanceState,
        pub public_ip: Option<String>,
        pub private_ip: Option<String>,
        pub instance_type: String,
        pub availability_zone: Option<String>,
        pub launch_time: Option<DateTime<Utc>>,
        pub tags: HashMap<String, String>,
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    pub struct InstanceFilter {
        pub instance_ids: Vec<String>,
        pub tags: HashMap<String, String>,
        pub states: Vec<InstanceState>,
        pub vpc_id: Option<String>,
    }

    impl InstanceFilter {
        pub fn by_ids(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
            Self {
                instance_ids: ids.into_iter().map(Into::into).collect(),
                ..Default::default()
            }
        }

        pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
            self.tags.insert(key.into(), value.into());
            self
        }

        pub fn states(mut self, states: impl IntoIterator<Item = InstanceState>) -> Self {
            self.states = states.into_iter().collect();
            self
        }

        /// Client-side evaluation, used by providers without server-side filters.
        pub fn matches(&self, info: &InstanceInfo) -> bool {
            if !self.instance_ids.is_empty() && !self.instance_ids.contains(&info.instance_id) {
                return false;
            }
            if !self.states.is_empty() && !self.states.contains(&info.state) {
                return false;
            }
            self.tags
                .iter()
                .all(|(k, v)| info.tags.get(k).map(|actual| actual == v).unwrap_or(false))
        }
    }

    /// Provider acknowledgement of a requested state change.
    #[derive(Clone, Debug, PartialEq)]
    pub struct StateChange {
        pub instance_id: String,
        pub previous: InstanceState,
        pub current: InstanceState,
    }

    #[derive(Clone, Debug, Default)]
    pub struct LaunchRequest {
        pub name: String,
        pub instance_type: String,
        pub ami_id: String,
        pub tags: HashMap<String, String>,
        pub key_name: Option<String>,
        pub security_group_ids: Vec<String>,
        pub subnet_id: Option<String>,
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "ec2")]
pub mod ec2;

#[cfg(feature = "ec2")]
mod sigv4;

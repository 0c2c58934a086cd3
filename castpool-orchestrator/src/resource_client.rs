//! Resource client: every cloud call the pool makes goes through here.
//!
//! Provider-API calls are retried per [`RetryPolicy`]; the HTTP service probe is not
//! retried and never fails (all failure modes fold into `reachable = false`).

use async_trait::async_trait;
use castpool_common::VmServices;
use castpool_providers::inventory::{InstanceFilter, InstanceInfo, InstanceState, LaunchRequest, StateChange};
use castpool_providers::CloudProvider;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::retry::{with_retry, RetryPolicy};
use crate::settings::Settings;

pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
#[error("instance {instance_id} did not reach {target} within {timeout_secs}s")]
pub struct ConvergenceTimeout {
    pub instance_id: String,
    pub target: &'static str,
    pub timeout_secs: u64,
}

/// Probes a VM's own status endpoint.
#[async_trait]
pub trait ServiceProbe: Send + Sync {
    async fn check(&self, ip: &str, port: u16, timeout: Duration) -> VmServices;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusPayload {
    #[serde(alias = "obsConnected", default)]
    control_plane_connected: bool,
}

/// `GET http://{ip}:{port}/api/status`.
pub struct HttpServiceProbe {
    client: reqwest::Client,
}

impl HttpServiceProbe {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ServiceProbe for HttpServiceProbe {
    async fn check(&self, ip: &str, port: u16, timeout: Duration) -> VmServices {
        // Strip CIDR suffix if present (e.g. "1.2.3.4/32" -> "1.2.3.4")
        let clean_ip = ip.split('/').next().unwrap_or(ip);
        let url = format!("http://{}:{}/api/status", clean_ip, port);
        let start = std::time::Instant::now();

        let resp = match self.client.get(&url).timeout(timeout).send().await {
            Ok(r) => r,
            Err(e) => {
                let reason = if e.is_timeout() {
                    format!("timeout after {}ms", timeout.as_millis())
                } else if e.is_connect() {
                    format!("connection failed: {}", e)
                } else {
                    format!("request error: {}", e)
                };
                return VmServices::unreachable(reason);
            }
        };
        let elapsed = start.elapsed().as_millis() as u64;
        let status = resp.status();
        if !status.is_success() {
            let mut services = VmServices::unreachable(format!("HTTP {}", status.as_u16()));
            services.response_time_ms = Some(elapsed);
            return services;
        }

        let (control_plane_connected, reason) = match resp.json::<StatusPayload>().await {
            Ok(p) => (
                p.control_plane_connected,
                (!p.control_plane_connected).then(|| "control plane disconnected".to_string()),
            ),
            Err(e) => (false, Some(format!("invalid status payload: {}", e))),
        };
        VmServices {
            reachable: true,
            control_plane_connected,
            reason,
            response_time_ms: Some(elapsed),
            checked_at: Utc::now(),
        }
    }
}

/// Values applied to every launch unless the caller overrides them.
#[derive(Debug, Clone, Default)]
pub struct LaunchDefaults {
    pub ami_id: String,
    pub instance_type: String,
    pub key_name: Option<String>,
    pub security_group_ids: Vec<String>,
    pub subnet_id: Option<String>,
    pub vpc_id: Option<String>,
}

impl LaunchDefaults {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            ami_id: settings.ami_id.clone(),
            instance_type: settings.instance_type.clone(),
            key_name: settings.key_pair_name.clone(),
            security_group_ids: settings.security_group_id.iter().cloned().collect(),
            subnet_id: settings.subnet_id.clone(),
            vpc_id: settings.vpc_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub name: String,
    pub instance_type: Option<String>,
    pub ami_id: Option<String>,
    pub tags: HashMap<String, String>,
}

pub struct ResourceClient {
    provider: Arc<dyn CloudProvider>,
    probe: Arc<dyn ServiceProbe>,
    retry: RetryPolicy,
    launch: LaunchDefaults,
    ownership_tags: HashMap<String, String>,
    poll_interval: Duration,
}

impl ResourceClient {
    pub fn new(provider: Arc<dyn CloudProvider>, probe: Arc<dyn ServiceProbe>) -> Self {
        Self {
            provider,
            probe,
            retry: RetryPolicy::default(),
            launch: LaunchDefaults::default(),
            ownership_tags: Settings::default().ownership_tags(),
            poll_interval: Duration::from_secs(10),
        }
    }

    pub fn from_settings(
        provider: Arc<dyn CloudProvider>,
        probe: Arc<dyn ServiceProbe>,
        settings: &Settings,
    ) -> Self {
        Self::new(provider, probe)
            .with_launch_defaults(LaunchDefaults::from_settings(settings))
            .with_ownership_tags(settings.ownership_tags())
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_launch_defaults(mut self, launch: LaunchDefaults) -> Self {
        self.launch = launch;
        self
    }

    pub fn with_ownership_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.ownership_tags = tags;
        self
    }

    /// Waiter poll interval, clamped to 5-15s.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);
        self
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn ownership_tags(&self) -> &HashMap<String, String> {
        &self.ownership_tags
    }

    /// Filter matching every live instance this pool owns.
    pub fn pool_filter(&self) -> InstanceFilter {
        InstanceFilter {
            tags: self.ownership_tags.clone(),
            states: vec![
                InstanceState::Pending,
                InstanceState::Running,
                InstanceState::Stopping,
                InstanceState::Stopped,
            ],
            vpc_id: self.launch.vpc_id.clone(),
            ..Default::default()
        }
    }

    pub async fn describe_instances(&self, filter: &InstanceFilter) -> anyhow::Result<Vec<InstanceInfo>> {
        with_retry(&self.retry, "describe_instances", || self.provider.describe_instances(filter)).await
    }

    pub async fn describe_instance(&self, instance_id: &str) -> anyhow::Result<Option<InstanceInfo>> {
        let found = self
            .describe_instances(&InstanceFilter::by_ids([instance_id]))
            .await?;
        Ok(found.into_iter().find(|i| i.instance_id == instance_id))
    }

    pub async fn start_instances(&self, instance_ids: &[String]) -> anyhow::Result<Vec<StateChange>> {
        tracing::info!(instances = ?instance_ids, "starting instances");
        with_retry(&self.retry, "start_instances", || self.provider.start_instances(instance_ids)).await
    }

    pub async fn stop_instances(&self, instance_ids: &[String], force: bool) -> anyhow::Result<Vec<StateChange>> {
        tracing::info!(instances = ?instance_ids, force, "stopping instances");
        with_retry(&self.retry, "stop_instances", || {
            self.provider.stop_instances(instance_ids, force)
        })
        .await
    }

    pub async fn reboot_instances(&self, instance_ids: &[String]) -> anyhow::Result<()> {
        tracing::info!(instances = ?instance_ids, "rebooting instances");
        with_retry(&self.retry, "reboot_instances", || self.provider.reboot_instances(instance_ids)).await
    }

    pub async fn terminate_instances(&self, instance_ids: &[String]) -> anyhow::Result<Vec<StateChange>> {
        tracing::info!(instances = ?instance_ids, "terminating instances");
        with_retry(&self.retry, "terminate_instances", || {
            self.provider.terminate_instances(instance_ids)
        })
        .await
    }

    pub async fn tag_instances(
        &self,
        instance_ids: &[String],
        tags: &HashMap<String, String>,
    ) -> anyhow::Result<()> {
        with_retry(&self.retry, "create_tags", || self.provider.create_tags(instance_ids, tags)).await
    }

    /// Launch one instance from the template image with ownership + caller tags attached.
    pub async fn launch_instance(&self, spec: &LaunchSpec) -> anyhow::Result<InstanceInfo> {
        let mut tags = self.ownership_tags.clone();
        tags.insert("LaunchedAt".to_string(), Utc::now().to_rfc3339());
        tags.extend(spec.tags.clone());

        let request = LaunchRequest {
            name: spec.name.clone(),
            instance_type: spec
                .instance_type
                .clone()
                .unwrap_or_else(|| self.launch.instance_type.clone()),
            ami_id: spec.ami_id.clone().unwrap_or_else(|| self.launch.ami_id.clone()),
            tags,
            key_name: self.launch.key_name.clone(),
            security_group_ids: self.launch.security_group_ids.clone(),
            subnet_id: self.launch.subnet_id.clone(),
        };
        tracing::info!(name = %request.name, instance_type = %request.instance_type, "launching instance");
        with_retry(&self.retry, "run_instance", || self.provider.run_instance(&request)).await
    }

    pub async fn wait_for_instance_running(&self, instance_id: &str, timeout: Duration) -> anyhow::Result<InstanceInfo> {
        self.wait_for_state(instance_id, InstanceState::Running, timeout).await
    }

    pub async fn wait_for_instance_stopped(&self, instance_id: &str, timeout: Duration) -> anyhow::Result<InstanceInfo> {
        self.wait_for_state(instance_id, InstanceState::Stopped, timeout).await
    }

    async fn wait_for_state(
        &self,
        instance_id: &str,
        target: InstanceState,
        timeout: Duration,
    ) -> anyhow::Result<InstanceInfo> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.describe_instance(instance_id).await? {
                Some(info) if info.state == target => return Ok(info),
                Some(info) if info.state.is_gone() => {
                    anyhow::bail!(
                        "instance {} is {} while waiting for {}",
                        instance_id,
                        info.state,
                        target
                    );
                }
                Some(_) => {}
                None => anyhow::bail!("instance {} not found while waiting for {}", instance_id, target),
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ConvergenceTimeout {
                    instance_id: instance_id.to_string(),
                    target: target.as_str(),
                    timeout_secs: timeout.as_secs(),
                }
                .into());
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Never fails: all failure modes collapse into `reachable = false` with a reason.
    pub async fn check_instance_services(&self, ip: &str, port: u16, timeout: Duration) -> VmServices {
        let services = self.probe.check(ip, port, timeout).await;
        tracing::debug!(
            ip,
            port,
            reachable = services.reachable,
            control_plane = services.control_plane_connected,
            "service probe"
        );
        services
    }

    /// Probe at a fixed interval until fully healthy or `timeout` elapses.
    pub async fn wait_for_services_ready(
        &self,
        ip: &str,
        port: u16,
        timeout: Duration,
        interval: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let probe_timeout = DEFAULT_PROBE_TIMEOUT.min(remaining.max(Duration::from_millis(100)));
            if self
                .check_instance_services(ip, port, probe_timeout)
                .await
                .is_fully_healthy()
            {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(ip, port, timeout_secs = timeout.as_secs(), "services not ready before timeout");
                return false;
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{TAG_MANAGED_BY, TAG_PROJECT};
    use axum::routing::get;
    use axum::{Json, Router};
    use castpool_providers::mock::{MockProvider, OP_DESCRIBE, OP_START};
    use castpool_providers::inventory::InstanceState;

    struct DownProbe;

    #[async_trait]
    impl ServiceProbe for DownProbe {
        async fn check(&self, _ip: &str, _port: u16, _timeout: Duration) -> VmServices {
            VmServices::unreachable("down")
        }
    }

    async fn client_with(mock: Arc<MockProvider>) -> ResourceClient {
        ResourceClient::new(mock, Arc::new(DownProbe))
    }

    #[test]
    fn poll_interval_is_clamped() {
        let mock = Arc::new(MockProvider::new());
        let fast = ResourceClient::new(mock.clone(), Arc::new(DownProbe)).with_poll_interval(Duration::from_secs(1));
        assert_eq!(fast.poll_interval, MIN_POLL_INTERVAL);
        let slow = ResourceClient::new(mock, Arc::new(DownProbe)).with_poll_interval(Duration::from_secs(60));
        assert_eq!(slow.poll_interval, MAX_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_describe_is_retried_with_backoff() {
        let mock = Arc::new(MockProvider::new());
        mock.fail_next_api(OP_DESCRIBE, "Throttling").await;
        mock.fail_next_api(OP_DESCRIBE, "RequestLimitExceeded").await;
        let client = client_with(mock.clone()).await;

        let started = Instant::now();
        let found = client.describe_instances(&InstanceFilter::default()).await.unwrap();
        assert!(found.is_empty());
        assert_eq!(mock.calls(OP_DESCRIBE).await, 3);
        assert!(started.elapsed() >= Duration::from_millis(3_000));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_fails_once() {
        let mock = Arc::new(MockProvider::new());
        mock.add_instance("i-1", InstanceState::Stopped, HashMap::new()).await;
        mock.fail_next_api(OP_START, "UnauthorizedOperation").await;
        let client = client_with(mock.clone()).await;

        let err = client.start_instances(&["i-1".to_string()]).await.unwrap_err();
        assert_eq!(mock.calls(OP_START).await, 1);
        assert!(format!("{:#}", err).contains("start_instances"));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out_when_instance_never_settles() {
        let mock = Arc::new(MockProvider::new());
        mock.set_settle_polls(None).await;
        mock.add_instance("i-1", InstanceState::Stopped, HashMap::new()).await;
        let client = client_with(mock.clone()).await.with_poll_interval(Duration::from_secs(5));
        client.start_instances(&["i-1".to_string()]).await.unwrap();

        let err = client
            .wait_for_instance_running("i-1", Duration::from_secs(30))
            .await
            .unwrap_err();
        let timeout = err.downcast_ref::<ConvergenceTimeout>().expect("timeout error");
        assert_eq!(timeout.target, "running");
        assert_eq!(timeout.timeout_secs, 30);
        // one describe per 5s poll plus the initial one
        assert_eq!(mock.calls(OP_DESCRIBE).await, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_returns_fresh_addresses() {
        let mock = Arc::new(MockProvider::new());
        mock.set_settle_polls(Some(2)).await;
        mock.add_instance("i-1", InstanceState::Stopped, HashMap::new()).await;
        let client = client_with(mock.clone()).await;
        client.start_instances(&["i-1".to_string()]).await.unwrap();

        let info = client
            .wait_for_instance_running("i-1", Duration::from_secs(180))
            .await
            .unwrap();
        assert_eq!(info.state, InstanceState::Running);
        assert!(info.public_ip.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_fails_fast_for_missing_instance() {
        let mock = Arc::new(MockProvider::new());
        let client = client_with(mock).await;
        let err = client
            .wait_for_instance_stopped("i-gone", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ConvergenceTimeout>().is_none());
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn launch_attaches_ownership_and_caller_tags() {
        let mock = Arc::new(MockProvider::new());
        let client = client_with(mock).await.with_launch_defaults(LaunchDefaults {
            ami_id: "ami-obs".into(),
            instance_type: "g4dn.xlarge".into(),
            ..Default::default()
        });
        let info = client
            .launch_instance(&LaunchSpec {
                name: "castpool-vm-1".into(),
                tags: HashMap::from([("VmId".to_string(), "vm-1".to_string())]),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(info.tags.get(TAG_PROJECT).map(String::as_str), Some("castpool"));
        assert_eq!(info.tags.get(TAG_MANAGED_BY).map(String::as_str), Some("castpool-orchestrator"));
        assert_eq!(info.tags.get("VmId").map(String::as_str), Some("vm-1"));
        assert!(info.tags.contains_key("LaunchedAt"));
        assert!(client.pool_filter().matches(&info));
    }

    #[tokio::test]
    async fn tags_are_merged_onto_instances() {
        let mock = Arc::new(MockProvider::new());
        mock.add_instance("i-1", InstanceState::Running, HashMap::new()).await;
        let client = client_with(mock).await;
        assert!(client.describe_instances(&client.pool_filter()).await.unwrap().is_empty());

        client
            .tag_instances(&["i-1".to_string()], client.ownership_tags())
            .await
            .unwrap();
        let owned = client.describe_instances(&client.pool_filter()).await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(client.describe_instance("i-1").await.unwrap().unwrap().instance_id, "i-1");
        assert!(client.describe_instance("i-2").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn services_wait_gives_up_at_deadline() {
        let mock = Arc::new(MockProvider::new());
        let client = client_with(mock).await;
        let started = Instant::now();
        let ready = client
            .wait_for_services_ready("203.0.113.9", 8080, Duration::from_secs(20), Duration::from_secs(5))
            .await;
        assert!(!ready);
        assert!(started.elapsed() >= Duration::from_secs(20));
    }

    async fn serve(app: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn http_probe_reads_control_plane_flag() {
        let port = serve(Router::new().route(
            "/api/status",
            get(|| async { Json(serde_json::json!({ "controlPlaneConnected": true })) }),
        ))
        .await;
        let probe = HttpServiceProbe::new().unwrap();
        let services = probe.check("127.0.0.1/32", port, DEFAULT_PROBE_TIMEOUT).await;
        assert!(services.reachable);
        assert!(services.control_plane_connected);
        assert!(services.is_fully_healthy());
        assert!(services.response_time_ms.is_some());
    }

    #[tokio::test]
    async fn http_probe_reports_disconnected_control_plane() {
        let port = serve(Router::new().route(
            "/api/status",
            get(|| async { Json(serde_json::json!({ "obsConnected": false })) }),
        ))
        .await;
        let services = HttpServiceProbe::new()
            .unwrap()
            .check("127.0.0.1", port, DEFAULT_PROBE_TIMEOUT)
            .await;
        assert!(services.reachable);
        assert!(!services.control_plane_connected);
        assert_eq!(services.reason.as_deref(), Some("control plane disconnected"));
    }

    #[tokio::test]
    async fn http_probe_treats_errors_as_unreachable() {
        let port = serve(Router::new().route(
            "/api/status",
            get(|| async { axum::http::StatusCode::SERVICE_UNAVAILABLE }),
        ))
        .await;
        let probe = HttpServiceProbe::new().unwrap();
        let services = probe.check("127.0.0.1", port, DEFAULT_PROBE_TIMEOUT).await;
        assert!(!services.reachable);
        assert_eq!(services.reason.as_deref(), Some("HTTP 503"));

        let hung = serve(Router::new().route(
            "/api/status",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        ))
        .await;
        let services = probe.check("127.0.0.1", hung, Duration::from_millis(200)).await;
        assert!(!services.reachable);
        assert!(services.reason.unwrap().starts_with("timeout"));
    }
}

use std::collections::HashMap;
use std::env;
use std::fs;

pub const TAG_PROJECT: &str = "Project";
pub const TAG_MANAGED_BY: &str = "ManagedBy";

/// Process configuration, read from the environment with hard-coded fallbacks so the
/// orchestrator can boot without full configuration present.
#[derive(Debug, Clone)]
pub struct Settings {
    pub provider: String,
    pub region: String,
    pub vpc_id: Option<String>,
    pub security_group_id: Option<String>,
    pub subnet_id: Option<String>,
    pub key_pair_name: Option<String>,
    pub ami_id: String,
    pub instance_type: String,
    pub service_port: u16,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_session_token: Option<String>,
    pub redis_url: String,
    pub store_prefix: String,
    pub http_bind: String,
    /// `redis` publishes alert commands, `log` only logs them.
    pub alert_sink: String,
    pub project_tag: String,
    pub managed_by_tag: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| {
            // Prefer *_FILE for secrets (Docker/K8s friendly), fallback to env var.
            if let Ok(path) = env::var(format!("{}_FILE", key)) {
                if let Ok(contents) = fs::read_to_string(path.trim()) {
                    return Some(contents);
                }
            }
            env::var(key).ok()
        })
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        Self {
            provider: or("CLOUD_PROVIDER", "ec2").to_lowercase(),
            region: or("AWS_REGION", "us-east-1"),
            vpc_id: get("AWS_VPC_ID"),
            security_group_id: get("AWS_SECURITY_GROUP_ID"),
            subnet_id: get("AWS_SUBNET_ID"),
            key_pair_name: Some(or("AWS_KEY_PAIR_NAME", "castpool-obs")),
            ami_id: or("AWS_AMI_ID", "ami-0c7217cdde317cfec"),
            instance_type: or("AWS_INSTANCE_TYPE", "g4dn.xlarge"),
            service_port: get("VM_SERVICE_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            aws_access_key_id: get("AWS_ACCESS_KEY_ID"),
            aws_secret_access_key: get("AWS_SECRET_ACCESS_KEY"),
            aws_session_token: get("AWS_SESSION_TOKEN"),
            redis_url: or("REDIS_URL", "redis://127.0.0.1:6379"),
            store_prefix: or("STORE_PREFIX", "castpool"),
            http_bind: or("HTTP_BIND", "0.0.0.0:8090"),
            alert_sink: or("ALERT_SINK", "redis").to_lowercase(),
            project_tag: or("POOL_PROJECT_TAG", "castpool"),
            managed_by_tag: or("POOL_MANAGED_BY_TAG", "castpool-orchestrator"),
        }
    }

    /// Tag pair that marks an instance as owned by this pool.
    pub fn ownership_tags(&self) -> HashMap<String, String> {
        HashMap::from([
            (TAG_PROJECT.to_string(), self.project_tag.clone()),
            (TAG_MANAGED_BY.to_string(), self.managed_by_tag.clone()),
        ])
    }
}

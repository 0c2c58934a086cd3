use crate::inventory::{InstanceFilter, InstanceInfo, InstanceState, LaunchRequest, StateChange};
use crate::sigv4::{self, Credentials, FORM_CONTENT_TYPE};
use crate::{ApiError, CloudProvider};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const API_VERSION: &str = "2016-11-15";

pub struct Ec2Provider {
    client: Client,
    region: String,
    endpoint: String,
    host: String,
    credentials: Credentials,
}

impl Ec2Provider {
    pub fn new(
        region: &str,
        access_key_id: String,
        secret_access_key: String,
        session_token: Option<String>,
    ) -> Result<Self> {
        let host = format!("ec2.{}.amazonaws.com", region);
        Self::with_endpoint(
            region,
            &format!("https://{}/", host),
            Credentials {
                access_key_id: access_key_id.trim().to_string(),
                secret_access_key: secret_access_key.trim().to_string(),
                session_token: session_token
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty()),
            },
        )
    }

    /// Custom endpoint (LocalStack, VPC endpoints).
    pub fn with_endpoint(region: &str, endpoint: &str, credentials: Credentials) -> Result<Self> {
        // Default reqwest client has no overall timeout. If the API stalls, a job can hang forever.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .context("Failed to build EC2 HTTP client")?;
        let host = endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            client,
            region: region.to_string(),
            endpoint: endpoint.to_string(),
            host,
            credentials,
        })
    }

    async fn call<T: DeserializeOwned>(&self, action: &str, params: Vec<(String, String)>) -> Result<T> {
        let mut all = vec![
            ("Action".to_string(), action.to_string()),
            ("Version".to_string(), API_VERSION.to_string()),
        ];
        all.extend(params);
        let body = encode_form(&all);

        let signed = sigv4::sign_post(&self.credentials, &self.region, "ec2", &self.host, &body, Utc::now());
        let mut req = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, FORM_CONTENT_TYPE)
            .header("x-amz-date", &signed.amz_date)
            .header(reqwest::header::AUTHORIZATION, &signed.authorization);
        if let Some(token) = &signed.security_token {
            req = req.header("x-amz-security-token", token);
        }

        tracing::debug!(action, region = %self.region, "EC2 request");
        let resp = req.body(body).send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(parse_error(&text, status.as_u16()).into());
        }
        quick_xml::de::from_str::<T>(&text)
            .with_context(|| format!("Failed to parse {} response", action))
    }
}

fn encode_form(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn id_params(prefix: &str, ids: &[String]) -> Vec<(String, String)> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| (format!("{}.{}", prefix, i + 1), id.clone()))
        .collect()
}

fn filter_params(filter: &InstanceFilter) -> Vec<(String, String)> {
    let mut params = id_params("InstanceId", &filter.instance_ids);
    let mut n = 0;
    let mut push = |name: String, values: Vec<String>| {
        n += 1;
        params.push((format!("Filter.{}.Name", n), name));
        for (i, v) in values.into_iter().enumerate() {
            params.push((format!("Filter.{}.Value.{}", n, i + 1), v));
        }
    };
    let mut tags: Vec<_> = filter.tags.iter().collect();
    tags.sort();
    for (k, v) in tags {
        push(format!("tag:{}", k), vec![v.clone()]);
    }
    if !filter.states.is_empty() {
        push(
            "instance-state-name".to_string(),
            filter.states.iter().map(|s| s.as_str().to_string()).collect(),
        );
    }
    if let Some(vpc) = &filter.vpc_id {
        push("vpc-id".to_string(), vec![vpc.clone()]);
    }
    params
}

fn tag_params(prefix: &str, tags: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut sorted: Vec<_> = tags.iter().collect();
    sorted.sort();
    let mut params = Vec::new();
    for (i, (k, v)) in sorted.into_iter().enumerate() {
        params.push((format!("{}.{}.Key", prefix, i + 1), k.clone()));
        params.push((format!("{}.{}.Value", prefix, i + 1), v.clone()));
    }
    params
}

fn parse_error(body: &str, status: u16) -> ApiError {
    match quick_xml::de::from_str::<XmlErrorResponse>(body) {
        Ok(resp) => match resp.errors.error.into_iter().next() {
            Some(e) => ApiError::new(e.code, e.message).with_status(status),
            None => ApiError::new("Unknown", body.to_string()).with_status(status),
        },
        Err(_) => {
            let code = match status {
                429 => "Throttling",
                503 => "ServiceUnavailable",
                s if s >= 500 => "InternalError",
                _ => "Unknown",
            };
            ApiError::new(code, body.chars().take(200).collect::<String>()).with_status(status)
        }
    }
}

// --- XML response shapes ---

#[derive(Deserialize)]
struct ItemSet<T> {
    #[serde(rename = "item", default = "Vec::new")]
    items: Vec<T>,
}

fn items<T>(set: Option<ItemSet<T>>) -> Vec<T> {
    set.map(|s| s.items).unwrap_or_default()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct XmlState {
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct XmlPlacement {
    #[serde(default)]
    availability_zone: Option<String>,
}

#[derive(Deserialize)]
struct XmlTag {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct XmlInstance {
    instance_id: String,
    instance_state: XmlState,
    #[serde(default)]
    private_ip_address: Option<String>,
    #[serde(default)]
    ip_address: Option<String>,
    #[serde(default)]
    instance_type: String,
    #[serde(default)]
    launch_time: Option<String>,
    #[serde(default)]
    placement: Option<XmlPlacement>,
    #[serde(default)]
    tag_set: Option<ItemSet<XmlTag>>,
}

impl From<XmlInstance> for InstanceInfo {
    fn from(x: XmlInstance) -> Self {
        let tags: HashMap<String, String> = items(x.tag_set)
            .into_iter()
            .map(|t| (t.key, t.value))
            .collect();
        InstanceInfo {
            name: tags.get("Name").cloned(),
            instance_id: x.instance_id,
            state: InstanceState::from_name(&x.instance_state.name),
            public_ip: x.ip_address.filter(|s| !s.is_empty()),
            private_ip: x.private_ip_address.filter(|s| !s.is_empty()),
            instance_type: x.instance_type,
            availability_zone: x.placement.and_then(|p| p.availability_zone),
            launch_time: x
                .launch_time
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc)),
            tags,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct XmlReservation {
    #[serde(default)]
    instances_set: Option<ItemSet<XmlInstance>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeInstancesResponse {
    #[serde(default)]
    reservation_set: Option<ItemSet<XmlReservation>>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct XmlStateChange {
    instance_id: String,
    current_state: XmlState,
    previous_state: XmlState,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateChangeResponse {
    #[serde(default)]
    instances_set: Option<ItemSet<XmlStateChange>>,
}

impl StateChangeResponse {
    fn into_changes(self) -> Vec<StateChange> {
        items(self.instances_set)
            .into_iter()
            .map(|c| StateChange {
                instance_id: c.instance_id,
                previous: InstanceState::from_name(&c.previous_state.name),
                current: InstanceState::from_name(&c.current_state.name),
            })
            .collect()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunInstancesResponse {
    #[serde(default)]
    instances_set: Option<ItemSet<XmlInstance>>,
}

#[derive(Deserialize)]
struct ReturnResponse {
    #[serde(rename = "return", default)]
    ok: bool,
}

#[derive(Deserialize)]
struct XmlErrorResponse {
    #[serde(rename = "Errors")]
    errors: XmlErrors,
}

#[derive(Deserialize)]
struct XmlErrors {
    #[serde(rename = "Error", default)]
    error: Vec<XmlError>,
}

#[derive(Deserialize)]
struct XmlError {
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "Message", default)]
    message: String,
}

#[async_trait]
impl CloudProvider for Ec2Provider {
    fn name(&self) -> &'static str {
        "ec2"
    }

    async fn describe_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceInfo>> {
        let mut out = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut params = filter_params(filter);
            if let Some(token) = next_token.take() {
                params.push(("NextToken".to_string(), token));
            }
            let resp: DescribeInstancesResponse = self.call("DescribeInstances", params).await?;
            for reservation in items(resp.reservation_set) {
                out.extend(items(reservation.instances_set).into_iter().map(InstanceInfo::from));
            }
            match resp.next_token.filter(|t| !t.is_empty()) {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }
        Ok(out)
    }

    async fn start_instances(&self, instance_ids: &[String]) -> Result<Vec<StateChange>> {
        let resp: StateChangeResponse = self
            .call("StartInstances", id_params("InstanceId", instance_ids))
            .await?;
        Ok(resp.into_changes())
    }

    async fn stop_instances(&self, instance_ids: &[String], force: bool) -> Result<Vec<StateChange>> {
        let mut params = id_params("InstanceId", instance_ids);
        if force {
            params.push(("Force".to_string(), "true".to_string()));
        }
        let resp: StateChangeResponse = self.call("StopInstances", params).await?;
        Ok(resp.into_changes())
    }

    async fn reboot_instances(&self, instance_ids: &[String]) -> Result<()> {
        let resp: ReturnResponse = self
            .call("RebootInstances", id_params("InstanceId", instance_ids))
            .await?;
        if !resp.ok {
            return Err(ApiError::new("RebootRejected", "RebootInstances returned false").into());
        }
        Ok(())
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<Vec<StateChange>> {
        let resp: StateChangeResponse = self
            .call("TerminateInstances", id_params("InstanceId", instance_ids))
            .await?;
        Ok(resp.into_changes())
    }

    async fn run_instance(&self, request: &LaunchRequest) -> Result<InstanceInfo> {
        let mut params = vec![
            ("ImageId".to_string(), request.ami_id.clone()),
            ("InstanceType".to_string(), request.instance_type.clone()),
            ("MinCount".to_string(), "1".to_string()),
            ("MaxCount".to_string(), "1".to_string()),
        ];
        if let Some(key) = &request.key_name {
            params.push(("KeyName".to_string(), key.clone()));
        }
        if let Some(subnet) = &request.subnet_id {
            params.push(("SubnetId".to_string(), subnet.clone()));
        }
        params.extend(id_params("SecurityGroupId", &request.security_group_ids));

        let mut tags = request.tags.clone();
        tags.insert("Name".to_string(), request.name.clone());
        params.push((
            "TagSpecification.1.ResourceType".to_string(),
            "instance".to_string(),
        ));
        params.extend(tag_params("TagSpecification.1.Tag", &tags));

        let resp: RunInstancesResponse = self.call("RunInstances", params).await?;
        items(resp.instances_set)
            .into_iter()
            .next()
            .map(InstanceInfo::from)
            .ok_or_else(|| anyhow::anyhow!("RunInstances returned no instance"))
    }

    async fn create_tags(&self, instance_ids: &[String], tags: &HashMap<String, String>) -> Result<()> {
        let mut params = id_params("ResourceId", instance_ids);
        params.extend(tag_params("Tag", tags));
        let _: ReturnResponse = self.call("CreateTags", params).await?;
        Ok(())
    }
}

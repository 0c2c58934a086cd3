// HTTP control API: thin axum layer over the Pool Manager and Health Monitor.
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use castpool_common::PoolConfigPatch;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::health_monitor::HealthMonitor;
use crate::pool_manager::{PoolError, PoolManager};

pub struct AppState {
    pub pool: Arc<PoolManager>,
    pub monitor: Arc<HealthMonitor>,
}

impl AppState {
    pub fn new(pool: Arc<PoolManager>, monitor: Arc<HealthMonitor>) -> Arc<Self> {
        Arc::new(Self { pool, monitor })
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pool", get(pool_status))
        .route("/pool/config", axum::routing::put(update_config))
        .route("/pool/provision", post(provision_vm))
        .route("/pool/ensure-warm", post(ensure_warm))
        .route("/pool/vms/{vm_id}", get(get_vm).delete(terminate_vm))
        .route("/pool/vms/{vm_id}/start", post(start_vm))
        .route("/pool/vms/{vm_id}/stop", post(stop_vm))
        .route("/pool/vms/{vm_id}/reboot", post(reboot_vm))
        .route("/pool/vms/{vm_id}/in-use", post(mark_in_use))
        .route("/workloads/{workload_id}/vm", get(workload_vm))
        .route("/workloads/{workload_id}/assign", post(assign_vm))
        .route("/workloads/{workload_id}/release", post(release_vm))
        .route("/health-monitor", get(health_monitor_status))
        .route("/health-monitor/check", post(check_all))
        .route("/health-monitor/check/{vm_id}", post(check_one))
        .with_state(state)
}

// --- Error mapping ---

pub struct ApiError(PoolError);

impl From<PoolError> for ApiError {
    fn from(e: PoolError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            PoolError::VmNotFound(_) => StatusCode::NOT_FOUND,
            PoolError::VmNotAvailable { .. }
            | PoolError::InvalidTransition { .. }
            | PoolError::Conflict { .. } => StatusCode::CONFLICT,
            PoolError::NoVmAvailable(_)
            | PoolError::VmStarting { .. }
            | PoolError::MaxInstancesReached { .. } => StatusCode::SERVICE_UNAVAILABLE,
            PoolError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            PoolError::Store(_) | PoolError::Provider(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn code(&self) -> &'static str {
        match &self.0 {
            PoolError::VmNotFound(_) => "vm_not_found",
            PoolError::VmNotAvailable { .. } => "vm_not_available",
            PoolError::NoVmAvailable(_) => "no_vm_available",
            PoolError::VmStarting { .. } => "vm_starting",
            PoolError::InvalidTransition { .. } => "invalid_transition",
            PoolError::MaxInstancesReached { .. } => "max_instances_reached",
            PoolError::Conflict { .. } => "conflict",
            PoolError::InvalidConfig(_) => "invalid_config",
            PoolError::Store(_) => "store_error",
            PoolError::Provider(_) => "provider_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(error = %self.0, "request failed");
        }
        let mut body = json!({
            "error": self.code(),
            "message": self.0.to_string(),
        });
        if let Some(secs) = self.0.retry_after_secs() {
            body["retryAfterSeconds"] = json!(secs);
        }
        if let PoolError::VmStarting { vm_id, .. } = &self.0 {
            body["vmId"] = json!(vm_id);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn body<T: serde::Serialize>(value: T) -> ApiResult {
    Ok(Json(json!(value)))
}

// --- Handlers ---

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let status = state.pool.get_pool_status().await;
    Json(json!({
        "status": "ok",
        "healthMonitorRunning": state.monitor.is_running(),
        "counts": status.counts,
    }))
}

async fn pool_status(State(state): State<Arc<AppState>>) -> ApiResult {
    body(state.pool.get_pool_status().await)
}

async fn get_vm(State(state): State<Arc<AppState>>, Path(vm_id): Path<String>) -> ApiResult {
    let vm = state
        .pool
        .get_vm(&vm_id)
        .await
        .ok_or(PoolError::VmNotFound(vm_id))?;
    body(vm)
}

async fn workload_vm(State(state): State<Arc<AppState>>, Path(workload_id): Path<String>) -> ApiResult {
    let vm = state.pool.get_vm_for_workload(&workload_id).await;
    let port = state.pool.get_config().await.service_port;
    let address = vm.as_ref().and_then(|vm| vm.address(port));
    Ok(Json(json!({
        "workloadId": workload_id,
        "vm": vm,
        "address": address,
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignRequest {
    preferred_vm_id: Option<String>,
}

async fn assign_vm(
    State(state): State<Arc<AppState>>,
    Path(workload_id): Path<String>,
    payload: Option<Json<AssignRequest>>,
) -> ApiResult {
    let req = payload.map(|Json(req)| req).unwrap_or_default();
    body(
        state
            .pool
            .assign_vm(&workload_id, req.preferred_vm_id.as_deref())
            .await?,
    )
}

async fn release_vm(State(state): State<Arc<AppState>>, Path(workload_id): Path<String>) -> ApiResult {
    let released = state.pool.release_vm(&workload_id).await?;
    Ok(Json(json!({
        "workloadId": workload_id,
        "released": released.is_some(),
        "vm": released,
    })))
}

async fn start_vm(State(state): State<Arc<AppState>>, Path(vm_id): Path<String>) -> ApiResult {
    body(state.pool.start_vm(&vm_id).await?)
}

async fn stop_vm(State(state): State<Arc<AppState>>, Path(vm_id): Path<String>) -> ApiResult {
    body(state.pool.stop_vm(&vm_id).await?)
}

async fn reboot_vm(State(state): State<Arc<AppState>>, Path(vm_id): Path<String>) -> ApiResult {
    body(state.pool.reboot_vm(&vm_id).await?)
}

async fn mark_in_use(State(state): State<Arc<AppState>>, Path(vm_id): Path<String>) -> ApiResult {
    body(state.pool.mark_vm_in_use(&vm_id).await?)
}

async fn terminate_vm(State(state): State<Arc<AppState>>, Path(vm_id): Path<String>) -> ApiResult {
    state.pool.terminate_vm(&vm_id).await?;
    Ok(Json(json!({ "vmId": vm_id, "terminated": true })))
}

#[derive(Debug, Default, Deserialize)]
struct ProvisionRequest {
    name: Option<String>,
}

async fn provision_vm(State(state): State<Arc<AppState>>, payload: Option<Json<ProvisionRequest>>) -> Result<Response, ApiError> {
    let req = payload.map(|Json(req)| req).unwrap_or_default();
    let vm = state.pool.provision_vm(req.name).await?;
    Ok((StatusCode::ACCEPTED, Json(json!(vm))).into_response())
}

async fn ensure_warm(State(state): State<Arc<AppState>>) -> ApiResult {
    let outcomes = state.pool.ensure_min_warm_vms().await?;
    Ok(Json(json!({
        "started": outcomes.iter().filter(|o| o.started).count(),
        "outcomes": outcomes,
    })))
}

async fn update_config(State(state): State<Arc<AppState>>, Json(patch): Json<PoolConfigPatch>) -> ApiResult {
    body(state.pool.update_config(&patch).await?)
}

async fn health_monitor_status(State(state): State<Arc<AppState>>) -> ApiResult {
    body(state.monitor.get_health_status().await)
}

async fn check_all(State(state): State<Arc<AppState>>) -> ApiResult {
    let results = state.monitor.force_health_check_all().await;
    Ok(Json(json!({
        "checked": results.len(),
        "results": results,
    })))
}

async fn check_one(State(state): State<Arc<AppState>>, Path(vm_id): Path<String>) -> ApiResult {
    body(state.monitor.force_health_check(&vm_id).await?)
}

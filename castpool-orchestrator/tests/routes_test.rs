// Integration tests for the HTTP control API.

mod common;

use axum_test::TestServer;
use castpool_orchestrator::routes::{create_router, AppState};
use common::{harness, Harness};
use serde_json::{json, Value};

fn server(h: &Harness) -> TestServer {
    let app = create_router(AppState::new(h.pool.clone(), h.monitor()));
    TestServer::new(app).unwrap()
}

#[tokio::test]
async fn health_and_pool_status() {
    let h = harness(1, 1).await;
    let server = server(&h);

    let response = server.get("/health").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["counts"]["total"], 2);

    let response = server.get("/pool").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["config"]["warmCount"], 2);
    assert_eq!(body["vms"].as_array().unwrap().len(), 2);

    let response = server.get("/pool/vms/vm-run0").await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Value>()["status"], "AVAILABLE");

    let response = server.get("/pool/vms/vm-nope").await;
    assert_eq!(response.status_code(), 404);
    assert_eq!(response.json::<Value>()["error"], "vm_not_found");
}

#[tokio::test]
async fn assign_and_release_over_http() {
    let h = harness(1, 0).await;
    let server = server(&h);

    let response = server.post("/workloads/comp-1/assign").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["vm"]["vmId"], "vm-run0");
    assert_eq!(body["vm"]["status"], "ASSIGNED");
    assert!(body["address"].as_str().unwrap().ends_with(":8080"));

    let response = server.get("/workloads/comp-1/vm").await;
    assert_eq!(response.json::<Value>()["vm"]["assignedTo"], "comp-1");

    let response = server
        .post("/workloads/comp-2/assign")
        .json(&json!({}))
        .await;
    assert_eq!(response.status_code(), 503);
    let body: Value = response.json();
    assert_eq!(body["error"], "no_vm_available");
    assert!(body["retryAfterSeconds"].as_u64().is_some());

    let response = server.post("/pool/vms/vm-run0/stop").await;
    assert_eq!(response.status_code(), 409);
    assert_eq!(response.json::<Value>()["error"], "invalid_transition");

    let response = server.post("/pool/vms/vm-run0/in-use").await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Value>()["status"], "IN_USE");

    let response = server.post("/workloads/comp-1/release").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["released"], true);
    assert_eq!(body["vm"]["status"], "AVAILABLE");

    let response = server.get("/workloads/comp-1/vm").await;
    assert!(response.json::<Value>()["vm"].is_null());
}

#[tokio::test]
async fn preferred_vm_in_body() {
    let h = harness(2, 0).await;
    let server = server(&h);
    let response = server
        .post("/workloads/comp-1/assign")
        .json(&json!({ "preferredVmId": "vm-run1" }))
        .await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Value>()["vm"]["vmId"], "vm-run1");
}

#[tokio::test(start_paused = true)]
async fn cold_start_hint_is_503_with_retry_after() {
    let h = harness(0, 1).await;
    let server = server(&h);
    let response = server.post("/workloads/comp-1/assign").await;
    assert_eq!(response.status_code(), 503);
    let body: Value = response.json();
    assert_eq!(body["error"], "vm_starting");
    assert_eq!(body["retryAfterSeconds"], 30);
    assert_eq!(body["vmId"], "vm-cold0");
    h.pool.tasks().wait_idle().await;
}

#[tokio::test]
async fn config_updates_are_validated() {
    let h = harness(0, 0).await;
    let server = server(&h);

    let response = server.put("/pool/config").json(&json!({ "warmCount": 1 })).await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Value>()["warmCount"], 1);

    let response = server.put("/pool/config").json(&json!({ "warmCount": 100 })).await;
    assert_eq!(response.status_code(), 400);
    assert_eq!(response.json::<Value>()["error"], "invalid_config");

    let response = server.put("/pool/config").json(&json!({ "bogus": true })).await;
    assert!(response.status_code().is_client_error());
    assert_eq!(h.pool.get_config().await.warm_count, 1);
}

#[tokio::test]
async fn health_monitor_endpoints() {
    let h = harness(1, 0).await;
    let server = server(&h);

    let response = server.post("/health-monitor/check").await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Value>()["checked"], 1);

    let response = server.post("/health-monitor/check/vm-run0").await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Value>()["healthy"], true);

    let response = server.get("/health-monitor").await;
    let body: Value = response.json();
    assert_eq!(body["running"], false);
    assert_eq!(body["unhealthyThreshold"], 3);
    assert_eq!(body["vms"]["vm-run0"]["consecutiveSuccesses"], 2);
}

#[tokio::test(start_paused = true)]
async fn lifecycle_endpoints() {
    let h = harness(1, 1).await;
    let server = server(&h);

    let response = server.delete("/pool/vms/vm-run0").await;
    assert_eq!(response.status_code(), 409);

    let response = server.delete("/pool/vms/vm-cold0").await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Value>()["terminated"], true);

    let response = server.post("/pool/provision").json(&json!({ "name": "obs-new" })).await;
    assert_eq!(response.status_code(), 202);
    assert_eq!(response.json::<Value>()["status"], "STARTING");

    let response = server.post("/pool/ensure-warm").await;
    assert_eq!(response.status_code(), 200);

    h.pool.tasks().wait_idle().await;
    assert_eq!(h.pool.get_pool_status().await.counts.available, 2);
}

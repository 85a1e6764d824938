//! HTTP API integration tests.
//!
//! Serves the router on a real socket and talks to it with reqwest. The
//! scheduler loops are not started, so tracked instances stay exactly as the
//! requests leave them.

use std::collections::BTreeMap;
use std::sync::Arc;

use dynsched_director::api;
use dynsched_director::config::Config;
use dynsched_director::instrumentation::RecordingPublisher;
use dynsched_director::models::{NewInstance, PathMappings, RestartPolicy, SchedulerData, ServiceResources};
use dynsched_director::node_rights::{InMemoryLockBackend, NodeRightsManager};
use dynsched_director::projects::InMemoryProjects;
use dynsched_director::scheduler::{Scheduler, SchedulerContext};
use dynsched_director::sidecar::MockSidecar;
use dynsched_director::state::AppState;
use dynsched_id::{InstanceId, ProjectId, UserId};
use dynsched_swarm::InMemorySwarm;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;

struct ApiTestHarness {
    base_url: String,
    client: reqwest::Client,
    scheduler: Scheduler,
    sidecar: MockSidecar,
    config: Config,
    shutdown_tx: watch::Sender<bool>,
}

impl ApiTestHarness {
    async fn new() -> Self {
        let config = Config::for_stack("api-test");
        let sidecar = MockSidecar::new();
        let node_rights = NodeRightsManager::new(Arc::new(InMemoryLockBackend::new()), &config.node_rights);
        let scheduler = Scheduler::new(SchedulerContext {
            config: config.clone(),
            swarm: Arc::new(InMemorySwarm::default()),
            sidecar: Arc::new(sidecar.clone()),
            node_rights: Arc::new(node_rights),
            projects: Arc::new(InMemoryProjects::permissive()),
            events: Arc::new(RecordingPublisher::new()),
        });

        let app = api::create_router(AppState::new(scheduler.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
                .unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            scheduler,
            sidecar,
            config,
            shutdown_tx,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn track(&self, user_id: u64) -> SchedulerData {
        let request = NewInstance {
            instance_id: InstanceId::new(),
            user_id: UserId::new(user_id),
            project_id: ProjectId::new(),
            product_name: "osparc".to_string(),
            key: "simcore/services/dynamic/sleeper".to_string(),
            version: "1.0.0".to_string(),
            paths_mapping: PathMappings {
                inputs_path: "/inputs".into(),
                outputs_path: "/outputs".into(),
                state_paths: vec![],
                state_exclude: vec![],
            },
            compose_spec: None,
            container_http_entry: None,
            restart_policy: RestartPolicy::OnInputsDownloaded,
            service_resources: ServiceResources::default(),
            service_port: 8080,
            request_dns: "osparc.local".to_string(),
            request_scheme: "http".to_string(),
            request_user_agent: "api-test".to_string(),
            wallet_info: None,
            pricing_info: None,
            hardware_info: None,
            service_labels: BTreeMap::new(),
        };
        let data = SchedulerData::new(request, &self.config);
        self.scheduler.add(data.clone()).await.unwrap();
        data
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client.post(self.url(path)).json(&body).send().await.unwrap()
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(self.url(path)).send().await.unwrap()
    }
}

impl Drop for ApiTestHarness {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn assert_problem(response: reqwest::Response, status: StatusCode, code: &str) {
    assert_eq!(response.status(), status);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/problem+json"
    );
    let problem: Value = response.json().await.unwrap();
    assert_eq!(problem["code"], code);
    assert_eq!(problem["status"], status.as_u16());
}

#[tokio::test]
async fn test_health_endpoints() {
    let harness = ApiTestHarness::new().await;

    for path in ["/healthz", "/livez"] {
        let response = harness.get(path).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "director");
    }
}

#[tokio::test]
async fn test_list_services_filters_by_user() {
    let harness = ApiTestHarness::new().await;
    let mine = harness.track(1).await;
    harness.track(2).await;

    let body: Value = harness.get("/v1/services").await.json().await.unwrap();
    assert_eq!(body["items"].as_array().unwrap().len(), 2);

    let body: Value = harness.get("/v1/services?user_id=1").await.json().await.unwrap();
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["instance_id"], mine.instance_id.to_string());
    assert_eq!(items[0]["service_name"], mine.service_name.to_string());
    assert_eq!(items[0]["marked_for_removal"], false);

    let path = format!("/v1/services?project_id={}", mine.project_id);
    let body: Value = harness.get(&path).await.json().await.unwrap();
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_and_malformed_ids() {
    let harness = ApiTestHarness::new().await;

    let response = harness.get(&format!("/v1/services/{}", InstanceId::new())).await;
    assert_problem(response, StatusCode::NOT_FOUND, "service_not_found").await;

    let response = harness.get("/v1/services/not-an-id").await;
    assert_problem(response, StatusCode::BAD_REQUEST, "invalid_instance_id").await;

    let path = format!("/v1/services/{}/removal", InstanceId::new());
    let response = harness.post(&path, json!({ "can_save": true })).await;
    assert_problem(response, StatusCode::NOT_FOUND, "service_not_found").await;
}

#[tokio::test]
async fn test_get_service_and_stack_state() {
    let harness = ApiTestHarness::new().await;
    let data = harness.track(1).await;

    let response = harness.get(&format!("/v1/services/{}", data.instance_id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["service_name"], data.service_name.to_string());
    assert_eq!(body["dynamic_sidecar"]["was_dynamic_sidecar_started"], false);

    let body: Value = harness
        .get(&format!("/v1/services/{}/state", data.instance_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["state"], "PENDING");
}

#[tokio::test]
async fn test_mark_for_removal_is_accepted() {
    let harness = ApiTestHarness::new().await;
    let data = harness.track(1).await;

    let path = format!("/v1/services/{}/removal", data.instance_id);
    let response = harness
        .post(&path, json!({ "can_save": false, "skip_observation_recreation": true }))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let tracked = harness.scheduler.get(data.instance_id).await.unwrap();
    let removal = tracked.dynamic_sidecar.service_removal_state;
    assert!(removal.can_remove);
    assert!(!removal.can_save);
    assert!(tracked.dynamic_sidecar.instrumentation.close_requested_at.is_some());
}

#[tokio::test]
async fn test_toggle_observation_and_reset_status() {
    let harness = ApiTestHarness::new().await;
    let data = harness.track(1).await;

    let path = format!("/v1/services/{}/observation", data.instance_id);
    let response = harness.post(&path, json!({ "is_disabled": true })).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = harness.post(&path, json!({ "is_disabled": false })).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let path = format!("/v1/services/{}/status/reset", data.instance_id);
    let response = harness.client.post(harness.url(&path)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!harness
        .scheduler
        .is_service_awaiting_manual_intervention(data.instance_id)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_retrieve_inputs_restarts_when_asked() {
    let harness = ApiTestHarness::new().await;
    let data = harness.track(1).await;

    let path = format!("/v1/services/{}/inputs:retrieve", data.instance_id);
    let response = harness.post(&path, json!({ "port_keys": ["input_1"] })).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["transferred_bytes"], 0);

    assert_eq!(harness.sidecar.calls("pull_service_input_ports"), 1);
    assert_eq!(harness.sidecar.calls("restart_containers"), 1);
}

#[tokio::test]
async fn test_save_state_and_push_outputs() {
    let harness = ApiTestHarness::new().await;
    let data = harness.track(1).await;

    let path = format!("/v1/services/{}/state:save", data.instance_id);
    let response = harness.client.post(harness.url(&path)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    harness.sidecar.fail_push_outputs(true);
    let path = format!("/v1/services/{}/outputs:push", data.instance_id);
    let response = harness.client.post(harness.url(&path)).send().await.unwrap();
    assert_problem(response, StatusCode::BAD_GATEWAY, "sidecar_unavailable").await;
}

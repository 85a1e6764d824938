//! Tracked service endpoints.
//!
//! Instances are addressed by their platform instance id:
//! /v1/services/{instance_id}

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use dynsched_id::{InstanceId, ProjectId, UserId};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::docker_api::StackStatus;
use crate::models::{DynamicSidecarStatus, SchedulerData};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_services))
        .route("/{instance_id}", get(get_service))
        .route("/{instance_id}/state", get(get_service_state))
        .route("/{instance_id}/removal", post(mark_for_removal))
        .route("/{instance_id}/observation", post(toggle_observation))
        .route("/{instance_id}/status/reset", post(reset_status))
        .route("/{instance_id}/inputs:retrieve", post(retrieve_inputs))
        .route("/{instance_id}/containers", delete(remove_containers))
        .route("/{instance_id}/containers:restart", post(restart_containers))
        .route("/{instance_id}/state:save", post(save_state))
        .route("/{instance_id}/outputs:push", post(push_outputs))
        .route("/{instance_id}/networks", post(attach_network))
        .route("/{instance_id}/networks/{network_name}", delete(detach_network))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub user_id: Option<UserId>,
    pub project_id: Option<ProjectId>,
}

#[derive(Debug, Serialize)]
pub struct ServiceSummary {
    pub instance_id: InstanceId,
    pub service_name: String,
    pub user_id: UserId,
    pub project_id: ProjectId,
    pub key: String,
    pub version: String,
    pub status: DynamicSidecarStatus,
    pub status_info: String,
    pub is_ready: bool,
    pub marked_for_removal: bool,
    pub awaiting_manual_intervention: bool,
}

impl From<&SchedulerData> for ServiceSummary {
    fn from(data: &SchedulerData) -> Self {
        let ds = &data.dynamic_sidecar;
        Self {
            instance_id: data.instance_id,
            service_name: data.service_name.to_string(),
            user_id: data.user_id,
            project_id: data.project_id,
            key: data.key.clone(),
            version: data.version.clone(),
            status: ds.status.current,
            status_info: ds.status.info.clone(),
            is_ready: ds.is_ready,
            marked_for_removal: ds.is_marked_for_removal(),
            awaiting_manual_intervention: ds.is_awaiting_manual_intervention(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListServicesResponse {
    pub items: Vec<ServiceSummary>,
}

#[derive(Debug, Deserialize)]
pub struct RemovalRequest {
    pub can_save: bool,
    #[serde(default)]
    pub skip_observation_recreation: bool,
}

#[derive(Debug, Deserialize)]
pub struct ObservationRequest {
    pub is_disabled: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct RetrieveInputsRequest {
    #[serde(default)]
    pub port_keys: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct RetrieveInputsResponse {
    pub transferred_bytes: u64,
}

#[derive(Debug, Deserialize)]
pub struct AttachNetworkRequest {
    pub network_name: String,
    pub alias: String,
}

fn parse_instance_id(raw: &str) -> Result<InstanceId, ApiError> {
    InstanceId::parse(raw)
        .map_err(|e| ApiError::bad_request("invalid_instance_id", format!("invalid instance id: {e}")))
}

// =============================================================================
// Handlers
// =============================================================================

async fn list_services(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<ListServicesResponse> {
    let items = state
        .scheduler()
        .list(query.user_id, query.project_id)
        .await
        .iter()
        .map(ServiceSummary::from)
        .collect();
    Json(ListServicesResponse { items })
}

async fn get_service(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<Json<SchedulerData>, ApiError> {
    let instance_id = parse_instance_id(&instance_id)?;
    Ok(Json(state.scheduler().get(instance_id).await?))
}

async fn get_service_state(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<Json<StackStatus>, ApiError> {
    let instance_id = parse_instance_id(&instance_id)?;
    Ok(Json(state.scheduler().get_stack_status(instance_id).await?))
}

async fn mark_for_removal(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(req): Json<RemovalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&instance_id)?;
    state
        .scheduler()
        .mark_for_removal(instance_id, req.can_save, req.skip_observation_recreation)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn toggle_observation(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(req): Json<ObservationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&instance_id)?;
    if !state
        .scheduler()
        .toggle_observation(instance_id, req.is_disabled)
        .await?
    {
        return Err(ApiError::conflict(
            "reconciliation_in_flight",
            "a reconciliation is running, retry shortly",
        ));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn reset_status(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&instance_id)?;
    state.scheduler().reset_status(instance_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn retrieve_inputs(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(req): Json<RetrieveInputsRequest>,
) -> Result<Json<RetrieveInputsResponse>, ApiError> {
    let instance_id = parse_instance_id(&instance_id)?;
    let transferred_bytes = state
        .scheduler()
        .retrieve_service_inputs(instance_id, req.port_keys)
        .await?;
    Ok(Json(RetrieveInputsResponse { transferred_bytes }))
}

async fn restart_containers(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&instance_id)?;
    state.scheduler().restart_containers(instance_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_containers(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&instance_id)?;
    state.scheduler().remove_service_containers(instance_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn save_state(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&instance_id)?;
    state.scheduler().save_service_state(instance_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn push_outputs(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&instance_id)?;
    state.scheduler().push_service_outputs(instance_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn attach_network(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(req): Json<AttachNetworkRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&instance_id)?;
    state
        .scheduler()
        .attach_project_network(instance_id, &req.network_name, &req.alias)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn detach_network(
    State(state): State<AppState>,
    Path((instance_id, network_name)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&instance_id)?;
    state
        .scheduler()
        .detach_project_network(instance_id, &network_name)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

//! The per-instance lifecycle record.
//!
//! `SchedulerData` is mutated by exactly one reconciliation at a time and is
//! serialized, as a whole, into the sidecar service's recovery label. Fields
//! marked `#[serde(skip)]` are process-local and reset on recovery.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dynsched_id::{InstanceId, ProjectId, RunId, UserId};
use dynsched_reconcile::DelayedErrorHandler;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::names::{proxy_service_name, sidecar_network_name, sidecar_service_name, ServiceName};
use crate::config::Config;

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DynamicSidecarStatus {
    #[default]
    Ok,
    Failing,
}

/// Per-instance circuit breaker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub current: DynamicSidecarStatus,
    pub info: String,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        self.current == DynamicSidecarStatus::Ok
    }

    pub fn update_ok_status(&mut self, info: impl Into<String>) {
        self.current = DynamicSidecarStatus::Ok;
        self.info = info.into();
    }

    /// `info` becomes `"<message> [<error code>]"` when a code is given.
    pub fn update_failing_status(&mut self, message: &str, error_code: Option<&str>) {
        self.current = DynamicSidecarStatus::Failing;
        self.info = match error_code {
            Some(code) => format!("{message} [{code}]"),
            None => message.to_string(),
        };
    }
}

// =============================================================================
// Removal
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRemovalState {
    /// Teardown requested.
    pub can_remove: bool,
    /// Teardown should save state and push outputs first.
    pub can_save: bool,
    /// Teardown completed. Never reset once set.
    pub was_removed: bool,
}

impl ServiceRemovalState {
    pub fn mark_to_remove(&mut self, can_save: bool) {
        self.can_remove = true;
        self.can_save = can_save;
    }

    pub fn mark_removed(&mut self) {
        self.can_remove = false;
        self.was_removed = true;
    }

    /// Combine two views of the same instance without losing a removal
    /// request or un-removing it.
    pub fn merged_with(&self, other: &Self) -> Self {
        let was_removed = self.was_removed || other.was_removed;
        let can_save = if other.can_remove {
            other.can_save
        } else {
            self.can_save
        };
        Self {
            can_remove: (self.can_remove || other.can_remove) && !was_removed,
            can_save,
            was_removed,
        }
    }
}

// =============================================================================
// Containers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInspect {
    pub id: String,
    pub name: String,
    pub status: ContainerState,
}

impl ContainerInspect {
    /// Created and running are the only states the pipeline expects.
    pub fn is_expected(&self) -> bool {
        matches!(self.status, ContainerState::Created | ContainerState::Running)
    }
}

// =============================================================================
// Sidecar progress
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrumentation {
    pub start_requested_at: Option<DateTime<Utc>>,
    pub close_requested_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DynamicSidecar {
    #[serde(default)]
    pub status: Status,

    /// The sidecar answered its health check on the last attempt.
    #[serde(default)]
    pub is_ready: bool,

    #[serde(default)]
    pub was_compose_spec_submitted: bool,

    #[serde(default)]
    pub containers_inspect: Vec<ContainerInspect>,

    #[serde(default)]
    pub was_dynamic_sidecar_started: bool,

    #[serde(default)]
    pub were_containers_created: bool,

    #[serde(default)]
    pub is_project_network_attached: bool,

    #[serde(default)]
    pub is_service_environment_ready: bool,

    #[serde(default)]
    pub service_removal_state: ServiceRemovalState,

    #[serde(default)]
    pub wait_for_manual_intervention_after_error: bool,

    #[serde(default)]
    pub wait_for_manual_intervention_logged: bool,

    #[serde(default)]
    pub were_state_and_outputs_saved: bool,

    #[serde(default)]
    pub instrumentation: Instrumentation,

    pub dynamic_sidecar_id: Option<String>,
    pub dynamic_sidecar_network_id: Option<String>,
    pub swarm_network_id: Option<String>,
    pub swarm_network_name: Option<String>,
    /// Swarm node running the sidecar; volumes live there.
    pub docker_node_id: Option<String>,

    #[serde(skip)]
    pub inspect_error_handler: DelayedErrorHandler,

    /// Last time the stack-disappeared check ran while latched.
    #[serde(skip)]
    pub manual_intervention_checked_at: Option<Instant>,
}

impl DynamicSidecar {
    pub fn compose_spec_submitted(&self) -> bool {
        self.was_compose_spec_submitted || !self.containers_inspect.is_empty()
    }

    pub fn are_containers_running(&self) -> bool {
        !self.containers_inspect.is_empty()
            && self
                .containers_inspect
                .iter()
                .all(|c| c.status == ContainerState::Running)
    }

    pub fn is_marked_for_removal(&self) -> bool {
        self.service_removal_state.can_remove || self.service_removal_state.was_removed
    }

    /// Forward pipeline rules may only run while this holds.
    pub fn can_advance(&self) -> bool {
        self.status.is_ok() && !self.is_marked_for_removal()
    }

    pub fn is_awaiting_manual_intervention(&self) -> bool {
        !self.status.is_ok() && self.wait_for_manual_intervention_after_error
    }
}

// =============================================================================
// Instance request
// =============================================================================

/// In-container paths the user service reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMappings {
    pub inputs_path: PathBuf,
    pub outputs_path: PathBuf,
    #[serde(default)]
    pub state_paths: Vec<PathBuf>,
    #[serde(default)]
    pub state_exclude: Vec<String>,
}

impl PathMappings {
    /// Every path that gets its own volume, in a stable order.
    pub fn volume_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.inputs_path.clone(), self.outputs_path.clone()];
        paths.extend(self.state_paths.iter().cloned());
        paths
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    NoRestart,
    OnInputsDownloaded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceResources {
    pub nano_cpus: Option<i64>,
    pub memory_bytes: Option<i64>,
}

/// What the outer platform hands over when it asks for a new instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInstance {
    pub instance_id: InstanceId,
    pub user_id: UserId,
    pub project_id: ProjectId,
    pub product_name: String,
    pub key: String,
    pub version: String,
    #[serde(default)]
    pub paths_mapping: PathMappings,
    #[serde(default)]
    pub compose_spec: Option<serde_json::Value>,
    #[serde(default)]
    pub container_http_entry: Option<String>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub service_resources: ServiceResources,
    /// Port the entrypoint container listens on.
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    #[serde(default)]
    pub request_dns: String,
    #[serde(default)]
    pub request_scheme: String,
    #[serde(default)]
    pub request_user_agent: String,
    #[serde(default)]
    pub wallet_info: Option<serde_json::Value>,
    #[serde(default)]
    pub pricing_info: Option<serde_json::Value>,
    #[serde(default)]
    pub hardware_info: Option<serde_json::Value>,
    /// Labels of the service image as published in the catalog.
    #[serde(default)]
    pub service_labels: BTreeMap<String, String>,
}

fn default_service_port() -> u16 {
    8080
}

// =============================================================================
// SchedulerData
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerData {
    pub instance_id: InstanceId,
    pub service_name: ServiceName,
    pub run_id: RunId,
    pub user_id: UserId,
    pub project_id: ProjectId,
    pub product_name: String,
    pub key: String,
    pub version: String,

    /// The sidecar is reachable under its service name.
    pub hostname: String,
    pub port: u16,
    pub proxy_service_name: String,
    pub proxy_admin_api_port: u16,
    pub dynamic_sidecar_network_name: String,

    pub paths_mapping: PathMappings,
    pub compose_spec: Option<serde_json::Value>,
    pub container_http_entry: Option<String>,
    pub restart_policy: RestartPolicy,
    pub service_resources: ServiceResources,
    pub service_port: u16,

    pub request_dns: String,
    pub request_scheme: String,
    pub request_user_agent: String,

    pub wallet_info: Option<serde_json::Value>,
    pub pricing_info: Option<serde_json::Value>,
    pub hardware_info: Option<serde_json::Value>,

    #[serde(default)]
    pub service_labels: BTreeMap<String, String>,

    pub dynamic_sidecar: DynamicSidecar,
}

impl SchedulerData {
    pub fn new(request: NewInstance, config: &Config) -> Self {
        let service_name = sidecar_service_name(request.instance_id);
        Self {
            instance_id: request.instance_id,
            hostname: service_name.to_string(),
            service_name,
            run_id: RunId::new(),
            user_id: request.user_id,
            project_id: request.project_id,
            product_name: request.product_name,
            key: request.key,
            version: request.version,
            port: config.sidecar_port,
            proxy_service_name: proxy_service_name(request.instance_id),
            proxy_admin_api_port: config.proxy_admin_port,
            dynamic_sidecar_network_name: sidecar_network_name(request.instance_id),
            paths_mapping: request.paths_mapping,
            compose_spec: request.compose_spec,
            container_http_entry: request.container_http_entry,
            restart_policy: request.restart_policy,
            service_resources: request.service_resources,
            service_port: request.service_port,
            request_dns: request.request_dns,
            request_scheme: request.request_scheme,
            request_user_agent: request.request_user_agent,
            wallet_info: request.wallet_info,
            pricing_info: request.pricing_info,
            hardware_info: request.hardware_info,
            service_labels: request.service_labels,
            dynamic_sidecar: DynamicSidecar {
                instrumentation: Instrumentation {
                    start_requested_at: Some(Utc::now()),
                    close_requested_at: None,
                },
                ..Default::default()
            },
        }
    }

    /// Base URL of the sidecar's HTTP API.
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.hostname, self.port)
    }

    pub fn as_label_data(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_label_data(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

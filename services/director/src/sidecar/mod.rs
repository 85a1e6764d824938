//! The sidecar's own HTTP API.
//!
//! Each instance runs a sidecar that drives the user's containers locally.
//! The scheduler only talks to it through [`SidecarApi`]; every call takes the
//! sidecar's base URL (see `SchedulerData::endpoint`).

mod client;
mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use client::SidecarClient;
pub use mock::MockSidecar;

use crate::models::ContainerInspect;

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("sidecar request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sidecar responded {status} to {url}: {body}")]
    Api { url: String, status: u16, body: String },

    #[error("unexpected sidecar payload from {url}: {message}")]
    Payload { url: String, message: String },
}

pub type SidecarResult<T> = Result<T, SidecarError>;

impl SidecarError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            Self::Payload { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeCategory {
    Inputs,
    Outputs,
    States,
    SharedStore,
}

impl VolumeCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inputs => "INPUTS",
            Self::Outputs => "OUTPUTS",
            Self::States => "STATES",
            Self::SharedStore => "SHARED_STORE",
        }
    }
}

impl std::fmt::Display for VolumeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeStatus {
    ContentNeedsToBeSaved,
    ContentWasSaved,
    ContentNoSaveRequired,
}

#[async_trait]
pub trait SidecarApi: Send + Sync {
    async fn is_healthy(&self, endpoint: &str) -> SidecarResult<bool>;

    /// Inspect of every container the sidecar manages.
    async fn containers_inspect(&self, endpoint: &str) -> SidecarResult<Vec<ContainerInspect>>;

    /// Submit a compose spec and start its containers.
    async fn create_containers(&self, endpoint: &str, compose_spec: &str) -> SidecarResult<()>;

    /// Stop and remove the user containers.
    async fn stop_service(&self, endpoint: &str) -> SidecarResult<()>;

    async fn restart_containers(&self, endpoint: &str) -> SidecarResult<()>;

    async fn pull_user_services_images(&self, endpoint: &str) -> SidecarResult<()>;

    /// Container attached to `network_name` that serves HTTP, once known.
    async fn entrypoint_container_name(
        &self,
        endpoint: &str,
        network_name: &str,
    ) -> SidecarResult<Option<String>>;

    async fn set_outputs_watcher(&self, endpoint: &str, enabled: bool) -> SidecarResult<()>;

    async fn create_output_dirs(&self, endpoint: &str, port_keys: &[String]) -> SidecarResult<()>;

    /// Returns the number of bytes transferred.
    async fn pull_service_input_ports(
        &self,
        endpoint: &str,
        port_keys: Option<&[String]>,
    ) -> SidecarResult<u64>;

    /// Returns the number of bytes transferred.
    async fn pull_service_output_ports(&self, endpoint: &str) -> SidecarResult<u64>;

    async fn push_service_output_ports(&self, endpoint: &str) -> SidecarResult<()>;

    /// Returns the number of bytes transferred.
    async fn restore_service_state(&self, endpoint: &str) -> SidecarResult<u64>;

    /// Returns the number of bytes transferred.
    async fn save_service_state(&self, endpoint: &str) -> SidecarResult<u64>;

    async fn update_volume_state(
        &self,
        endpoint: &str,
        category: VolumeCategory,
        status: VolumeStatus,
    ) -> SidecarResult<()>;

    /// Release the disk space the sidecar keeps in reserve for saving.
    async fn free_reserved_disk_space(&self, endpoint: &str) -> SidecarResult<()>;

    async fn attach_container_to_network(
        &self,
        endpoint: &str,
        container_id: &str,
        network_id: &str,
        aliases: &[String],
    ) -> SidecarResult<()>;

    async fn detach_container_from_network(
        &self,
        endpoint: &str,
        container_id: &str,
        network_id: &str,
    ) -> SidecarResult<()>;
}

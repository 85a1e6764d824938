use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{SidecarApi, SidecarError, SidecarResult, VolumeCategory, VolumeStatus};
use crate::models::{ContainerInspect, ContainerState};

#[derive(Deserialize)]
struct Health {
    is_healthy: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawInspect {
    id: String,
    #[serde(default)]
    name: Option<String>,
    state: RawState,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawState {
    status: ContainerState,
}

/// reqwest client for the sidecar API.
#[derive(Clone)]
pub struct SidecarClient {
    client: reqwest::Client,
}

impl SidecarClient {
    pub fn new(timeout: Duration) -> SidecarResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn checked(url: &str, response: reqwest::Response) -> SidecarResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        warn!(url = %url, status = %status, body = %body, "Sidecar request failed");
        Err(SidecarError::Api {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn post_json(&self, url: &str, payload: serde_json::Value) -> SidecarResult<reqwest::Response> {
        debug!(url = %url, "POST to sidecar");
        let response = self.client.post(url).json(&payload).send().await?;
        Self::checked(url, response).await
    }

    async fn post_empty(&self, url: &str) -> SidecarResult<reqwest::Response> {
        debug!(url = %url, "POST to sidecar");
        let response = self.client.post(url).send().await?;
        Self::checked(url, response).await
    }

    async fn transferred(url: &str, response: reqwest::Response) -> SidecarResult<u64> {
        let value: serde_json::Value = response.json().await?;
        value.as_u64().ok_or_else(|| SidecarError::Payload {
            url: url.to_string(),
            message: format!("expected transferred bytes, got {value}"),
        })
    }
}

#[async_trait]
impl SidecarApi for SidecarClient {
    async fn is_healthy(&self, endpoint: &str) -> SidecarResult<bool> {
        let url = format!("{endpoint}/health");
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let health: Health = response.json().await?;
        Ok(health.is_healthy)
    }

    async fn containers_inspect(&self, endpoint: &str) -> SidecarResult<Vec<ContainerInspect>> {
        let url = format!("{endpoint}/v1/containers");
        let response = self.client.get(&url).send().await?;
        let response = Self::checked(&url, response).await?;
        let raw: BTreeMap<String, serde_json::Value> = response.json().await?;

        raw.into_iter()
            .map(|(name, value)| {
                let inspect: RawInspect =
                    serde_json::from_value(value).map_err(|e| SidecarError::Payload {
                        url: url.clone(),
                        message: format!("container {name}: {e}"),
                    })?;
                Ok(ContainerInspect {
                    id: inspect.id,
                    name: inspect.name.unwrap_or(name),
                    status: inspect.state.status,
                })
            })
            .collect()
    }

    async fn create_containers(&self, endpoint: &str, compose_spec: &str) -> SidecarResult<()> {
        let url = format!("{endpoint}/v1/containers");
        self.post_json(&url, json!({ "docker_compose_yaml": compose_spec }))
            .await?;
        Ok(())
    }

    async fn stop_service(&self, endpoint: &str) -> SidecarResult<()> {
        self.post_empty(&format!("{endpoint}/v1/containers:down")).await?;
        Ok(())
    }

    async fn restart_containers(&self, endpoint: &str) -> SidecarResult<()> {
        self.post_empty(&format!("{endpoint}/v1/containers:restart"))
            .await?;
        Ok(())
    }

    async fn pull_user_services_images(&self, endpoint: &str) -> SidecarResult<()> {
        self.post_empty(&format!("{endpoint}/v1/containers/images:pull"))
            .await?;
        Ok(())
    }

    async fn entrypoint_container_name(
        &self,
        endpoint: &str,
        network_name: &str,
    ) -> SidecarResult<Option<String>> {
        let url = format!("{endpoint}/v1/containers/name");
        let filters = json!({ "network": network_name }).to_string();
        let response = self
            .client
            .get(&url)
            .query(&[("filters", filters)])
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::checked(&url, response).await?;
        Ok(Some(response.json().await?))
    }

    async fn set_outputs_watcher(&self, endpoint: &str, enabled: bool) -> SidecarResult<()> {
        let url = format!("{endpoint}/v1/containers/directory-watcher");
        let response = self
            .client
            .patch(&url)
            .json(&json!({ "is_enabled": enabled }))
            .send()
            .await?;
        Self::checked(&url, response).await?;
        Ok(())
    }

    async fn create_output_dirs(&self, endpoint: &str, port_keys: &[String]) -> SidecarResult<()> {
        let url = format!("{endpoint}/v1/containers/ports/outputs/dirs");
        self.post_json(&url, json!({ "outputs_labels": port_keys })).await?;
        Ok(())
    }

    async fn pull_service_input_ports(
        &self,
        endpoint: &str,
        port_keys: Option<&[String]>,
    ) -> SidecarResult<u64> {
        let url = format!("{endpoint}/v1/containers/ports/inputs:pull");
        let response = self.post_json(&url, json!(port_keys)).await?;
        Self::transferred(&url, response).await
    }

    async fn pull_service_output_ports(&self, endpoint: &str) -> SidecarResult<u64> {
        let url = format!("{endpoint}/v1/containers/ports/outputs:pull");
        let response = self.post_empty(&url).await?;
        Self::transferred(&url, response).await
    }

    async fn push_service_output_ports(&self, endpoint: &str) -> SidecarResult<()> {
        self.post_empty(&format!("{endpoint}/v1/containers/ports/outputs:push"))
            .await?;
        Ok(())
    }

    async fn restore_service_state(&self, endpoint: &str) -> SidecarResult<u64> {
        let url = format!("{endpoint}/v1/containers/state:restore");
        let response = self.post_empty(&url).await?;
        Self::transferred(&url, response).await
    }

    async fn save_service_state(&self, endpoint: &str) -> SidecarResult<u64> {
        let url = format!("{endpoint}/v1/containers/state:save");
        let response = self.post_empty(&url).await?;
        Self::transferred(&url, response).await
    }

    async fn update_volume_state(
        &self,
        endpoint: &str,
        category: VolumeCategory,
        status: VolumeStatus,
    ) -> SidecarResult<()> {
        let url = format!("{endpoint}/v1/volumes/{category}");
        let response = self
            .client
            .put(&url)
            .json(&json!({ "status": status }))
            .send()
            .await?;
        Self::checked(&url, response).await?;
        Ok(())
    }

    async fn free_reserved_disk_space(&self, endpoint: &str) -> SidecarResult<()> {
        self.post_empty(&format!("{endpoint}/v1/disk/reserved:free"))
            .await?;
        Ok(())
    }

    async fn attach_container_to_network(
        &self,
        endpoint: &str,
        container_id: &str,
        network_id: &str,
        aliases: &[String],
    ) -> SidecarResult<()> {
        let url = format!("{endpoint}/v1/containers/{container_id}/networks:attach");
        self.post_json(
            &url,
            json!({ "network_id": network_id, "network_aliases": aliases }),
        )
        .await?;
        Ok(())
    }

    async fn detach_container_from_network(
        &self,
        endpoint: &str,
        container_id: &str,
        network_id: &str,
    ) -> SidecarResult<()> {
        let url = format!("{endpoint}/v1/containers/{container_id}/networks:detach");
        self.post_json(&url, json!({ "network_id": network_id }))
            .await?;
        Ok(())
    }
}

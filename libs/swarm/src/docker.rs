//! Engine API client over the local Unix socket.

use std::path::Path;

use async_trait::async_trait;
use hyper::{body::Buf, Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{EngineVersion, Network, NetworkCreate, Service, ServiceSpec, Task};
use crate::{Filters, SwarmApi, SwarmError, SwarmResult};

/// Engine API version the client pins its requests to.
const API_VERSION: &str = "v1.41";

#[derive(Deserialize)]
struct CreatedService {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
struct CreatedNetwork {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct EngineMessage {
    message: String,
}

pub struct DockerClient {
    socket_path: String,
    client: Client<UnixConnector>,
}

impl DockerClient {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        let socket_path = socket_path.as_ref().to_string_lossy().to_string();
        Self {
            socket_path,
            client: Client::unix(),
        }
    }

    pub fn socket_exists(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    fn uri(&self, path: &str, filters: Option<&Filters>) -> hyper::Uri {
        let query = filters.map(Filters::to_query).unwrap_or_default();
        let full = if query.is_empty() {
            format!("/{API_VERSION}{path}")
        } else {
            format!("/{API_VERSION}{path}?{query}")
        };
        Uri::new(&self.socket_path, &full).into()
    }

    async fn send(&self, method: Method, uri: hyper::Uri, body: Body) -> SwarmResult<impl Buf> {
        if !self.socket_exists() {
            return Err(SwarmError::SocketNotFound(self.socket_path.clone()));
        }

        debug!(method = %method, uri = %uri, "Engine API request");

        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(body)?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let body = hyper::body::aggregate(response.into_body()).await?;

        if status.is_success() {
            return Ok(body);
        }

        let raw = body.chunk().to_vec();
        let message = serde_json::from_slice::<EngineMessage>(&raw)
            .map(|m| m.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&raw).to_string());
        if status.as_u16() >= 500 {
            warn!(status = %status, message = %message, "Engine API error");
        }
        Err(SwarmError::api(status.as_u16(), message))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, filters: Option<&Filters>) -> SwarmResult<T> {
        let body = self.send(Method::GET, self.uri(path, filters), Body::empty()).await?;
        Ok(serde_json::from_reader(body.reader())?)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, payload: &B) -> SwarmResult<T> {
        let bytes = serde_json::to_vec(payload)?;
        let body = self.send(Method::POST, self.uri(path, None), Body::from(bytes)).await?;
        Ok(serde_json::from_reader(body.reader())?)
    }

    async fn delete(&self, path: &str) -> SwarmResult<()> {
        self.send(Method::DELETE, self.uri(path, None), Body::empty()).await?;
        Ok(())
    }
}

#[async_trait]
impl SwarmApi for DockerClient {
    async fn version(&self) -> SwarmResult<EngineVersion> {
        self.get("/version", None).await
    }

    async fn create_network(&self, spec: &NetworkCreate) -> SwarmResult<String> {
        let created: CreatedNetwork = self.post("/networks/create", spec).await?;
        Ok(created.id)
    }

    async fn list_networks(&self, filters: &Filters) -> SwarmResult<Vec<Network>> {
        self.get("/networks", Some(filters)).await
    }

    async fn inspect_network(&self, id_or_name: &str) -> SwarmResult<Network> {
        self.get(&format!("/networks/{id_or_name}"), None).await
    }

    async fn remove_network(&self, id_or_name: &str) -> SwarmResult<()> {
        self.delete(&format!("/networks/{id_or_name}")).await
    }

    async fn create_service(&self, spec: &ServiceSpec) -> SwarmResult<String> {
        let created: CreatedService = self.post("/services/create", spec).await?;
        Ok(created.id)
    }

    async fn inspect_service(&self, id_or_name: &str) -> SwarmResult<Service> {
        self.get(&format!("/services/{id_or_name}"), None).await
    }

    async fn list_services(&self, filters: &Filters) -> SwarmResult<Vec<Service>> {
        self.get("/services", Some(filters)).await
    }

    async fn update_service(&self, id: &str, version: u64, spec: &ServiceSpec) -> SwarmResult<()> {
        let path = format!("/services/{id}/update?version={version}");
        let _: serde_json::Value = self.post(&path, spec).await?;
        Ok(())
    }

    async fn remove_service(&self, id_or_name: &str) -> SwarmResult<()> {
        self.delete(&format!("/services/{id_or_name}")).await
    }

    async fn list_tasks(&self, filters: &Filters) -> SwarmResult<Vec<Task>> {
        self.get("/tasks", Some(filters)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_socket_is_reported() {
        let client = DockerClient::new("/nonexistent/docker.sock");
        assert!(!client.socket_exists());
        let err = client.version().await.unwrap_err();
        assert!(matches!(err, SwarmError::SocketNotFound(_)));
    }
}

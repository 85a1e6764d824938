use async_trait::async_trait;

use crate::models::{EngineVersion, Network, NetworkCreate, Service, ServiceSpec, Task};
use crate::{Filters, SwarmResult};

/// The part of the Engine API the scheduler relies on.
///
/// Implementations must report engine failures verbatim (status + message) so
/// callers can tell races ("already exists", "not found") from real errors.
#[async_trait]
pub trait SwarmApi: Send + Sync {
    async fn version(&self) -> SwarmResult<EngineVersion>;

    /// Create a network and return its id.
    async fn create_network(&self, spec: &NetworkCreate) -> SwarmResult<String>;

    async fn list_networks(&self, filters: &Filters) -> SwarmResult<Vec<Network>>;

    async fn inspect_network(&self, id_or_name: &str) -> SwarmResult<Network>;

    async fn remove_network(&self, id_or_name: &str) -> SwarmResult<()>;

    /// Create a service and return its id.
    async fn create_service(&self, spec: &ServiceSpec) -> SwarmResult<String>;

    async fn inspect_service(&self, id_or_name: &str) -> SwarmResult<Service>;

    async fn list_services(&self, filters: &Filters) -> SwarmResult<Vec<Service>>;

    /// Replace a service spec. `version` must be the index the caller read.
    async fn update_service(&self, id: &str, version: u64, spec: &ServiceSpec) -> SwarmResult<()>;

    async fn remove_service(&self, id_or_name: &str) -> SwarmResult<()>;

    async fn list_tasks(&self, filters: &Filters) -> SwarmResult<Vec<Task>>;
}

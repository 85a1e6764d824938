use std::borrow::Borrow;
use std::fmt;

use dynsched_id::InstanceId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SIDECAR_SERVICE_PREFIX: &str = "dy-sidecar";
pub const PROXY_SERVICE_PREFIX: &str = "dy-proxy";
pub const VOLUME_REMOVER_PREFIX: &str = "dy-volume-remover";

/// Swarm service names double as DNS labels.
pub const MAX_SERVICE_NAME_LENGTH: usize = 63;

/// Name of an instance's sidecar service; the registry is keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceName(String);

impl ServiceName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ServiceName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServiceName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

fn truncated(mut name: String) -> String {
    // names are ASCII, byte truncation is safe
    name.truncate(MAX_SERVICE_NAME_LENGTH);
    name
}

pub fn sidecar_service_name(instance_id: InstanceId) -> ServiceName {
    ServiceName(truncated(format!("{SIDECAR_SERVICE_PREFIX}_{instance_id}")))
}

pub fn proxy_service_name(instance_id: InstanceId) -> String {
    truncated(format!("{PROXY_SERVICE_PREFIX}_{instance_id}"))
}

/// The dedicated network carries the sidecar's name.
pub fn sidecar_network_name(instance_id: InstanceId) -> String {
    sidecar_service_name(instance_id).0
}

pub fn volume_remover_service_name() -> String {
    truncated(format!("{VOLUME_REMOVER_PREFIX}_{}", Uuid::new_v4()))
}

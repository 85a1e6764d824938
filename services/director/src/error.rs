use std::time::Duration;

use chrono::Utc;
use dynsched_id::InstanceId;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::docker_api::DockerApiError;
use crate::models::ServiceName;
use crate::node_rights::NodeRightsError;
use crate::projects::ProjectsError;
use crate::sidecar::SidecarError;

/// Errors raised by the scheduler and its pipeline.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("instance {0} is not tracked")]
    NotFound(InstanceId),

    #[error("instance {instance_id} is tracked as {existing}, refusing to add it as {requested}")]
    NameCollision {
        instance_id: InstanceId,
        existing: ServiceName,
        requested: ServiceName,
    },

    #[error("unexpected container status: {0}")]
    UnexpectedContainerStatus(String),

    #[error("no entrypoint container reported by {service_name} within {timeout:?}")]
    EntrypointNotFound {
        service_name: ServiceName,
        timeout: Duration,
    },

    #[error("{field} is not set for {service_name}")]
    MissingField {
        field: &'static str,
        service_name: ServiceName,
    },

    #[error("sidecar {service_name} is not reachable: {reason}")]
    SidecarNotReady {
        service_name: ServiceName,
        reason: String,
    },

    #[error(transparent)]
    Docker(#[from] DockerApiError),

    #[error(transparent)]
    Sidecar(#[from] SidecarError),

    #[error(transparent)]
    NodeRights(#[from] NodeRightsError),

    #[error(transparent)]
    Projects(#[from] ProjectsError),

    #[error("invalid scheduler data: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

const ERROR_CODE_PREFIX: &str = "OEC";
const ERROR_CODE_LEN: usize = 12;

/// Opaque code attached to a contained failure so the log line and the
/// status shown to users can be matched up.
pub fn create_error_code(message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message.as_bytes());
    hasher.update(Utc::now().to_rfc3339().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{ERROR_CODE_PREFIX}:{}", &digest[..ERROR_CODE_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_shape() {
        let code = create_error_code("boom");
        assert!(code.starts_with("OEC:"));
        assert_eq!(code.len(), 4 + ERROR_CODE_LEN);
        assert!(code[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_not_found_classification() {
        assert!(SchedulerError::NotFound(InstanceId::new()).is_not_found());
        assert!(!SchedulerError::UnexpectedContainerStatus("x".into()).is_not_found());
    }
}

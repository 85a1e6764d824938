use std::future::Future;
use std::sync::Arc;

use dynsched_swarm::SwarmApi;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{SchedulerError, SchedulerResult};
use crate::instrumentation::EventPublisher;
use crate::models::ServiceName;
use crate::node_rights::{NodeRightsManager, RESOURCE_STATE_AND_INPUTS};
use crate::projects::ProjectsRepository;
use crate::sidecar::SidecarApi;

/// Collaborators shared by every rule and operator action.
#[derive(Clone)]
pub struct SchedulerContext {
    pub config: Config,
    pub swarm: Arc<dyn SwarmApi>,
    pub sidecar: Arc<dyn SidecarApi>,
    pub node_rights: Arc<NodeRightsManager>,
    pub projects: Arc<dyn ProjectsRepository>,
    pub events: Arc<dyn EventPublisher>,
}

impl SchedulerContext {
    pub fn swarm(&self) -> &dyn SwarmApi {
        self.swarm.as_ref()
    }

    pub fn stack(&self) -> &str {
        &self.config.swarm_stack_name
    }

    /// Run a heavy data transfer while holding a node-rights slot.
    ///
    /// Returns `Ok(None)` without running `op` when the node has no free slot;
    /// the caller retries on a later cycle. `op` is abandoned if the slot's
    /// lock is lost while it runs.
    pub async fn with_node_rights<T, Fut>(
        &self,
        service_name: &ServiceName,
        docker_node_id: Option<&str>,
        op: Fut,
    ) -> SchedulerResult<Option<T>>
    where
        Fut: Future<Output = SchedulerResult<T>>,
    {
        if !self.config.scheduler.node_rights_enabled {
            return op.await.map(Some);
        }

        let node = docker_node_id.ok_or_else(|| SchedulerError::MissingField {
            field: "docker_node_id",
            service_name: service_name.clone(),
        })?;

        let mut guard = match self
            .node_rights
            .acquire(node, RESOURCE_STATE_AND_INPUTS)
            .await
        {
            Ok(guard) => guard,
            Err(e) if e.is_no_capacity() => {
                debug!(service_name = %service_name, node, "Node is busy, deferring transfer");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let result = tokio::select! {
            result = op => result,
            lost = guard.lost() => Err(lost.into()),
        };
        if let Err(e) = guard.release().await {
            warn!(lock = %guard.lock_name(), error = %e, "Failed to release node rights");
        }
        result.map(Some)
    }
}

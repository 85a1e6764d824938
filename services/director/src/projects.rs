//! Project-side facts the scheduler needs but does not own.
//!
//! Teardown asks whether the instance is still part of its project before
//! saving its data; network attachment needs the project's networks and the
//! alias each instance has on them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use dynsched_id::{InstanceId, ProjectId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProjectsError {
    #[error("project {0} not found")]
    ProjectNotFound(ProjectId),

    #[error("projects backend error: {0}")]
    Backend(String),
}

pub type ProjectsResult<T> = Result<T, ProjectsError>;

/// Network name to the alias each instance uses on it.
pub type NetworksWithAliases = BTreeMap<String, BTreeMap<InstanceId, String>>;

#[async_trait]
pub trait ProjectsRepository: Send + Sync {
    /// The instance is still a node of the project's workbench.
    async fn is_node_present_in_workbench(
        &self,
        project_id: ProjectId,
        instance_id: InstanceId,
    ) -> ProjectsResult<bool>;

    async fn projects_networks(&self, project_id: ProjectId) -> ProjectsResult<NetworksWithAliases>;
}

#[derive(Default)]
struct Projects {
    workbench: HashMap<ProjectId, HashSet<InstanceId>>,
    networks: HashMap<ProjectId, NetworksWithAliases>,
}

/// Process-local projects store.
///
/// A permissive store treats every instance as present in its workbench,
/// which is what a standalone scheduler without a project database needs.
pub struct InMemoryProjects {
    permissive: bool,
    projects: Mutex<Projects>,
}

impl InMemoryProjects {
    pub fn new() -> Self {
        Self {
            permissive: false,
            projects: Mutex::new(Projects::default()),
        }
    }

    pub fn permissive() -> Self {
        Self {
            permissive: true,
            projects: Mutex::new(Projects::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Projects> {
        self.projects.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_node(&self, project_id: ProjectId, instance_id: InstanceId) {
        self.lock()
            .workbench
            .entry(project_id)
            .or_default()
            .insert(instance_id);
    }

    pub fn remove_node(&self, project_id: ProjectId, instance_id: InstanceId) {
        if let Some(nodes) = self.lock().workbench.get_mut(&project_id) {
            nodes.remove(&instance_id);
        }
    }

    pub fn set_network_alias(
        &self,
        project_id: ProjectId,
        network: &str,
        instance_id: InstanceId,
        alias: &str,
    ) {
        self.lock()
            .networks
            .entry(project_id)
            .or_default()
            .entry(network.to_string())
            .or_default()
            .insert(instance_id, alias.to_string());
    }
}

impl Default for InMemoryProjects {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProjectsRepository for InMemoryProjects {
    async fn is_node_present_in_workbench(
        &self,
        project_id: ProjectId,
        instance_id: InstanceId,
    ) -> ProjectsResult<bool> {
        if self.permissive {
            return Ok(true);
        }
        Ok(self
            .lock()
            .workbench
            .get(&project_id)
            .is_some_and(|nodes| nodes.contains(&instance_id)))
    }

    async fn projects_networks(&self, project_id: ProjectId) -> ProjectsResult<NetworksWithAliases> {
        Ok(self
            .lock()
            .networks
            .get(&project_id)
            .cloned()
            .unwrap_or_default())
    }
}

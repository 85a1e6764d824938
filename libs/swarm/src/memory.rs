//! Single-node fake swarm.
//!
//! Behaves like the engine where the scheduler cares: names are unique,
//! duplicates are rejected with 409, missing objects with 404, stale updates
//! with "update out of sequence". Every service gets one task which is
//! `running` immediately, except run-once services (restart condition `none`)
//! which complete right away with exit code 0.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::models::{
    ContainerStatus, EngineVersion, Network, NetworkCreate, ObjectVersion, RestartCondition,
    Service, ServiceSpec, Task, TaskState, TaskStatus,
};
use crate::{Filters, SwarmApi, SwarmError, SwarmResult};

#[derive(Default)]
struct ClusterState {
    networks: BTreeMap<String, Network>,
    services: BTreeMap<String, Service>,
    tasks: BTreeMap<String, Task>,
}

pub struct InMemorySwarm {
    node_id: String,
    state: Mutex<ClusterState>,
    next_id: AtomicU64,
    pending_out_of_sequence: AtomicU32,
    service_creations: AtomicU64,
    network_creations: AtomicU64,
}

impl Default for InMemorySwarm {
    fn default() -> Self {
        Self::new("node-1")
    }
}

impl InMemorySwarm {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            state: Mutex::new(ClusterState::default()),
            next_id: AtomicU64::new(1),
            pending_out_of_sequence: AtomicU32::new(0),
            service_creations: AtomicU64::new(0),
            network_creations: AtomicU64::new(0),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}{:012}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        // a poisoned lock only means another test thread panicked
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Pre-create a network, e.g. the shared swarm network.
    pub fn add_network(&self, name: &str, scope: &str) -> String {
        let id = self.next_id("net");
        self.lock().networks.insert(
            id.clone(),
            Network {
                name: name.to_string(),
                id: id.clone(),
                scope: scope.to_string(),
                driver: "overlay".to_string(),
                ..Default::default()
            },
        );
        id
    }

    /// Pretend `count` containers are attached to a network.
    pub fn set_network_containers(&self, name: &str, count: usize) {
        let mut state = self.lock();
        if let Some(network) = state.networks.values_mut().find(|n| n.name == name) {
            network.containers = (0..count)
                .map(|i| (format!("container-{i}"), serde_json::json!({})))
                .collect();
        }
    }

    /// Force the state of every task of a service.
    pub fn set_task_state(&self, service_name: &str, task_state: TaskState) {
        let mut state = self.lock();
        let Some(service_id) = state
            .services
            .values()
            .find(|s| s.spec.name == service_name)
            .map(|s| s.id.clone())
        else {
            return;
        };
        for task in state.tasks.values_mut().filter(|t| t.service_id == service_id) {
            task.status.state = task_state;
            if task_state.is_pending() {
                task.node_id = None;
            }
        }
    }

    /// Shift a service's creation time into the past.
    pub fn backdate_service(&self, service_name: &str, by: chrono::Duration) {
        let mut state = self.lock();
        if let Some(service) = state.services.values_mut().find(|s| s.spec.name == service_name) {
            service.created_at -= by;
            service.updated_at = service.updated_at.min(service.created_at);
        }
    }

    /// Make the next `count` service updates fail with "update out of sequence".
    pub fn fail_next_updates_out_of_sequence(&self, count: u32) {
        self.pending_out_of_sequence.store(count, Ordering::SeqCst);
    }

    pub fn network_names(&self) -> Vec<String> {
        self.lock().networks.values().map(|n| n.name.clone()).collect()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.lock().services.values().map(|s| s.spec.name.clone()).collect()
    }

    pub fn service_spec(&self, name: &str) -> Option<ServiceSpec> {
        self.lock()
            .services
            .values()
            .find(|s| s.spec.name == name)
            .map(|s| s.spec.clone())
    }

    /// Total number of successful service creations since start.
    pub fn service_creations(&self) -> u64 {
        self.service_creations.load(Ordering::SeqCst)
    }

    pub fn network_creations(&self) -> u64 {
        self.network_creations.load(Ordering::SeqCst)
    }

    fn placement_node(&self, spec: &ServiceSpec) -> String {
        spec.task_template
            .placement
            .iter()
            .flat_map(|p| p.constraints.iter())
            .find_map(|c| c.strip_prefix("node.id == ").or_else(|| c.strip_prefix("node.id==")))
            .map(|node| node.trim().to_string())
            .unwrap_or_else(|| self.node_id.clone())
    }

    fn initial_task(&self, service_id: &str, spec: &ServiceSpec) -> Task {
        let run_once = spec
            .task_template
            .restart_policy
            .as_ref()
            .is_some_and(|p| p.condition == RestartCondition::None);
        let (state, container_status) = if run_once {
            (
                TaskState::Complete,
                Some(ContainerStatus { exit_code: Some(0) }),
            )
        } else {
            (TaskState::Running, None)
        };

        Task {
            id: self.next_id("task"),
            service_id: service_id.to_string(),
            node_id: Some(self.placement_node(spec)),
            status: TaskStatus {
                state,
                message: None,
                err: None,
                container_status,
            },
            desired_state: if run_once {
                TaskState::Shutdown
            } else {
                TaskState::Running
            },
            created_at: Utc::now(),
        }
    }
}

fn find_key<'a, T>(
    map: &'a BTreeMap<String, T>,
    id_or_name: &str,
    name_of: impl Fn(&T) -> &str,
) -> Option<&'a String> {
    map.iter()
        .find(|(id, value)| id.as_str() == id_or_name || name_of(value) == id_or_name)
        .map(|(id, _)| id)
}

fn labels_match(labels: &BTreeMap<String, String>, filters: &Filters) -> bool {
    filters.label_pairs().all(|(key, value)| match value {
        Some(value) => labels.get(key).map(String::as_str) == Some(value),
        None => labels.contains_key(key),
    })
}

fn any_or_empty(values: &[String], pred: impl Fn(&str) -> bool) -> bool {
    values.is_empty() || values.iter().any(|v| pred(v))
}

#[async_trait]
impl SwarmApi for InMemorySwarm {
    async fn version(&self) -> SwarmResult<EngineVersion> {
        Ok(EngineVersion {
            version: "27.3.1".to_string(),
            api_version: "1.47".to_string(),
        })
    }

    async fn create_network(&self, spec: &NetworkCreate) -> SwarmResult<String> {
        let mut state = self.lock();
        if state.networks.values().any(|n| n.name == spec.name) {
            return Err(SwarmError::api(
                409,
                format!("network with name {} already exists", spec.name),
            ));
        }
        let id = self.next_id("net");
        state.networks.insert(
            id.clone(),
            Network {
                name: spec.name.clone(),
                id: id.clone(),
                scope: "swarm".to_string(),
                driver: spec.driver.clone(),
                labels: spec.labels.clone(),
                containers: BTreeMap::new(),
            },
        );
        self.network_creations.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn list_networks(&self, filters: &Filters) -> SwarmResult<Vec<Network>> {
        let state = self.lock();
        Ok(state
            .networks
            .values()
            .filter(|n| any_or_empty(filters.get("name"), |v| n.name.contains(v)))
            .filter(|n| any_or_empty(filters.get("id"), |v| n.id == v))
            .filter(|n| any_or_empty(filters.get("scope"), |v| n.scope == v))
            .filter(|n| labels_match(&n.labels, filters))
            .map(|n| Network {
                containers: BTreeMap::new(),
                ..n.clone()
            })
            .collect())
    }

    async fn inspect_network(&self, id_or_name: &str) -> SwarmResult<Network> {
        let state = self.lock();
        find_key(&state.networks, id_or_name, |n| n.name.as_str())
            .and_then(|id| state.networks.get(id))
            .cloned()
            .ok_or_else(|| SwarmError::api(404, format!("network {id_or_name} not found")))
    }

    async fn remove_network(&self, id_or_name: &str) -> SwarmResult<()> {
        let mut state = self.lock();
        let id = find_key(&state.networks, id_or_name, |n| n.name.as_str())
            .cloned()
            .ok_or_else(|| SwarmError::api(404, format!("network {id_or_name} not found")))?;
        if state.networks.get(&id).is_some_and(|n| !n.containers.is_empty()) {
            return Err(SwarmError::api(
                403,
                format!("error while removing network: network {id_or_name} has active endpoints"),
            ));
        }
        state.networks.remove(&id);
        Ok(())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> SwarmResult<String> {
        let mut state = self.lock();
        if state.services.values().any(|s| s.spec.name == spec.name) {
            return Err(SwarmError::api(
                409,
                format!("rpc error: name conflicts with an existing object: service {} already exists", spec.name),
            ));
        }
        for attachment in &spec.task_template.networks {
            if find_key(&state.networks, &attachment.target, |n| n.name.as_str()).is_none() {
                return Err(SwarmError::api(
                    404,
                    format!("network {} not found", attachment.target),
                ));
            }
        }

        let id = self.next_id("svc");
        let now = Utc::now();
        let task = self.initial_task(&id, spec);
        state.tasks.insert(task.id.clone(), task);
        state.services.insert(
            id.clone(),
            Service {
                id: id.clone(),
                version: ObjectVersion { index: 1 },
                created_at: now,
                updated_at: now,
                spec: spec.clone(),
            },
        );
        self.service_creations.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn inspect_service(&self, id_or_name: &str) -> SwarmResult<Service> {
        let state = self.lock();
        find_key(&state.services, id_or_name, |s| s.spec.name.as_str())
            .and_then(|id| state.services.get(id))
            .cloned()
            .ok_or_else(|| SwarmError::api(404, format!("service {id_or_name} not found")))
    }

    async fn list_services(&self, filters: &Filters) -> SwarmResult<Vec<Service>> {
        let state = self.lock();
        Ok(state
            .services
            .values()
            .filter(|s| any_or_empty(filters.get("name"), |v| s.spec.name.starts_with(v)))
            .filter(|s| any_or_empty(filters.get("id"), |v| s.id == v))
            .filter(|s| labels_match(&s.spec.labels, filters))
            .cloned()
            .collect())
    }

    async fn update_service(&self, id: &str, version: u64, spec: &ServiceSpec) -> SwarmResult<()> {
        let injected = self
            .pending_out_of_sequence
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SwarmError::api(500, "rpc error: update out of sequence"));
        }

        let mut state = self.lock();
        let key = find_key(&state.services, id, |s| s.spec.name.as_str())
            .cloned()
            .ok_or_else(|| SwarmError::api(404, format!("service {id} not found")))?;
        let node = self.placement_node(spec);
        let service = state
            .services
            .get_mut(&key)
            .ok_or_else(|| SwarmError::api(404, format!("service {id} not found")))?;
        if service.version.index != version {
            return Err(SwarmError::api(500, "rpc error: update out of sequence"));
        }
        service.version.index += 1;
        service.updated_at = Utc::now();
        service.spec = spec.clone();

        for task in state.tasks.values_mut().filter(|t| t.service_id == key) {
            if task.node_id.is_some() {
                task.node_id = Some(node.clone());
            }
        }
        Ok(())
    }

    async fn remove_service(&self, id_or_name: &str) -> SwarmResult<()> {
        let mut state = self.lock();
        let id = find_key(&state.services, id_or_name, |s| s.spec.name.as_str())
            .cloned()
            .ok_or_else(|| SwarmError::api(404, format!("service {id_or_name} not found")))?;
        state.services.remove(&id);
        state.tasks.retain(|_, t| t.service_id != id);
        Ok(())
    }

    async fn list_tasks(&self, filters: &Filters) -> SwarmResult<Vec<Task>> {
        let state = self.lock();
        let service_ids: Vec<String> = filters
            .get("service")
            .iter()
            .filter_map(|s| find_key(&state.services, s, |svc| svc.spec.name.as_str()).cloned())
            .collect();
        let wants_service = !filters.get("service").is_empty();

        Ok(state
            .tasks
            .values()
            .filter(|t| !wants_service || service_ids.contains(&t.service_id))
            .filter(|t| {
                any_or_empty(filters.get("desired-state"), |v| {
                    serde_json::to_value(t.desired_state)
                        .ok()
                        .and_then(|s| s.as_str().map(|s| s == v))
                        .unwrap_or(false)
                })
            })
            .filter(|t| {
                state
                    .services
                    .get(&t.service_id)
                    .is_some_and(|s| labels_match(&s.spec.labels, filters))
            })
            .cloned()
            .collect())
    }
}

//! Scheduler-level swarm operations.
//!
//! Everything here goes through [`SwarmApi`] and tolerates the races a busy
//! cluster produces: creating something that already exists recovers its id,
//! removing something already gone is not an error, and stale service updates
//! are retried.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use dynsched_id::{InstanceId, ProjectId, UserId};
use dynsched_reconcile::{retry_until, Attempt, BackoffPolicy, RetryError};
use dynsched_swarm::models::{Network, NetworkCreate, Service, ServiceSpec, TaskState};
use dynsched_swarm::{Filters, SwarmApi, SwarmError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::models::{labels, SchedulerData, SIDECAR_SERVICE_PREFIX, VOLUME_REMOVER_PREFIX};
use crate::specs::{volume_remover_spec, VolumeRemoval};

/// Attempts the helper makes per volume, and the pause between them.
pub const VOLUME_REMOVAL_ATTEMPTS: u32 = 15;
pub const VOLUME_REMOVAL_SLEEP: Duration = Duration::from_secs(2);

/// A helper running this many times longer than declared is reaped.
const PENDING_REMOVAL_TIMEOUT_FACTOR: i64 = 10;

const UPDATE_SPEC_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DockerApiError {
    #[error(transparent)]
    Swarm(#[from] SwarmError),

    #[error("no swarm network matches '{0}'")]
    NoSuchNetwork(String),

    #[error("{count} swarm networks match '{name}', expected exactly one")]
    AmbiguousNetwork { name: String, count: usize },

    #[error("timed out waiting for {what}: {reason}")]
    Timeout { what: String, reason: String },

    #[error("task of service {service} failed: {message}")]
    TaskFailed { service: String, message: String },

    #[error("label '{label}' on service {service} is invalid: {reason}")]
    InvalidLabel {
        service: String,
        label: String,
        reason: String,
    },
}

pub type DockerResult<T> = Result<T, DockerApiError>;

impl DockerApiError {
    fn timeout(what: impl Into<String>, err: RetryError<DockerApiError>) -> Self {
        match err {
            RetryError::Failed(e) => e,
            RetryError::Exhausted { last_reason, .. } => Self::Timeout {
                what: what.into(),
                reason: last_reason,
            },
        }
    }
}

fn stack_filters(swarm_stack_name: &str, instance_id: InstanceId) -> Filters {
    Filters::new()
        .label(labels::SWARM_STACK_NAME, swarm_stack_name)
        .label(labels::UUID, &instance_id.to_string())
}

// =============================================================================
// Networks
// =============================================================================

/// Create a network, or return the id of the one that already carries its name.
pub async fn create_network(swarm: &dyn SwarmApi, spec: &NetworkCreate) -> DockerResult<String> {
    match swarm.create_network(spec).await {
        Ok(id) => Ok(id),
        Err(e) if e.is_already_exists() => {
            debug!(network = %spec.name, "Network already exists, reusing it");
            let network = swarm.inspect_network(&spec.name).await?;
            Ok(network.id)
        }
        Err(e) => Err(e.into()),
    }
}

/// The one swarm-scoped network whose name contains `name_fragment`.
pub async fn get_swarm_network(swarm: &dyn SwarmApi, name_fragment: &str) -> DockerResult<Network> {
    let mut networks: Vec<Network> = swarm
        .list_networks(&Filters::new().scope("swarm").name(name_fragment))
        .await?
        .into_iter()
        .filter(|n| n.name.contains(name_fragment))
        .collect();

    match networks.len() {
        0 => Err(DockerApiError::NoSuchNetwork(name_fragment.to_string())),
        1 => Ok(networks.remove(0)),
        count => Err(DockerApiError::AmbiguousNetwork {
            name: name_fragment.to_string(),
            count,
        }),
    }
}

/// Remove the instance's dedicated network. Returns false when the engine
/// refused, which usually means containers are still detaching.
pub async fn remove_sidecar_network(swarm: &dyn SwarmApi, network_name: &str) -> bool {
    match swarm.remove_network(network_name).await {
        Ok(()) => true,
        Err(e) if e.is_not_found() => true,
        Err(e) => {
            warn!(
                network = %network_name,
                error = %e,
                "Could not remove network, the engine may still be detaching its containers"
            );
            false
        }
    }
}

/// Ids of the given project networks, creating the missing ones.
pub async fn get_or_create_networks_ids(
    swarm: &dyn SwarmApi,
    networks: &[String],
    project_id: ProjectId,
) -> DockerResult<BTreeMap<String, String>> {
    let mut ids = BTreeMap::new();
    for name in networks {
        let spec = NetworkCreate {
            name: name.clone(),
            driver: "overlay".to_string(),
            attachable: true,
            internal: true,
            check_duplicate: true,
            labels: BTreeMap::from([
                (
                    "com.simcore.description".to_string(),
                    "project service communication network".to_string(),
                ),
                ("project_id".to_string(), project_id.to_string()),
            ]),
        };
        let id = create_network(swarm, &spec).await?;
        ids.insert(name.clone(), id);
    }
    Ok(ids)
}

/// Project networks and how many containers are attached to each.
pub async fn get_projects_networks_containers(
    swarm: &dyn SwarmApi,
    project_id: ProjectId,
) -> DockerResult<BTreeMap<String, usize>> {
    let networks = swarm
        .list_networks(&Filters::new().label("project_id", &project_id.to_string()))
        .await?;

    let mut counts = BTreeMap::new();
    for network in networks {
        // list results leave `Containers` empty, only inspect fills it
        let inspected = match swarm.inspect_network(&network.id).await {
            Ok(n) => n,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e.into()),
        };
        counts.insert(inspected.name, inspected.containers.len());
    }
    Ok(counts)
}

pub async fn try_to_remove_network(swarm: &dyn SwarmApi, network_name: &str) {
    if let Err(e) = swarm.remove_network(network_name).await {
        if !e.is_not_found() {
            warn!(network = %network_name, error = %e, "Could not remove network");
        }
    }
}

// =============================================================================
// Services
// =============================================================================

/// Create a service, or return the id of the one that already carries its name.
pub async fn create_service_and_get_id(swarm: &dyn SwarmApi, spec: &ServiceSpec) -> DockerResult<String> {
    match swarm.create_service(spec).await {
        Ok(id) => Ok(id),
        Err(e) if e.is_already_exists() => {
            debug!(service = %spec.name, "Service already exists, reusing it");
            Ok(swarm.inspect_service(&spec.name).await?.id)
        }
        Err(e) => Err(e.into()),
    }
}

/// `None` when the service does not exist.
pub async fn find_service(swarm: &dyn SwarmApi, name: &str) -> DockerResult<Option<Service>> {
    match swarm.inspect_service(name).await {
        Ok(service) => Ok(Some(service)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Wait until a task of the service runs and return the node it landed on.
#[instrument(skip(swarm))]
pub async fn get_service_placement(
    swarm: &dyn SwarmApi,
    service_id: &str,
    timeout: Duration,
) -> DockerResult<String> {
    // randomized so many sidecars starting together do not poll in lockstep
    let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(20), 0.5);

    retry_until(&policy, timeout, move |_| async move {
        let tasks = match swarm.list_tasks(&Filters::new().service(service_id)).await {
            Ok(tasks) => tasks,
            Err(e) => return Attempt::Failed(DockerApiError::from(e)),
        };
        let Some(task) = tasks.into_iter().max_by_key(|t| t.created_at) else {
            return Attempt::TryAgain(format!("no task for service {service_id} yet"));
        };
        match (task.status.state, task.node_id) {
            (TaskState::Running, Some(node)) => Attempt::Ready(node),
            (TaskState::Running, None) => Attempt::Failed(DockerApiError::TaskFailed {
                service: service_id.to_string(),
                message: "running task has no node assigned".to_string(),
            }),
            (state, _) => Attempt::TryAgain(format!("task is {state:?}")),
        }
    })
    .await
    .map_err(|e| DockerApiError::timeout(format!("placement of {service_id}"), e))
}

async fn try_update_spec<F>(swarm: &dyn SwarmApi, service_name: &str, update: &F) -> Attempt<(), DockerApiError>
where
    F: Fn(&mut ServiceSpec) + Send + Sync,
{
    let service = match swarm.inspect_service(service_name).await {
        Ok(service) => service,
        Err(e) => return Attempt::Failed(e.into()),
    };
    let mut spec = service.spec;
    update(&mut spec);

    match swarm.update_service(&service.id, service.version.index, &spec).await {
        Ok(()) => Attempt::Ready(()),
        Err(e) if e.is_out_of_sequence() => Attempt::TryAgain(e.to_string()),
        Err(e) => Attempt::Failed(e.into()),
    }
}

/// Read-modify-write of a service spec. Updates based on a stale version are
/// retried against a fresh read until a short deadline.
pub async fn update_service_spec<F>(swarm: &dyn SwarmApi, service_name: &str, update: F) -> DockerResult<()>
where
    F: Fn(&mut ServiceSpec) + Send + Sync,
{
    let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(2), 0.0);
    let update = &update;
    retry_until(&policy, UPDATE_SPEC_DEADLINE, move |_| async move {
        try_update_spec(swarm, service_name, update).await
    })
    .await
    .map_err(|e| DockerApiError::timeout(format!("update of {service_name}"), e))
}

/// Rewrite the recovery label of the sidecar service.
pub async fn update_scheduler_data_label(swarm: &dyn SwarmApi, data: &SchedulerData) -> DockerResult<()> {
    let label_data = data
        .as_label_data()
        .map_err(|e| DockerApiError::InvalidLabel {
            service: data.service_name.to_string(),
            label: labels::SCHEDULER_DATA.to_string(),
            reason: e.to_string(),
        })?;

    let result = update_service_spec(swarm, data.service_name.as_str(), |spec| {
        spec.labels
            .insert(labels::SCHEDULER_DATA.to_string(), label_data.clone());
    })
    .await;

    match result {
        Err(DockerApiError::Swarm(e)) if e.is_not_found() => {
            warn!(
                service_name = %data.service_name,
                "Skipped label update, the service no longer exists"
            );
            Ok(())
        }
        other => other,
    }
}

pub async fn constrain_service_to_node(
    swarm: &dyn SwarmApi,
    service_name: &str,
    docker_node_id: &str,
) -> DockerResult<()> {
    let constraint = format!("node.id == {docker_node_id}");
    update_service_spec(swarm, service_name, |spec| {
        let placement = spec.task_template.placement.get_or_insert_with(Default::default);
        placement
            .constraints
            .retain(|c| !c.starts_with("node.id"));
        placement.constraints.push(constraint.clone());
    })
    .await?;
    info!(service = %service_name, node = %docker_node_id, "Constrained service to node");
    Ok(())
}

async fn stack_services(
    swarm: &dyn SwarmApi,
    swarm_stack_name: &str,
    instance_id: InstanceId,
) -> DockerResult<Vec<Service>> {
    Ok(swarm
        .list_services(&stack_filters(swarm_stack_name, instance_id))
        .await?)
}

/// Neither the sidecar nor the proxy exists.
pub async fn is_sidecar_stack_missing(
    swarm: &dyn SwarmApi,
    swarm_stack_name: &str,
    instance_id: InstanceId,
) -> DockerResult<bool> {
    Ok(stack_services(swarm, swarm_stack_name, instance_id)
        .await?
        .is_empty())
}

pub async fn are_sidecar_and_proxy_services_present(
    swarm: &dyn SwarmApi,
    swarm_stack_name: &str,
    instance_id: InstanceId,
) -> DockerResult<bool> {
    Ok(stack_services(swarm, swarm_stack_name, instance_id).await?.len() == 2)
}

/// Remove every service of the instance's stack.
pub async fn remove_sidecar_stack(
    swarm: &dyn SwarmApi,
    swarm_stack_name: &str,
    instance_id: InstanceId,
) -> DockerResult<()> {
    let services = stack_services(swarm, swarm_stack_name, instance_id).await?;
    let removals = services.iter().map(|s| swarm.remove_service(&s.id));
    for (service, result) in services.iter().zip(futures_util::future::join_all(removals).await) {
        match result {
            Ok(()) => debug!(service = %service.spec.name, "Removed service"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Sidecar services of this stack, optionally restricted to a user or project.
pub async fn list_sidecar_services(
    swarm: &dyn SwarmApi,
    swarm_stack_name: &str,
    user_id: Option<UserId>,
    project_id: Option<ProjectId>,
) -> DockerResult<Vec<Service>> {
    let mut filters = Filters::new()
        .label(labels::SWARM_STACK_NAME, swarm_stack_name)
        .name(SIDECAR_SERVICE_PREFIX);
    if let Some(user_id) = user_id {
        filters = filters.label(labels::USER_ID, &user_id.to_string());
    }
    if let Some(project_id) = project_id {
        filters = filters.label(labels::STUDY_ID, &project_id.to_string());
    }
    Ok(swarm.list_services(&filters).await?)
}

// =============================================================================
// Stack status
// =============================================================================

/// Coarse state of the sidecar, derived from its newest task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    Pending,
    Starting,
    Running,
    Complete,
    Failed,
}

impl From<TaskState> for ServiceState {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::New | TaskState::Allocated | TaskState::Pending | TaskState::Assigned => {
                Self::Pending
            }
            TaskState::Accepted | TaskState::Preparing | TaskState::Ready | TaskState::Starting => {
                Self::Starting
            }
            TaskState::Running => Self::Running,
            TaskState::Complete | TaskState::Shutdown => Self::Complete,
            TaskState::Failed
            | TaskState::Rejected
            | TaskState::Remove
            | TaskState::Orphaned
            | TaskState::Unknown => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackStatus {
    pub state: ServiceState,
    pub message: String,
}

pub async fn get_stack_status(swarm: &dyn SwarmApi, service_name: &str) -> DockerResult<StackStatus> {
    let tasks = swarm.list_tasks(&Filters::new().service(service_name)).await?;
    let Some(task) = tasks.into_iter().max_by_key(|t| t.created_at) else {
        return Ok(StackStatus {
            state: ServiceState::Pending,
            message: "no task scheduled yet".to_string(),
        });
    };
    let message = task
        .status
        .err
        .or(task.status.message)
        .unwrap_or_default();
    Ok(StackStatus {
        state: task.status.state.into(),
        message,
    })
}

// =============================================================================
// Volumes
// =============================================================================

/// Remove volumes on a node by running a one-shot helper service there.
///
/// Returns false when the helper did not finish cleanly; the volumes are left
/// behind in that case. The helper service is always deleted.
#[instrument(skip(swarm, removal), fields(node = %removal.docker_node_id))]
pub async fn remove_volumes_from_node(swarm: &dyn SwarmApi, removal: &VolumeRemoval) -> DockerResult<bool> {
    let engine = swarm.version().await?;
    let service_timeout =
        VOLUME_REMOVAL_SLEEP * VOLUME_REMOVAL_ATTEMPTS * removal.volume_names.len().max(1) as u32;
    let spec = volume_remover_spec(removal, &engine.version, service_timeout);

    let created = swarm.create_service(&spec).await?;
    let service_id = created.as_str();
    let outcome = retry_until(
        &BackoffPolicy::fixed(Duration::from_millis(500)),
        service_timeout,
        move |_| async move {
            let tasks = match swarm.list_tasks(&Filters::new().service(service_id)).await {
                Ok(tasks) => tasks,
                Err(e) => return Attempt::Failed(DockerApiError::from(e)),
            };
            let [task] = tasks.as_slice() else {
                return Attempt::TryAgain(format!("expected 1 task, found {}", tasks.len()));
            };
            if !task.status.state.is_terminal() {
                return Attempt::TryAgain(format!("task is {:?}", task.status.state));
            }
            let exit_code = task
                .status
                .container_status
                .as_ref()
                .and_then(|c| c.exit_code);
            Attempt::Ready(task.status.state == TaskState::Complete && exit_code == Some(0))
        },
    )
    .await;

    // swarm never reaps finished services
    if let Err(e) = swarm.remove_service(service_id).await {
        if !e.is_not_found() {
            warn!(service_id = %service_id, error = %e, "Could not remove volume remover");
        }
    }

    match outcome {
        Ok(true) => Ok(true),
        Ok(false) => {
            warn!(volumes = ?removal.volume_names, "Volume remover did not complete cleanly");
            Ok(false)
        }
        Err(e) => Err(DockerApiError::timeout("volume removal", e)),
    }
}

/// Delete volume removers running far past their declared timeout.
pub async fn remove_pending_volume_removal_services(
    swarm: &dyn SwarmApi,
    swarm_stack_name: &str,
) -> DockerResult<usize> {
    let services = swarm
        .list_services(
            &Filters::new()
                .label(labels::SWARM_STACK_NAME, swarm_stack_name)
                .name(VOLUME_REMOVER_PREFIX),
        )
        .await?;

    let now = Utc::now();
    let mut removed = 0;
    for service in services {
        let Some(raw) = service.spec.labels.get(labels::SERVICE_TIMEOUT_S) else {
            warn!(service = %service.spec.name, "Volume remover has no timeout label");
            continue;
        };
        let timeout_s: i64 = match raw.parse() {
            Ok(value) => value,
            Err(e) => {
                warn!(service = %service.spec.name, error = %e, "Invalid timeout label");
                continue;
            }
        };
        let age = now.signed_duration_since(service.created_at).num_seconds();
        if age <= timeout_s * PENDING_REMOVAL_TIMEOUT_FACTOR {
            continue;
        }
        debug!(service = %service.spec.name, age_s = age, "Removing pending volume remover");
        match swarm.remove_service(&service.id).await {
            Ok(()) => removed += 1,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures;
    use dynsched_swarm::models::TaskTemplate;
    use dynsched_swarm::InMemorySwarm;
    use rstest::rstest;

    fn service(name: &str, stack: &str, instance_id: InstanceId) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            labels: BTreeMap::from([
                (labels::SWARM_STACK_NAME.to_string(), stack.to_string()),
                (labels::UUID.to_string(), instance_id.to_string()),
            ]),
            task_template: TaskTemplate::default(),
        }
    }

    fn network(name: &str) -> NetworkCreate {
        NetworkCreate {
            name: name.to_string(),
            driver: "overlay".to_string(),
            attachable: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_network_recovers_existing_id() {
        let swarm = InMemorySwarm::default();
        let first = create_network(&swarm, &network("net-a")).await.unwrap();
        let second = create_network(&swarm, &network("net-a")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(swarm.network_creations(), 1);
    }

    #[tokio::test]
    async fn test_swarm_network_must_be_unique() {
        let swarm = InMemorySwarm::default();
        assert!(matches!(
            get_swarm_network(&swarm, "subnet").await,
            Err(DockerApiError::NoSuchNetwork(_))
        ));

        swarm.add_network("osparc_interactive_subnet", "swarm");
        swarm.add_network("local_subnet", "local");
        let found = get_swarm_network(&swarm, "subnet").await.unwrap();
        assert_eq!(found.name, "osparc_interactive_subnet");

        swarm.add_network("other_subnet", "swarm");
        assert!(matches!(
            get_swarm_network(&swarm, "subnet").await,
            Err(DockerApiError::AmbiguousNetwork { count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_create_service_is_idempotent() {
        let swarm = InMemorySwarm::default();
        let id = InstanceId::new();
        let first = create_service_and_get_id(&swarm, &service("svc", "s", id)).await.unwrap();
        let second = create_service_and_get_id(&swarm, &service("svc", "s", id)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(swarm.service_creations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_placement_waits_for_running_task() {
        let swarm = InMemorySwarm::new("node-7");
        let id = swarm
            .create_service(&service("svc", "s", InstanceId::new()))
            .await
            .unwrap();
        assert_eq!(
            get_service_placement(&swarm, &id, Duration::from_secs(60)).await.unwrap(),
            "node-7"
        );

        swarm.set_task_state("svc", TaskState::Pending);
        let err = get_service_placement(&swarm, &id, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, DockerApiError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_retries_out_of_sequence() {
        let swarm = InMemorySwarm::default();
        swarm
            .create_service(&service("svc", "s", InstanceId::new()))
            .await
            .unwrap();
        swarm.fail_next_updates_out_of_sequence(3);

        constrain_service_to_node(&swarm, "svc", "node-9").await.unwrap();
        let spec = swarm.service_spec("svc").unwrap();
        assert_eq!(
            spec.task_template.placement.unwrap().constraints,
            vec!["node.id == node-9".to_string()]
        );
    }

    #[tokio::test]
    async fn test_label_update_skips_missing_service() {
        let swarm = InMemorySwarm::default();
        let data = fixtures::scheduler_data();
        update_scheduler_data_label(&swarm, &data).await.unwrap();
    }

    #[tokio::test]
    async fn test_label_update_writes_recovery_blob() {
        let swarm = InMemorySwarm::default();
        let data = fixtures::scheduler_data();
        swarm
            .create_service(&service(data.service_name.as_str(), "s", data.instance_id))
            .await
            .unwrap();

        update_scheduler_data_label(&swarm, &data).await.unwrap();
        let spec = swarm.service_spec(data.service_name.as_str()).unwrap();
        let recovered = SchedulerData::from_label_data(&spec.labels[labels::SCHEDULER_DATA]).unwrap();
        assert_eq!(recovered.instance_id, data.instance_id);
    }

    #[tokio::test]
    async fn test_stack_presence_and_removal() {
        let swarm = InMemorySwarm::default();
        let id = InstanceId::new();
        assert!(is_sidecar_stack_missing(&swarm, "s", id).await.unwrap());

        swarm.create_service(&service("dy-sidecar_x", "s", id)).await.unwrap();
        assert!(!is_sidecar_stack_missing(&swarm, "s", id).await.unwrap());
        assert!(!are_sidecar_and_proxy_services_present(&swarm, "s", id).await.unwrap());

        swarm.create_service(&service("dy-proxy_x", "s", id)).await.unwrap();
        swarm
            .create_service(&service("dy-sidecar_other", "s", InstanceId::new()))
            .await
            .unwrap();
        assert!(are_sidecar_and_proxy_services_present(&swarm, "s", id).await.unwrap());

        remove_sidecar_stack(&swarm, "s", id).await.unwrap();
        assert!(is_sidecar_stack_missing(&swarm, "s", id).await.unwrap());
        assert_eq!(swarm.service_names(), vec!["dy-sidecar_other".to_string()]);
    }

    #[tokio::test]
    async fn test_project_networks_container_counts() {
        let swarm = InMemorySwarm::default();
        let project = ProjectId::new();
        let ids = get_or_create_networks_ids(&swarm, &["a".to_string(), "b".to_string()], project)
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        swarm.set_network_containers("a", 2);

        let counts = get_projects_networks_containers(&swarm, project).await.unwrap();
        assert_eq!(counts["a"], 2);
        assert_eq!(counts["b"], 0);

        try_to_remove_network(&swarm, "b").await;
        try_to_remove_network(&swarm, "a").await;
        assert_eq!(swarm.network_names(), vec!["a".to_string()]);
    }

    #[rstest]
    #[case(TaskState::Pending, ServiceState::Pending)]
    #[case(TaskState::Assigned, ServiceState::Pending)]
    #[case(TaskState::Preparing, ServiceState::Starting)]
    #[case(TaskState::Running, ServiceState::Running)]
    #[case(TaskState::Complete, ServiceState::Complete)]
    #[case(TaskState::Rejected, ServiceState::Failed)]
    #[case(TaskState::Unknown, ServiceState::Failed)]
    fn test_task_state_mapping(#[case] task: TaskState, #[case] expected: ServiceState) {
        assert_eq!(ServiceState::from(task), expected);
    }

    #[tokio::test]
    async fn test_stack_status_of_running_service() {
        let swarm = InMemorySwarm::default();
        swarm
            .create_service(&service("dy-sidecar_y", "s", InstanceId::new()))
            .await
            .unwrap();
        let status = get_stack_status(&swarm, "dy-sidecar_y").await.unwrap();
        assert_eq!(status.state, ServiceState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_remover_runs_and_is_deleted() {
        let swarm = InMemorySwarm::default();
        let removal = VolumeRemoval {
            swarm_stack_name: "s".to_string(),
            docker_node_id: "node-1".to_string(),
            volume_names: vec!["dyv_a".to_string(), "dyv_b".to_string()],
        };
        assert!(remove_volumes_from_node(&swarm, &removal).await.unwrap());
        assert!(swarm.service_names().is_empty());
        assert_eq!(swarm.service_creations(), 1);
    }

    #[tokio::test]
    async fn test_fresh_volume_removers_are_kept() {
        let swarm = InMemorySwarm::default();
        let spec = volume_remover_spec(
            &VolumeRemoval {
                swarm_stack_name: "s".to_string(),
                docker_node_id: "node-1".to_string(),
                volume_names: vec!["dyv_a".to_string()],
            },
            "27.3.1",
            Duration::from_secs(30),
        );
        swarm.create_service(&spec).await.unwrap();

        assert_eq!(remove_pending_volume_removal_services(&swarm, "s").await.unwrap(), 0);
        assert_eq!(swarm.service_names().len(), 1);
    }
}

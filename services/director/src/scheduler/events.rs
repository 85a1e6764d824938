//! The reconciliation pipeline.
//!
//! A rule pairs a pure predicate over the instance state with an action that
//! moves the instance one step forward. The observer walks [`PIPELINE`] in
//! order once per cycle and runs every rule whose predicate holds.

use std::collections::BTreeMap;
use std::time::Duration;

use dynsched_id::RunId;
use dynsched_reconcile::{retry_until, Attempt, BackoffPolicy, RetryError};
use dynsched_swarm::models::NetworkCreate;
use tracing::{debug, info, instrument, warn};

use super::context::SchedulerContext;
use super::teardown;
use crate::docker_api::{self, DockerApiError};
use crate::error::{SchedulerError, SchedulerResult};
use crate::instrumentation::{InstrumentationEvent, Metric};
use crate::models::{labels, SchedulerData};
use crate::sidecar::{SidecarError, VolumeCategory, VolumeStatus};
use crate::specs;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(1);
const ENTRYPOINT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    CreateStack,
    WaitForSidecarApi,
    UpdateHealth,
    GetStatus,
    PrepareEnvironment,
    CreateUserServices,
    AttachProjectNetworks,
    RemoveMarkedInstance,
}

/// Evaluation order of one observation cycle.
pub const PIPELINE: [Rule; 8] = [
    Rule::CreateStack,
    Rule::WaitForSidecarApi,
    Rule::UpdateHealth,
    Rule::GetStatus,
    Rule::PrepareEnvironment,
    Rule::CreateUserServices,
    Rule::AttachProjectNetworks,
    Rule::RemoveMarkedInstance,
];

impl Rule {
    pub fn name(self) -> &'static str {
        match self {
            Self::CreateStack => "create_stack",
            Self::WaitForSidecarApi => "wait_for_sidecar_api",
            Self::UpdateHealth => "update_health",
            Self::GetStatus => "get_status",
            Self::PrepareEnvironment => "prepare_environment",
            Self::CreateUserServices => "create_user_services",
            Self::AttachProjectNetworks => "attach_project_networks",
            Self::RemoveMarkedInstance => "remove_marked_instance",
        }
    }

    /// Whether the rule applies to the instance in its current state.
    pub fn will_trigger(self, data: &SchedulerData) -> bool {
        let ds = &data.dynamic_sidecar;
        match self {
            Self::CreateStack => !ds.was_dynamic_sidecar_started && ds.can_advance(),
            Self::WaitForSidecarApi => {
                ds.was_dynamic_sidecar_started && !ds.is_ready && ds.can_advance()
            }
            Self::UpdateHealth => {
                ds.was_dynamic_sidecar_started && !ds.service_removal_state.was_removed
            }
            Self::GetStatus => ds.was_dynamic_sidecar_started && ds.is_ready && ds.can_advance(),
            Self::PrepareEnvironment => {
                ds.is_ready && !ds.is_service_environment_ready && ds.can_advance()
            }
            Self::CreateUserServices => {
                ds.is_service_environment_ready
                    && !ds.compose_spec_submitted()
                    && ds.can_advance()
            }
            Self::AttachProjectNetworks => {
                ds.were_containers_created
                    && ds.are_containers_running()
                    && !ds.is_project_network_attached
                    && ds.can_advance()
            }
            Self::RemoveMarkedInstance => ds.service_removal_state.can_remove,
        }
    }

    pub async fn action(self, ctx: &SchedulerContext, data: &mut SchedulerData) -> SchedulerResult<()> {
        match self {
            Self::CreateStack => create_stack(ctx, data).await,
            Self::WaitForSidecarApi => wait_for_sidecar_api(ctx, data).await,
            Self::UpdateHealth => update_health(ctx, data).await,
            Self::GetStatus => get_status(ctx, data).await,
            Self::PrepareEnvironment => prepare_environment(ctx, data).await,
            Self::CreateUserServices => create_user_services(ctx, data).await,
            Self::AttachProjectNetworks => attach_project_networks(ctx, data).await,
            Self::RemoveMarkedInstance => teardown::remove_marked_instance(ctx, data).await,
        }
    }
}

fn missing(field: &'static str, data: &SchedulerData) -> SchedulerError {
    SchedulerError::MissingField {
        field,
        service_name: data.service_name.clone(),
    }
}

// =============================================================================
// Stack creation
// =============================================================================

fn sidecar_network(data: &SchedulerData) -> NetworkCreate {
    NetworkCreate {
        name: data.dynamic_sidecar_network_name.clone(),
        driver: "overlay".to_string(),
        attachable: true,
        internal: false,
        check_duplicate: true,
        labels: BTreeMap::from([
            (labels::UUID.to_string(), data.instance_id.to_string()),
            (
                "com.simcore.description".to_string(),
                "interactive for node".to_string(),
            ),
        ]),
    }
}

/// Create the dedicated network, the sidecar and its proxy.
///
/// Safe to repeat after a crash: resources that already exist are adopted,
/// and the run id is read back from the running sidecar.
#[instrument(skip_all, fields(service_name = %data.service_name))]
async fn create_stack(ctx: &SchedulerContext, data: &mut SchedulerData) -> SchedulerResult<()> {
    let swarm = ctx.swarm();

    let sidecar_network_id = docker_api::create_network(swarm, &sidecar_network(data)).await?;
    let swarm_network = docker_api::get_swarm_network(swarm, &ctx.config.swarm_network_name).await?;

    let sidecar_id = match docker_api::find_service(swarm, data.service_name.as_str()).await? {
        Some(existing) => {
            if let Some(raw) = existing.spec.labels.get(labels::RUN_ID) {
                data.run_id = RunId::parse(raw).map_err(|e| DockerApiError::InvalidLabel {
                    service: data.service_name.to_string(),
                    label: labels::RUN_ID.to_string(),
                    reason: e.to_string(),
                })?;
            }
            info!(run_id = %data.run_id, "Adopting existing sidecar");
            existing.id
        }
        None => {
            data.run_id = RunId::new();
            data.dynamic_sidecar.swarm_network_name = Some(swarm_network.name.clone());
            let spec = specs::sidecar_spec(data, &ctx.config, &swarm_network.id, &sidecar_network_id)?;
            let id = docker_api::create_service_and_get_id(swarm, &spec).await?;
            info!(run_id = %data.run_id, "Created sidecar");
            ctx.events
                .publish(InstrumentationEvent::new(Metric::ServiceStarted, data))
                .await;
            id
        }
    };

    let docker_node_id =
        docker_api::get_service_placement(swarm, &sidecar_id, ctx.config.scheduler.placement_timeout)
            .await?;
    docker_api::constrain_service_to_node(swarm, data.service_name.as_str(), &docker_node_id).await?;

    if docker_api::find_service(swarm, &data.proxy_service_name)
        .await?
        .is_none()
    {
        let spec = specs::proxy_spec(
            data,
            &ctx.config,
            &swarm_network.id,
            &sidecar_network_id,
            &docker_node_id,
        );
        docker_api::create_service_and_get_id(swarm, &spec).await?;
    }

    let ds = &mut data.dynamic_sidecar;
    ds.dynamic_sidecar_id = Some(sidecar_id);
    ds.dynamic_sidecar_network_id = Some(sidecar_network_id);
    ds.swarm_network_id = Some(swarm_network.id);
    ds.swarm_network_name = Some(swarm_network.name);
    ds.docker_node_id = Some(docker_node_id);
    ds.was_dynamic_sidecar_started = true;
    Ok(())
}

// =============================================================================
// Sidecar health
// =============================================================================

async fn wait_for_sidecar_api(ctx: &SchedulerContext, data: &mut SchedulerData) -> SchedulerResult<()> {
    let endpoint = data.endpoint();
    let sidecar = ctx.sidecar.as_ref();
    let policy = BackoffPolicy::fixed(HEALTH_POLL_INTERVAL);

    let result: Result<(), RetryError<SidecarError>> =
        retry_until(&policy, ctx.config.scheduler.startup_timeout, |_| {
            let endpoint = endpoint.as_str();
            async move {
                match sidecar.is_healthy(endpoint).await {
                    Ok(true) => Attempt::Ready(()),
                    Ok(false) => Attempt::TryAgain("sidecar reports unhealthy".to_string()),
                    Err(e) => Attempt::TryAgain(e.to_string()),
                }
            }
        })
        .await;

    match result {
        Ok(()) => {
            debug!(service_name = %data.service_name, "Sidecar API is up");
            data.dynamic_sidecar.is_ready = true;
            Ok(())
        }
        Err(e) => Err(SchedulerError::SidecarNotReady {
            service_name: data.service_name.clone(),
            reason: e.to_string(),
        }),
    }
}

async fn update_health(ctx: &SchedulerContext, data: &mut SchedulerData) -> SchedulerResult<()> {
    let is_ready = match ctx.sidecar.is_healthy(&data.endpoint()).await {
        Ok(healthy) => healthy,
        Err(e) => {
            debug!(service_name = %data.service_name, error = %e, "Health check failed");
            false
        }
    };
    if data.dynamic_sidecar.is_ready && !is_ready {
        warn!(service_name = %data.service_name, "Sidecar is no longer healthy");
    }
    data.dynamic_sidecar.is_ready = is_ready;
    Ok(())
}

// =============================================================================
// Container status
// =============================================================================

async fn get_status(ctx: &SchedulerContext, data: &mut SchedulerData) -> SchedulerResult<()> {
    let tolerance = ctx.config.scheduler.network_error_tolerance;
    let inspected = ctx.sidecar.containers_inspect(&data.endpoint()).await;
    let ds = &mut data.dynamic_sidecar;

    match inspected {
        Ok(containers) => {
            ds.inspect_error_handler.reset();
            ds.containers_inspect = containers;
        }
        Err(e) => {
            if !ds.containers_inspect.is_empty() {
                ds.inspect_error_handler.try_to_raise(e, tolerance)?;
            } else {
                warn!(service_name = %data.service_name, error = %e, "Could not inspect containers yet");
            }
            return Ok(());
        }
    }

    let unexpected: Vec<String> = ds
        .containers_inspect
        .iter()
        .filter(|c| !c.is_expected())
        .map(|c| format!("{}: {:?}", c.name, c.status))
        .collect();
    if !unexpected.is_empty() {
        return Err(SchedulerError::UnexpectedContainerStatus(unexpected.join(", ")));
    }
    Ok(())
}

// =============================================================================
// Environment
// =============================================================================

#[instrument(skip_all, fields(service_name = %data.service_name))]
async fn prepare_environment(ctx: &SchedulerContext, data: &mut SchedulerData) -> SchedulerResult<()> {
    if data.dynamic_sidecar.compose_spec_submitted() {
        // recovered instance whose containers already run
        data.dynamic_sidecar.is_service_environment_ready = true;
        return Ok(());
    }

    let endpoint = data.endpoint();
    let sidecar = ctx.sidecar.as_ref();

    let volume_status = if data.dynamic_sidecar.service_removal_state.can_save {
        VolumeStatus::ContentNeedsToBeSaved
    } else {
        VolumeStatus::ContentNoSaveRequired
    };
    tokio::try_join!(
        sidecar.update_volume_state(&endpoint, VolumeCategory::States, volume_status),
        sidecar.update_volume_state(&endpoint, VolumeCategory::Outputs, volume_status),
    )?;

    sidecar.pull_user_services_images(&endpoint).await?;

    let restore_state = !ctx.config.scheduler.rclone_mounts_enabled;
    let transfers = async {
        let (outputs, state) = tokio::try_join!(sidecar.pull_service_output_ports(&endpoint), async {
            if restore_state {
                sidecar.restore_service_state(&endpoint).await
            } else {
                Ok(0)
            }
        })?;
        Ok::<_, SchedulerError>(outputs + state)
    };
    let transferred = ctx
        .with_node_rights(
            &data.service_name,
            data.dynamic_sidecar.docker_node_id.as_deref(),
            transfers,
        )
        .await?;
    let Some(transferred) = transferred else {
        return Ok(());
    };
    info!(transferred_bytes = transferred, "Restored outputs and state");

    let port_keys = specs::output_port_keys(&data.service_labels);
    sidecar.create_output_dirs(&endpoint, &port_keys).await?;

    data.dynamic_sidecar.is_service_environment_ready = true;
    Ok(())
}

// =============================================================================
// User services
// =============================================================================

async fn wait_for_entrypoint(ctx: &SchedulerContext, data: &SchedulerData) -> SchedulerResult<String> {
    let endpoint = data.endpoint();
    let network = data.dynamic_sidecar_network_name.as_str();
    let sidecar = ctx.sidecar.as_ref();
    let timeout = ctx.config.scheduler.entrypoint_timeout;

    retry_until(&BackoffPolicy::fixed(ENTRYPOINT_POLL_INTERVAL), timeout, |_| {
        let endpoint = endpoint.as_str();
        async move {
            match sidecar.entrypoint_container_name(endpoint, network).await {
                Ok(Some(name)) => Attempt::Ready(name),
                Ok(None) => Attempt::TryAgain("entrypoint container not reported yet".to_string()),
                Err(e) => Attempt::Failed(e),
            }
        }
    })
    .await
    .map_err(|e| match e {
        RetryError::Failed(e) => e.into(),
        RetryError::Exhausted { .. } => SchedulerError::EntrypointNotFound {
            service_name: data.service_name.clone(),
            timeout,
        },
    })
}

#[instrument(skip_all, fields(service_name = %data.service_name))]
async fn create_user_services(ctx: &SchedulerContext, data: &mut SchedulerData) -> SchedulerResult<()> {
    let ds = &data.dynamic_sidecar;
    let sidecar_network_id = ds
        .dynamic_sidecar_network_id
        .clone()
        .ok_or_else(|| missing("dynamic_sidecar_network_id", data))?;
    let swarm_network_id = ds
        .swarm_network_id
        .clone()
        .ok_or_else(|| missing("swarm_network_id", data))?;
    let docker_node_id = ds
        .docker_node_id
        .clone()
        .ok_or_else(|| missing("docker_node_id", data))?;

    let endpoint = data.endpoint();
    let compose_spec = specs::assemble_compose_spec(data, &ctx.config)?;
    ctx.sidecar.create_containers(&endpoint, &compose_spec).await?;
    ctx.sidecar.set_outputs_watcher(&endpoint, true).await?;

    let entrypoint = wait_for_entrypoint(ctx, data).await?;
    debug!(entrypoint = %entrypoint, "Entrypoint container is up");

    let swarm = ctx.swarm();
    if docker_api::find_service(swarm, &data.proxy_service_name)
        .await?
        .is_none()
    {
        warn!("Proxy service is missing, recreating it");
        let spec = specs::proxy_spec(data, &ctx.config, &swarm_network_id, &sidecar_network_id, &docker_node_id);
        docker_api::create_service_and_get_id(swarm, &spec).await?;
    }
    let service_port = data.service_port;
    docker_api::update_service_spec(swarm, &data.proxy_service_name, |spec| {
        specs::route_proxy_to(spec, &entrypoint, service_port)
    })
    .await?;

    data.dynamic_sidecar.were_containers_created = true;
    data.dynamic_sidecar.was_compose_spec_submitted = true;
    Ok(())
}

// =============================================================================
// Project networks
// =============================================================================

/// Attach every known container of the instance to a project network.
pub(crate) async fn attach_containers(
    ctx: &SchedulerContext,
    data: &SchedulerData,
    network_id: &str,
    alias: &str,
) -> SchedulerResult<()> {
    let endpoint = data.endpoint();
    let aliases = [alias.to_string()];
    for container in &data.dynamic_sidecar.containers_inspect {
        ctx.sidecar
            .attach_container_to_network(&endpoint, &container.id, network_id, &aliases)
            .await?;
    }
    Ok(())
}

pub(crate) async fn detach_containers(
    ctx: &SchedulerContext,
    data: &SchedulerData,
    network_id: &str,
) -> SchedulerResult<()> {
    let endpoint = data.endpoint();
    for container in &data.dynamic_sidecar.containers_inspect {
        ctx.sidecar
            .detach_container_from_network(&endpoint, &container.id, network_id)
            .await?;
    }
    Ok(())
}

async fn attach_project_networks(ctx: &SchedulerContext, data: &mut SchedulerData) -> SchedulerResult<()> {
    let networks = ctx.projects.projects_networks(data.project_id).await?;
    let wanted: BTreeMap<String, String> = networks
        .into_iter()
        .filter_map(|(network, aliases)| {
            aliases
                .get(&data.instance_id)
                .map(|alias| (network, alias.clone()))
        })
        .collect();

    if !wanted.is_empty() {
        let names: Vec<String> = wanted.keys().cloned().collect();
        let ids = docker_api::get_or_create_networks_ids(ctx.swarm(), &names, data.project_id).await?;
        for (network, alias) in &wanted {
            if let Some(network_id) = ids.get(network) {
                attach_containers(ctx, data, network_id, alias).await?;
                debug!(service_name = %data.service_name, network = %network, alias = %alias, "Attached project network");
            }
        }
    }

    data.dynamic_sidecar.is_project_network_attached = true;
    Ok(())
}

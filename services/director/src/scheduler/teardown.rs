//! Ordered removal of an instance and everything it created.

use tracing::{debug, error, info, instrument, warn};

use super::context::SchedulerContext;
use crate::docker_api;
use crate::error::{SchedulerError, SchedulerResult};
use crate::instrumentation::{InstrumentationEvent, Metric};
use crate::models::SchedulerData;
use crate::sidecar::{VolumeCategory, VolumeStatus};
use crate::specs::VolumeRemoval;
use crate::volumes::VolumePathsResolver;

/// Stop the user containers. Failures are logged, teardown carries on.
pub(crate) async fn remove_service_containers(ctx: &SchedulerContext, data: &SchedulerData) {
    if let Err(e) = ctx.sidecar.stop_service(&data.endpoint()).await {
        warn!(service_name = %data.service_name, error = %e, "Could not stop user services");
    }
}

pub(crate) async fn save_service_state(ctx: &SchedulerContext, data: &SchedulerData) -> SchedulerResult<()> {
    let endpoint = data.endpoint();
    let transferred = ctx.sidecar.save_service_state(&endpoint).await?;
    ctx.sidecar
        .update_volume_state(&endpoint, VolumeCategory::States, VolumeStatus::ContentWasSaved)
        .await?;
    debug!(service_name = %data.service_name, transferred_bytes = transferred, "Saved state");
    Ok(())
}

pub(crate) async fn push_service_outputs(ctx: &SchedulerContext, data: &SchedulerData) -> SchedulerResult<()> {
    let endpoint = data.endpoint();
    ctx.sidecar.push_service_output_ports(&endpoint).await?;
    ctx.sidecar
        .update_volume_state(&endpoint, VolumeCategory::Outputs, VolumeStatus::ContentWasSaved)
        .await?;
    debug!(service_name = %data.service_name, "Pushed outputs");
    Ok(())
}

async fn save_state_and_outputs(ctx: &SchedulerContext, data: &SchedulerData) -> SchedulerResult<()> {
    if let Err(e) = ctx.sidecar.free_reserved_disk_space(&data.endpoint()).await {
        warn!(service_name = %data.service_name, error = %e, "Could not free reserved disk space");
    }

    let save_state = async {
        if ctx.config.scheduler.rclone_mounts_enabled {
            return Ok(());
        }
        save_service_state(ctx, data).await
    };
    tokio::try_join!(push_service_outputs(ctx, data), save_state)?;
    Ok(())
}

async fn remove_volumes(ctx: &SchedulerContext, data: &SchedulerData) -> SchedulerResult<()> {
    let Some(docker_node_id) = data.dynamic_sidecar.docker_node_id.clone() else {
        debug!(service_name = %data.service_name, "Sidecar never got a node, no volumes to remove");
        return Ok(());
    };
    let removal = VolumeRemoval {
        swarm_stack_name: ctx.config.swarm_stack_name.clone(),
        docker_node_id,
        volume_names: VolumePathsResolver::all_sources(
            &data.paths_mapping.volume_paths(),
            data.instance_id,
            data.run_id,
        ),
    };
    if !docker_api::remove_volumes_from_node(ctx.swarm(), &removal).await? {
        warn!(
            service_name = %data.service_name,
            node = %removal.docker_node_id,
            "Volumes were left behind on the node"
        );
    }
    Ok(())
}

async fn remove_unused_project_networks(ctx: &SchedulerContext, data: &SchedulerData) -> SchedulerResult<()> {
    let networks = docker_api::get_projects_networks_containers(ctx.swarm(), data.project_id).await?;
    for (network, containers) in networks {
        if containers == 0 {
            docker_api::try_to_remove_network(ctx.swarm(), &network).await;
        }
    }
    Ok(())
}

/// Tear the instance down: containers, data, services, network, volumes.
///
/// When saving is required and fails, the manual-intervention latch is set
/// and nothing further is removed, so an operator can still recover the data.
/// When the node has no free slot for the save, the teardown returns early and
/// resumes on a later cycle.
#[instrument(skip_all, fields(service_name = %data.service_name))]
pub(crate) async fn remove_marked_instance(ctx: &SchedulerContext, data: &mut SchedulerData) -> SchedulerResult<()> {
    let swarm = ctx.swarm();
    let removal_state = data.dynamic_sidecar.service_removal_state;

    remove_service_containers(ctx, data).await;
    tokio::time::sleep(ctx.config.scheduler.wait_after_containers_removal).await;

    let in_workbench = ctx
        .projects
        .is_node_present_in_workbench(data.project_id, data.instance_id)
        .await?;
    let must_save = removal_state.can_save && in_workbench && data.dynamic_sidecar.were_containers_created;

    if must_save && !data.dynamic_sidecar.were_state_and_outputs_saved {
        let saved = ctx
            .with_node_rights(
                &data.service_name,
                data.dynamic_sidecar.docker_node_id.as_deref(),
                save_state_and_outputs(ctx, data),
            )
            .await;
        match saved {
            Ok(Some(())) => {
                info!("Saved state and outputs");
                data.dynamic_sidecar.were_state_and_outputs_saved = true;
            }
            Ok(None) => {
                info!("Node is busy, teardown resumes on a later cycle");
                return Ok(());
            }
            Err(e @ SchedulerError::NodeRights(_)) => return Err(e),
            Err(e) => {
                error!(
                    error = %e,
                    "Could not save state and outputs, waiting for manual intervention"
                );
                data.dynamic_sidecar.wait_for_manual_intervention_after_error = true;
                return Err(e);
            }
        }
    }

    docker_api::remove_sidecar_stack(swarm, ctx.stack(), data.instance_id).await?;
    if !docker_api::remove_sidecar_network(swarm, &data.dynamic_sidecar_network_name).await {
        warn!(network = %data.dynamic_sidecar_network_name, "Sidecar network left behind");
    }

    if !must_save || data.dynamic_sidecar.were_state_and_outputs_saved {
        remove_volumes(ctx, data).await?;
    }

    remove_unused_project_networks(ctx, data).await?;

    data.dynamic_sidecar.service_removal_state.mark_removed();
    ctx.events
        .publish(InstrumentationEvent::new(Metric::ServiceStopped, data))
        .await;
    info!("Removed instance");
    Ok(())
}

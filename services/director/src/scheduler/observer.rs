//! One observation cycle of one instance.

use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::registry::Inner;
use super::events::{Rule, PIPELINE};
use crate::docker_api;
use crate::error::{create_error_code, SchedulerResult};
use crate::models::{SchedulerData, ServiceName};

#[instrument(skip(inner), fields(service_name = %service_name))]
pub(super) async fn observe(inner: &Inner, service_name: &ServiceName) {
    let Some((mut data, mut epoch)) = inner.snapshot(service_name).await else {
        return;
    };

    if data.dynamic_sidecar.wait_for_manual_intervention_after_error {
        await_manual_intervention(inner, &mut data, &mut epoch).await;
        return;
    }

    // only persisted fields take part in the comparison
    let label_before = data.as_label_data().ok();

    if let Err(e) = apply_cycle(inner, &mut data, &mut epoch).await {
        let message = e.to_string();
        let error_code = create_error_code(&message);
        error!(error = %e, error_code = %error_code, "Unexpected error while observing instance");
        data.dynamic_sidecar
            .status
            .update_failing_status(&message, Some(&error_code));
        if !inner.commit(service_name, &mut data, &mut epoch).await {
            return;
        }
    }

    if data.dynamic_sidecar.service_removal_state.was_removed {
        inner.remove_from_registry(service_name).await;
        return;
    }

    if data.as_label_data().ok() != label_before {
        if let Err(e) = docker_api::update_scheduler_data_label(inner.ctx.swarm(), &data).await {
            warn!(error = %e, "Skipped scheduler data label update");
        }
    }
}

async fn apply_cycle(inner: &Inner, data: &mut SchedulerData, epoch: &mut u64) -> SchedulerResult<()> {
    let ctx = inner.ctx.as_ref();
    let service_name = data.service_name.clone();
    let ds = &data.dynamic_sidecar;

    if ds.were_containers_created
        && !ds.service_removal_state.was_removed
        && !docker_api::are_sidecar_and_proxy_services_present(ctx.swarm(), ctx.stack(), data.instance_id).await?
    {
        warn!("Sidecar or proxy disappeared, removing the instance");
        data.dynamic_sidecar.service_removal_state.mark_to_remove(false);
        let result = Rule::RemoveMarkedInstance.action(ctx, data).await;
        inner.commit(&service_name, data, epoch).await;
        return result;
    }

    for rule in PIPELINE {
        if !rule.will_trigger(data) {
            continue;
        }
        debug!(rule = rule.name(), "Applying rule");
        let result = rule.action(ctx, data).await;
        if !inner.commit(&service_name, data, epoch).await {
            debug!("Instance is no longer tracked, ending cycle");
            return Ok(());
        }
        result?;
    }
    Ok(())
}

/// A latched instance is left alone until an operator resets it. The only
/// automated step is dropping it once its stack has been removed by hand.
async fn await_manual_intervention(inner: &Inner, data: &mut SchedulerData, epoch: &mut u64) {
    let ctx = inner.ctx.as_ref();
    let service_name = data.service_name.clone();
    let ds = &mut data.dynamic_sidecar;

    if !ds.wait_for_manual_intervention_logged {
        ds.wait_for_manual_intervention_logged = true;
        warn!(
            status = %ds.status.info,
            "Instance needs manual intervention; remove its stack or reset its status"
        );
    }

    let check_every = ctx.config.scheduler.manual_intervention_check;
    let due = ds
        .manual_intervention_checked_at
        .is_none_or(|at| at.elapsed() >= check_every);
    if !due {
        inner.commit(&service_name, data, epoch).await;
        return;
    }
    ds.manual_intervention_checked_at = Some(Instant::now());
    if !inner.commit(&service_name, data, epoch).await {
        return;
    }

    match docker_api::is_sidecar_stack_missing(ctx.swarm(), ctx.stack(), data.instance_id).await {
        Ok(true) => {
            info!("Stack was removed by an operator, no longer tracking the instance");
            inner.remove_from_registry(&service_name).await;
        }
        Ok(false) => {}
        Err(e) => warn!(error = %e, "Could not check whether the stack still exists"),
    }
}

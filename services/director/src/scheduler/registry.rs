use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard};

use chrono::Utc;
use dynsched_id::{InstanceId, ProjectId, UserId};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::context::SchedulerContext;
use super::worker::{Dispatcher, Ticker};
use super::{events, observer, teardown};
use crate::cleanup::VolumeRemovalJanitor;
use crate::docker_api::{self, ServiceState, StackStatus};
use crate::error::{SchedulerError, SchedulerResult};
use crate::models::{labels, RestartPolicy, SchedulerData, ServiceName};

#[derive(Debug, Clone)]
struct TrackedService {
    data: SchedulerData,
    /// Bumped by every operator mutation, so a reconciliation that started
    /// from an older snapshot knows to pick those changes up.
    epoch: u64,
}

#[derive(Default)]
struct Registry {
    to_observe: HashMap<ServiceName, TrackedService>,
    inverse: HashMap<InstanceId, ServiceName>,
}

enum Observation {
    Running { token: u64, handle: JoinHandle<()> },
    Disabled,
}

pub(super) struct Inner {
    pub(super) ctx: Arc<SchedulerContext>,
    registry: Mutex<Registry>,
    observations: std::sync::Mutex<HashMap<ServiceName, Observation>>,
    next_token: AtomicU64,
    queue: mpsc::UnboundedSender<ServiceName>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<ServiceName>>>,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

/// Operator-owned fields win over whatever a stale reconciliation computed.
fn absorb_external_changes(task: &mut SchedulerData, current: &SchedulerData) {
    let ds = &mut task.dynamic_sidecar;
    let ext = &current.dynamic_sidecar;
    ds.service_removal_state = ds
        .service_removal_state
        .merged_with(&ext.service_removal_state);
    ds.status = ext.status.clone();
    ds.wait_for_manual_intervention_after_error = ext.wait_for_manual_intervention_after_error;
    ds.wait_for_manual_intervention_logged = ext.wait_for_manual_intervention_logged;
    ds.manual_intervention_checked_at = ext.manual_intervention_checked_at;
    if ds.instrumentation.close_requested_at.is_none() {
        ds.instrumentation.close_requested_at = ext.instrumentation.close_requested_at;
    }
}

/// Removes the observation entry when the task ends, however it ends.
struct ObservationGuard {
    inner: Arc<Inner>,
    service_name: ServiceName,
    token: u64,
}

impl Drop for ObservationGuard {
    fn drop(&mut self) {
        let mut observations = self.inner.observations();
        if matches!(
            observations.get(&self.service_name),
            Some(Observation::Running { token, .. }) if *token == self.token
        ) {
            observations.remove(&self.service_name);
        }
    }
}

async fn observe_task(inner: Arc<Inner>, service_name: ServiceName, token: u64) {
    let _guard = ObservationGuard {
        inner: Arc::clone(&inner),
        service_name: service_name.clone(),
        token,
    };
    observer::observe(&inner, &service_name).await;
}

impl Inner {
    fn observations(&self) -> MutexGuard<'_, HashMap<ServiceName, Observation>> {
        // the map stays consistent even if a holder panicked
        self.observations.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(super) fn enqueue(&self, service_name: ServiceName) {
        if self.queue.send(service_name).is_err() {
            debug!("Scheduler queue is closed");
        }
    }

    pub(super) async fn tracked_names(&self) -> Vec<ServiceName> {
        self.registry.lock().await.to_observe.keys().cloned().collect()
    }

    /// Start a reconciliation unless one is running or observation is off.
    pub(super) fn dispatch(self: &Arc<Self>, service_name: ServiceName) {
        let mut observations = self.observations();
        match observations.get(&service_name) {
            Some(Observation::Running { .. }) => {
                debug!(service_name = %service_name, "Reconciliation in flight, skipping");
                return;
            }
            Some(Observation::Disabled) => {
                debug!(service_name = %service_name, "Observation disabled, skipping");
                return;
            }
            None => {}
        }

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        // the entry is inserted before the guard of a fast task can look for it
        let handle = tokio::spawn(observe_task(Arc::clone(self), service_name.clone(), token));
        observations.insert(service_name, Observation::Running { token, handle });
    }

    pub(super) async fn snapshot(&self, service_name: &ServiceName) -> Option<(SchedulerData, u64)> {
        self.registry
            .lock()
            .await
            .to_observe
            .get(service_name)
            .map(|t| (t.data.clone(), t.epoch))
    }

    /// Write a reconciliation's progress back. Returns false once the
    /// instance is no longer tracked.
    pub(super) async fn commit(
        &self,
        service_name: &ServiceName,
        data: &mut SchedulerData,
        epoch: &mut u64,
    ) -> bool {
        let mut registry = self.registry.lock().await;
        let Some(tracked) = registry.to_observe.get_mut(service_name) else {
            return false;
        };
        if tracked.epoch != *epoch {
            absorb_external_changes(data, &tracked.data);
            *epoch = tracked.epoch;
        }
        tracked.data = data.clone();
        true
    }

    pub(super) async fn remove_from_registry(&self, service_name: &ServiceName) {
        {
            let mut registry = self.registry.lock().await;
            if let Some(tracked) = registry.to_observe.remove(service_name) {
                registry.inverse.remove(&tracked.data.instance_id);
            }
        }
        let mut observations = self.observations();
        if matches!(observations.get(service_name), Some(Observation::Disabled)) {
            observations.remove(service_name);
        }
        info!(service_name = %service_name, "Stopped tracking instance");
    }

    /// Abort the in-flight reconciliation, waiting a bounded time for it.
    async fn cancel_observation(&self, service_name: &ServiceName) {
        let handle = {
            let mut observations = self.observations();
            match observations.remove(service_name) {
                Some(Observation::Running { handle, .. }) => handle,
                Some(Observation::Disabled) => {
                    observations.insert(service_name.clone(), Observation::Disabled);
                    return;
                }
                None => return,
            }
        };

        handle.abort();
        let timeout = self.ctx.config.scheduler.task_cancel_timeout;
        if tokio::time::timeout(timeout, handle).await.is_err() {
            warn!(
                service_name = %service_name,
                timeout_secs = timeout.as_secs(),
                "Reconciliation did not stop in time"
            );
        }
    }

    /// Apply an operator mutation and return the new state.
    async fn mutate<F>(&self, service_name: &ServiceName, instance_id: InstanceId, change: F) -> SchedulerResult<SchedulerData>
    where
        F: FnOnce(&mut SchedulerData),
    {
        let mut registry = self.registry.lock().await;
        let tracked = registry
            .to_observe
            .get_mut(service_name)
            .ok_or(SchedulerError::NotFound(instance_id))?;
        change(&mut tracked.data);
        tracked.epoch += 1;
        Ok(tracked.data.clone())
    }
}

/// Tracks instances and drives each one through the rule pipeline.
///
/// Every tracked instance is reconciled by at most one task at a time. The
/// ticker enqueues all instances each interval; operator actions enqueue the
/// instance they touched.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(ctx: SchedulerContext) -> Self {
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                ctx: Arc::new(ctx),
                registry: Mutex::new(Registry::default()),
                observations: std::sync::Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(0),
                queue,
                queue_rx: Mutex::new(Some(queue_rx)),
                shutdown,
                loops: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.inner.ctx
    }

    async fn name_of(&self, instance_id: InstanceId) -> SchedulerResult<ServiceName> {
        self.inner
            .registry
            .lock()
            .await
            .inverse
            .get(&instance_id)
            .cloned()
            .ok_or(SchedulerError::NotFound(instance_id))
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Start tracking an instance. Adding an instance that is already tracked
    /// under the same name is a no-op.
    #[instrument(skip(self, data), fields(service_name = %data.service_name))]
    pub async fn add(&self, data: SchedulerData) -> SchedulerResult<()> {
        let service_name = data.service_name.clone();
        {
            let mut registry = self.inner.registry.lock().await;
            if let Some(existing) = registry.inverse.get(&data.instance_id) {
                if *existing == service_name {
                    warn!("Instance is already tracked");
                    return Ok(());
                }
                return Err(SchedulerError::NameCollision {
                    instance_id: data.instance_id,
                    existing: existing.clone(),
                    requested: service_name,
                });
            }
            if let Some(other) = registry.to_observe.get(&service_name) {
                return Err(SchedulerError::NameCollision {
                    instance_id: other.data.instance_id,
                    existing: service_name.clone(),
                    requested: service_name,
                });
            }
            registry.inverse.insert(data.instance_id, service_name.clone());
            registry
                .to_observe
                .insert(service_name.clone(), TrackedService { data, epoch: 0 });
        }
        info!("Tracking instance");
        self.inner.enqueue(service_name);
        Ok(())
    }

    pub async fn get(&self, instance_id: InstanceId) -> SchedulerResult<SchedulerData> {
        let registry = self.inner.registry.lock().await;
        registry
            .inverse
            .get(&instance_id)
            .and_then(|name| registry.to_observe.get(name))
            .map(|t| t.data.clone())
            .ok_or(SchedulerError::NotFound(instance_id))
    }

    pub async fn list(&self, user_id: Option<UserId>, project_id: Option<ProjectId>) -> Vec<SchedulerData> {
        let registry = self.inner.registry.lock().await;
        let mut found: Vec<SchedulerData> = registry
            .to_observe
            .values()
            .map(|t| &t.data)
            .filter(|d| user_id.is_none_or(|u| d.user_id == u))
            .filter(|d| project_id.is_none_or(|p| d.project_id == p))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        found
    }

    pub async fn is_service_tracked(&self, instance_id: InstanceId) -> bool {
        self.inner
            .registry
            .lock()
            .await
            .inverse
            .contains_key(&instance_id)
    }

    /// Forget an instance. Only the teardown does this, once removal is complete.
    pub async fn remove_from_registry(&self, instance_id: InstanceId) -> SchedulerResult<()> {
        let service_name = self.name_of(instance_id).await?;
        self.inner.remove_from_registry(&service_name).await;
        Ok(())
    }

    // =========================================================================
    // Operator actions
    // =========================================================================

    /// Request teardown. Cancels the running reconciliation so the removal is
    /// picked up on the next cycle.
    #[instrument(skip(self))]
    pub async fn mark_for_removal(
        &self,
        instance_id: InstanceId,
        can_save: bool,
        skip_observation_recreation: bool,
    ) -> SchedulerResult<()> {
        let service_name = self.name_of(instance_id).await?;
        self.inner.cancel_observation(&service_name).await;

        let data = self
            .inner
            .mutate(&service_name, instance_id, |data| {
                let ds = &mut data.dynamic_sidecar;
                if ds.service_removal_state.was_removed {
                    return;
                }
                ds.service_removal_state.mark_to_remove(can_save);
                ds.instrumentation.close_requested_at.get_or_insert_with(Utc::now);
            })
            .await?;
        if data.dynamic_sidecar.service_removal_state.was_removed {
            debug!(service_name = %service_name, "Instance was already removed");
            return Ok(());
        }

        docker_api::update_scheduler_data_label(self.inner.ctx.swarm(), &data).await?;
        info!(service_name = %service_name, can_save, "Marked for removal");

        if !skip_observation_recreation {
            self.inner.enqueue(service_name);
        }
        Ok(())
    }

    /// Turn periodic observation on or off. Returns false, changing nothing,
    /// while a reconciliation is in flight.
    pub async fn toggle_observation(&self, instance_id: InstanceId, disable: bool) -> SchedulerResult<bool> {
        let service_name = self.name_of(instance_id).await?;
        let mut observations = self.inner.observations();
        if matches!(observations.get(&service_name), Some(Observation::Running { .. })) {
            return Ok(false);
        }
        if disable {
            observations.insert(service_name, Observation::Disabled);
        } else {
            observations.remove(&service_name);
        }
        Ok(true)
    }

    pub async fn is_service_awaiting_manual_intervention(&self, instance_id: InstanceId) -> SchedulerResult<bool> {
        Ok(self
            .get(instance_id)
            .await?
            .dynamic_sidecar
            .is_awaiting_manual_intervention())
    }

    /// Clear a failure and the manual-intervention latch so the pipeline
    /// resumes.
    #[instrument(skip(self))]
    pub async fn reset_status(&self, instance_id: InstanceId) -> SchedulerResult<()> {
        let service_name = self.name_of(instance_id).await?;
        self.inner.cancel_observation(&service_name).await;

        let data = self
            .inner
            .mutate(&service_name, instance_id, |data| {
                let ds = &mut data.dynamic_sidecar;
                ds.status.update_ok_status("");
                ds.wait_for_manual_intervention_after_error = false;
                ds.wait_for_manual_intervention_logged = false;
                ds.manual_intervention_checked_at = None;
            })
            .await?;
        docker_api::update_scheduler_data_label(self.inner.ctx.swarm(), &data).await?;
        info!(service_name = %service_name, "Status reset by operator");

        self.inner.enqueue(service_name);
        Ok(())
    }

    pub async fn get_stack_status(&self, instance_id: InstanceId) -> SchedulerResult<StackStatus> {
        let data = self.get(instance_id).await?;
        let ds = &data.dynamic_sidecar;
        if !ds.status.is_ok() {
            return Ok(StackStatus {
                state: ServiceState::Failed,
                message: ds.status.info.clone(),
            });
        }
        if !ds.was_dynamic_sidecar_started {
            return Ok(StackStatus {
                state: ServiceState::Pending,
                message: "waiting for the stack to be created".to_string(),
            });
        }

        let mut status = docker_api::get_stack_status(self.inner.ctx.swarm(), data.service_name.as_str()).await?;
        if status.state == ServiceState::Running && !ds.are_containers_running() {
            status = StackStatus {
                state: ServiceState::Starting,
                message: "user services are starting".to_string(),
            };
        }
        Ok(status)
    }

    // =========================================================================
    // Data and containers
    // =========================================================================

    /// Pull input ports, restarting the containers afterwards when the
    /// instance asks for it. Returns the bytes transferred.
    pub async fn retrieve_service_inputs(
        &self,
        instance_id: InstanceId,
        port_keys: Option<Vec<String>>,
    ) -> SchedulerResult<u64> {
        let data = self.get(instance_id).await?;
        let ctx = &self.inner.ctx;
        let endpoint = data.endpoint();

        let transferred = ctx
            .sidecar
            .pull_service_input_ports(&endpoint, port_keys.as_deref())
            .await?;
        if data.restart_policy == RestartPolicy::OnInputsDownloaded {
            info!(service_name = %data.service_name, "Restarting containers after inputs download");
            ctx.sidecar.restart_containers(&endpoint).await?;
        }
        Ok(transferred)
    }

    pub async fn restart_containers(&self, instance_id: InstanceId) -> SchedulerResult<()> {
        let data = self.get(instance_id).await?;
        self.inner.ctx.sidecar.restart_containers(&data.endpoint()).await?;
        Ok(())
    }

    pub async fn attach_project_network(
        &self,
        instance_id: InstanceId,
        network_name: &str,
        alias: &str,
    ) -> SchedulerResult<()> {
        let data = self.get(instance_id).await?;
        let ctx = &self.inner.ctx;
        let ids = docker_api::get_or_create_networks_ids(ctx.swarm(), &[network_name.to_string()], data.project_id)
            .await?;
        if let Some(network_id) = ids.get(network_name) {
            events::attach_containers(ctx, &data, network_id, alias).await?;
        }
        Ok(())
    }

    pub async fn detach_project_network(&self, instance_id: InstanceId, network_name: &str) -> SchedulerResult<()> {
        let data = self.get(instance_id).await?;
        let ctx = &self.inner.ctx;
        let network = match ctx.swarm.inspect_network(network_name).await {
            Ok(network) => network,
            Err(e) if e.is_not_found() => {
                debug!(network = %network_name, "Network is gone, nothing to detach");
                return Ok(());
            }
            Err(e) => return Err(docker_api::DockerApiError::from(e).into()),
        };
        events::detach_containers(ctx, &data, &network.id).await
    }

    pub async fn save_service_state(&self, instance_id: InstanceId) -> SchedulerResult<()> {
        let data = self.get(instance_id).await?;
        teardown::save_service_state(&self.inner.ctx, &data).await
    }

    pub async fn push_service_outputs(&self, instance_id: InstanceId) -> SchedulerResult<()> {
        let data = self.get(instance_id).await?;
        teardown::push_service_outputs(&self.inner.ctx, &data).await
    }

    pub async fn remove_service_containers(&self, instance_id: InstanceId) -> SchedulerResult<()> {
        let data = self.get(instance_id).await?;
        teardown::remove_service_containers(&self.inner.ctx, &data).await;
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Re-adopt the instances whose sidecars this stack still runs.
    pub async fn rediscover(&self) -> SchedulerResult<usize> {
        let ctx = &self.inner.ctx;
        let services = docker_api::list_sidecar_services(ctx.swarm(), ctx.stack(), None, None).await?;

        let mut recovered = 0;
        for service in services {
            let Some(raw) = service.spec.labels.get(labels::SCHEDULER_DATA) else {
                warn!(service = %service.spec.name, "Sidecar has no scheduler data label, ignoring it");
                continue;
            };
            let data = match SchedulerData::from_label_data(raw) {
                Ok(data) => data,
                Err(e) => {
                    warn!(service = %service.spec.name, error = %e, "Unreadable scheduler data label, ignoring it");
                    continue;
                }
            };
            match self.add(data).await {
                Ok(()) => recovered += 1,
                Err(e) => warn!(service = %service.spec.name, error = %e, "Could not re-adopt sidecar"),
            }
        }
        Ok(recovered)
    }

    /// Re-adopt running sidecars and start the background loops.
    pub async fn start(&self) -> SchedulerResult<()> {
        let recovered = self.rediscover().await?;
        info!(recovered, "Recovered instances from the cluster");

        let mut loops = self.inner.loops.lock().await;
        let Some(queue_rx) = self.inner.queue_rx.lock().await.take() else {
            warn!("Scheduler was already started");
            return Ok(());
        };
        let config = &self.inner.ctx.config;

        let ticker = Ticker::new(Arc::clone(&self.inner), config.scheduler.interval);
        let shutdown = self.inner.shutdown.subscribe();
        loops.push(tokio::spawn(async move { ticker.run(shutdown).await }));

        let dispatcher = Dispatcher::new(Arc::clone(&self.inner), queue_rx);
        let shutdown = self.inner.shutdown.subscribe();
        loops.push(tokio::spawn(async move { dispatcher.run(shutdown).await }));

        let janitor = VolumeRemovalJanitor::new(
            Arc::clone(&self.inner.ctx.swarm),
            config.swarm_stack_name.clone(),
            config.janitor_interval,
        );
        let shutdown = self.inner.shutdown.subscribe();
        loops.push(tokio::spawn(async move { janitor.run(shutdown).await }));

        Ok(())
    }

    /// Stop the loops, then give in-flight reconciliations a bounded time to
    /// finish before aborting them.
    pub async fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
        let timeout = self.inner.ctx.config.scheduler.shutdown_timeout;

        let loops = std::mem::take(&mut *self.inner.loops.lock().await);
        for handle in loops {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!("Scheduler loop did not stop in time");
            }
        }

        let running: Vec<JoinHandle<()>> = {
            let mut observations = self.inner.observations();
            let (running, idle): (Vec<_>, Vec<_>) = observations
                .drain()
                .partition(|(_, o)| matches!(o, Observation::Running { .. }));
            observations.extend(idle);
            running
                .into_iter()
                .filter_map(|(_, o)| match o {
                    Observation::Running { handle, .. } => Some(handle),
                    Observation::Disabled => None,
                })
                .collect()
        };
        let aborts: Vec<_> = running.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(timeout, futures_util::future::join_all(running))
            .await
            .is_err()
        {
            warn!(in_flight = aborts.len(), "Aborting reconciliations still running at shutdown");
            for abort in aborts {
                abort.abort();
            }
        }
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dynsched_swarm::InMemorySwarm;

    use super::*;
    use crate::config::Config;
    use crate::instrumentation::RecordingPublisher;
    use crate::models::fixtures;
    use crate::node_rights::{InMemoryLockBackend, NodeRightsManager};
    use crate::projects::InMemoryProjects;
    use crate::sidecar::MockSidecar;

    fn scheduler() -> Scheduler {
        let config = Config::for_stack("test-stack");
        let node_rights = NodeRightsManager::new(Arc::new(InMemoryLockBackend::new()), &config.node_rights);
        Scheduler::new(SchedulerContext {
            config,
            swarm: Arc::new(InMemorySwarm::default()),
            sidecar: Arc::new(MockSidecar::new()),
            node_rights: Arc::new(node_rights),
            projects: Arc::new(InMemoryProjects::permissive()),
            events: Arc::new(RecordingPublisher::new()),
        })
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let scheduler = scheduler();
        let data = fixtures::scheduler_data();
        scheduler.add(data.clone()).await.unwrap();
        scheduler.add(data.clone()).await.unwrap();

        assert_eq!(scheduler.list(None, None).await.len(), 1);
        assert!(scheduler.is_service_tracked(data.instance_id).await);
    }

    #[tokio::test]
    async fn test_add_rejects_name_collision() {
        let scheduler = scheduler();
        let data = fixtures::scheduler_data();
        scheduler.add(data.clone()).await.unwrap();

        let mut renamed = data.clone();
        renamed.service_name = ServiceName::from("dy-sidecar_other");
        let err = scheduler.add(renamed).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NameCollision { .. }));
    }

    #[tokio::test]
    async fn test_unknown_instance_is_not_found() {
        let scheduler = scheduler();
        let unknown = InstanceId::new();
        assert!(scheduler.get(unknown).await.unwrap_err().is_not_found());
        assert!(scheduler
            .mark_for_removal(unknown, true, false)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(scheduler.reset_status(unknown).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_filters_by_user_and_project() {
        let scheduler = scheduler();
        let first = fixtures::scheduler_data();
        let mut second = fixtures::scheduler_data();
        second.user_id = UserId::new(2);
        scheduler.add(first.clone()).await.unwrap();
        scheduler.add(second.clone()).await.unwrap();

        assert_eq!(scheduler.list(None, None).await.len(), 2);
        let by_user = scheduler.list(Some(UserId::new(2)), None).await;
        assert_eq!(by_user.len(), 1);
        assert_eq!(by_user[0].instance_id, second.instance_id);
        let by_project = scheduler.list(None, Some(first.project_id)).await;
        assert_eq!(by_project.len(), 1);
        assert_eq!(by_project[0].instance_id, first.instance_id);
    }

    #[tokio::test]
    async fn test_mark_for_removal_persists_request() {
        let scheduler = scheduler();
        let data = fixtures::scheduler_data();
        scheduler.add(data.clone()).await.unwrap();

        scheduler.mark_for_removal(data.instance_id, true, true).await.unwrap();

        let marked = scheduler.get(data.instance_id).await.unwrap();
        let removal = marked.dynamic_sidecar.service_removal_state;
        assert!(removal.can_remove && removal.can_save && !removal.was_removed);
        assert!(marked.dynamic_sidecar.instrumentation.close_requested_at.is_some());
    }

    #[tokio::test]
    async fn test_toggle_observation() {
        let scheduler = scheduler();
        let data = fixtures::scheduler_data();
        scheduler.add(data.clone()).await.unwrap();

        assert!(scheduler.toggle_observation(data.instance_id, true).await.unwrap());
        assert!(scheduler.toggle_observation(data.instance_id, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_status_clears_latch() {
        let scheduler = scheduler();
        let mut data = fixtures::scheduler_data();
        data.dynamic_sidecar.status.update_failing_status("save failed", Some("OEC:1"));
        data.dynamic_sidecar.wait_for_manual_intervention_after_error = true;
        data.dynamic_sidecar.wait_for_manual_intervention_logged = true;
        scheduler.add(data.clone()).await.unwrap();
        assert!(scheduler
            .is_service_awaiting_manual_intervention(data.instance_id)
            .await
            .unwrap());

        scheduler.reset_status(data.instance_id).await.unwrap();

        let reset = scheduler.get(data.instance_id).await.unwrap();
        assert!(reset.dynamic_sidecar.status.is_ok());
        assert!(!reset.dynamic_sidecar.wait_for_manual_intervention_after_error);
        assert!(!reset.dynamic_sidecar.wait_for_manual_intervention_logged);
    }

    #[tokio::test]
    async fn test_commit_absorbs_operator_changes() {
        let scheduler = scheduler();
        let data = fixtures::scheduler_data();
        scheduler.add(data.clone()).await.unwrap();

        let (mut stale, mut epoch) = scheduler.inner.snapshot(&data.service_name).await.unwrap();
        scheduler.mark_for_removal(data.instance_id, false, true).await.unwrap();

        stale.dynamic_sidecar.was_dynamic_sidecar_started = true;
        assert!(scheduler.inner.commit(&data.service_name, &mut stale, &mut epoch).await);

        let committed = scheduler.get(data.instance_id).await.unwrap();
        assert!(committed.dynamic_sidecar.was_dynamic_sidecar_started);
        assert!(committed.dynamic_sidecar.service_removal_state.can_remove);
        assert_eq!(epoch, 1);
    }

    #[tokio::test]
    async fn test_stack_status_before_creation() {
        let scheduler = scheduler();
        let data = fixtures::scheduler_data();
        scheduler.add(data.clone()).await.unwrap();

        let status = scheduler.get_stack_status(data.instance_id).await.unwrap();
        assert_eq!(status.state, ServiceState::Pending);
    }

    #[tokio::test]
    async fn test_remove_from_registry_forgets_instance() {
        let scheduler = scheduler();
        let data = fixtures::scheduler_data();
        scheduler.add(data.clone()).await.unwrap();
        scheduler.toggle_observation(data.instance_id, true).await.unwrap();

        scheduler.remove_from_registry(data.instance_id).await.unwrap();

        assert!(!scheduler.is_service_tracked(data.instance_id).await);
        scheduler.add(data.clone()).await.unwrap();
        assert!(scheduler.is_service_tracked(data.instance_id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_start() {
        let scheduler = scheduler();
        tokio::time::timeout(Duration::from_secs(1), scheduler.stop())
            .await
            .unwrap();
    }
}

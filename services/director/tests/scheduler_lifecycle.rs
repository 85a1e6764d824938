//! Scheduler integration tests.
//!
//! Drives instances through the whole pipeline against an in-memory swarm and
//! a scripted sidecar:
//! 1. Stack creation, readiness, environment, user services, networks
//! 2. Teardown with and without saving data
//! 3. The manual-intervention latch
//! 4. Recovery after a restart
//!
//! Time is paused, so the scheduler's intervals and timeouts elapse instantly.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dynsched_director::config::Config;
use dynsched_director::docker_api::ServiceState;
use dynsched_director::error::SchedulerError;
use dynsched_director::instrumentation::{Metric, RecordingPublisher};
use dynsched_director::models::{
    NewInstance, PathMappings, RestartPolicy, SchedulerData, ServiceResources,
};
use dynsched_director::node_rights::{
    InMemoryLockBackend, NodeRightsManager, RESOURCE_STATE_AND_INPUTS,
};
use dynsched_director::projects::InMemoryProjects;
use dynsched_director::scheduler::{Rule, Scheduler, SchedulerContext};
use dynsched_director::sidecar::{MockSidecar, VolumeCategory, VolumeStatus};
use dynsched_director::specs;
use dynsched_id::{InstanceId, ProjectId, UserId};
use dynsched_swarm::{InMemorySwarm, SwarmApi};
use tokio::time::Instant;

const WAIT_TIMEOUT: Duration = Duration::from_secs(600);
const POLL: Duration = Duration::from_millis(250);

struct Harness {
    config: Config,
    swarm: Arc<InMemorySwarm>,
    sidecar: MockSidecar,
    projects: Arc<InMemoryProjects>,
    events: Arc<RecordingPublisher>,
    node_rights: Arc<NodeRightsManager>,
}

impl Harness {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,dynsched_director=debug".into()),
            )
            .with_test_writer()
            .try_init();

        let mut config = Config::for_stack("test-stack");
        config.scheduler.interval = Duration::from_secs(1);

        let swarm = Arc::new(InMemorySwarm::default());
        swarm.add_network("interactive_services_subnet", "swarm");

        let node_rights = NodeRightsManager::new(Arc::new(InMemoryLockBackend::new()), &config.node_rights);

        Self {
            config,
            swarm,
            sidecar: MockSidecar::new(),
            projects: Arc::new(InMemoryProjects::permissive()),
            events: Arc::new(RecordingPublisher::new()),
            node_rights: Arc::new(node_rights),
        }
    }

    fn context(&self) -> SchedulerContext {
        SchedulerContext {
            config: self.config.clone(),
            swarm: self.swarm.clone(),
            sidecar: Arc::new(self.sidecar.clone()),
            node_rights: Arc::clone(&self.node_rights),
            projects: self.projects.clone(),
            events: self.events.clone(),
        }
    }

    /// A scheduler sharing this harness' cluster, as a restarted process would.
    fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.context())
    }

    fn instance(&self) -> SchedulerData {
        let request = NewInstance {
            instance_id: InstanceId::new(),
            user_id: UserId::new(7),
            project_id: ProjectId::new(),
            product_name: "osparc".to_string(),
            key: "simcore/services/dynamic/jupyter-math".to_string(),
            version: "2.0.9".to_string(),
            paths_mapping: PathMappings {
                inputs_path: "/home/jovyan/work/inputs".into(),
                outputs_path: "/home/jovyan/work/outputs".into(),
                state_paths: vec!["/home/jovyan/work/workspace".into()],
                state_exclude: vec![],
            },
            compose_spec: None,
            container_http_entry: None,
            restart_policy: RestartPolicy::NoRestart,
            service_resources: ServiceResources::default(),
            service_port: 8888,
            request_dns: "osparc.local".to_string(),
            request_scheme: "https".to_string(),
            request_user_agent: "integration-test".to_string(),
            wallet_info: None,
            pricing_info: None,
            hardware_info: None,
            service_labels: BTreeMap::from([(
                specs::OUTPUTS_LABEL.to_string(),
                r#"{"outputs": {"output_1": {"type": "data:*/*"}, "output_2": {"type": "number"}}}"#
                    .to_string(),
            )]),
        };
        SchedulerData::new(request, &self.config)
    }
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(POLL).await;
    }
}

async fn wait_for_data(
    scheduler: &Scheduler,
    instance_id: InstanceId,
    what: &str,
    check: impl Fn(&SchedulerData) -> bool,
) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        let data = scheduler
            .get(instance_id)
            .await
            .unwrap_or_else(|e| panic!("instance vanished while waiting for {what}: {e}"));
        if check(&data) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(POLL).await;
    }
}

async fn wait_until_untracked(scheduler: &Scheduler, instance_id: InstanceId) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while scheduler.is_service_tracked(instance_id).await {
        assert!(Instant::now() < deadline, "timed out waiting for the instance to be untracked");
        tokio::time::sleep(POLL).await;
    }
}

async fn wait_until_running(scheduler: &Scheduler, instance_id: InstanceId) {
    wait_for_data(scheduler, instance_id, "project networks to be attached", |d| {
        d.dynamic_sidecar.is_project_network_attached
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_instance_lifecycle_with_saving() {
    let harness = Harness::new();
    let scheduler = harness.scheduler();
    scheduler.start().await.unwrap();

    let data = harness.instance();
    let instance_id = data.instance_id;
    let endpoint = data.endpoint();
    let service_name = data.service_name.to_string();
    let proxy_name = data.proxy_service_name.clone();
    let network_name = data.dynamic_sidecar_network_name.clone();
    harness
        .projects
        .set_network_alias(data.project_id, "project-net", instance_id, "notebook");

    scheduler.add(data).await.unwrap();
    wait_until_running(&scheduler, instance_id).await;

    let running = scheduler.get(instance_id).await.unwrap();
    let ds = &running.dynamic_sidecar;
    assert!(ds.are_containers_running());
    assert!(ds.were_containers_created);
    assert_eq!(ds.docker_node_id.as_deref(), Some("node-1"));

    let services = harness.swarm.service_names();
    assert!(services.contains(&service_name));
    assert!(services.contains(&proxy_name));
    assert!(harness.swarm.network_names().contains(&network_name));

    let proxy_spec = harness.swarm.service_spec(&proxy_name).unwrap();
    let upstream = format!("{}-entrypoint:8888", running.hostname);
    assert_eq!(specs::proxy_upstream(&proxy_spec), Some(upstream.as_str()));

    assert_eq!(harness.sidecar.attached_networks(&endpoint).len(), 1);
    assert_eq!(harness.sidecar.output_dirs(&endpoint), vec!["output_1", "output_2"]);
    assert_eq!(harness.events.count(Metric::ServiceStarted), 1);
    assert_eq!(
        scheduler.get_stack_status(instance_id).await.unwrap().state,
        ServiceState::Running
    );

    scheduler.mark_for_removal(instance_id, true, false).await.unwrap();
    wait_until_untracked(&scheduler, instance_id).await;

    assert_eq!(harness.sidecar.calls("save_service_state"), 1);
    assert_eq!(harness.sidecar.calls("push_service_output_ports"), 1);
    let volume_states = harness.sidecar.volume_states(&endpoint);
    assert!(volume_states.contains(&(VolumeCategory::States, VolumeStatus::ContentWasSaved)));
    assert!(volume_states.contains(&(VolumeCategory::Outputs, VolumeStatus::ContentWasSaved)));

    // sidecar, proxy and the volume remover
    assert_eq!(harness.swarm.service_creations(), 3);
    assert!(harness.swarm.service_names().is_empty());
    let networks = harness.swarm.network_names();
    assert!(!networks.contains(&network_name));
    assert!(!networks.contains(&"project-net".to_string()));
    assert!(networks.contains(&"interactive_services_subnet".to_string()));

    assert_eq!(harness.events.count(Metric::ServiceStopped), 1);
    assert!(matches!(
        scheduler.get(instance_id).await,
        Err(SchedulerError::NotFound(_))
    ));

    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_removal_without_saving_still_removes_volumes() {
    let harness = Harness::new();
    let scheduler = harness.scheduler();
    scheduler.start().await.unwrap();

    let data = harness.instance();
    let instance_id = data.instance_id;
    scheduler.add(data).await.unwrap();
    wait_until_running(&scheduler, instance_id).await;

    scheduler.mark_for_removal(instance_id, false, false).await.unwrap();
    wait_until_untracked(&scheduler, instance_id).await;

    assert_eq!(harness.sidecar.calls("save_service_state"), 0);
    assert_eq!(harness.sidecar.calls("push_service_output_ports"), 0);
    assert_eq!(harness.swarm.service_creations(), 3);
    assert!(harness.swarm.service_names().is_empty());

    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_removed_instance_can_be_added_again() {
    let harness = Harness::new();
    let scheduler = harness.scheduler();
    scheduler.start().await.unwrap();

    let data = harness.instance();
    let instance_id = data.instance_id;
    let again = data.clone();
    scheduler.add(data).await.unwrap();
    wait_until_running(&scheduler, instance_id).await;

    scheduler.mark_for_removal(instance_id, false, false).await.unwrap();
    wait_until_untracked(&scheduler, instance_id).await;

    // the stale copy carries no removal flags, it starts from scratch
    scheduler.add(again).await.unwrap();
    wait_until_running(&scheduler, instance_id).await;
    assert_eq!(harness.events.count(Metric::ServiceStarted), 2);

    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_save_waits_for_operator() {
    let harness = Harness::new();
    let scheduler = harness.scheduler();
    scheduler.start().await.unwrap();

    let data = harness.instance();
    let instance_id = data.instance_id;
    let service_name = data.service_name.to_string();
    scheduler.add(data).await.unwrap();
    wait_until_running(&scheduler, instance_id).await;

    harness.sidecar.fail_save_state(true);
    scheduler.mark_for_removal(instance_id, true, false).await.unwrap();
    wait_for_data(&scheduler, instance_id, "the manual intervention latch", |d| {
        d.dynamic_sidecar.is_awaiting_manual_intervention()
    })
    .await;

    // give the scheduler plenty of cycles to misbehave
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(scheduler.is_service_awaiting_manual_intervention(instance_id).await.unwrap());
    assert!(harness.swarm.service_names().contains(&service_name));
    assert_eq!(harness.events.count(Metric::ServiceStopped), 0);
    assert_eq!(harness.sidecar.calls("save_service_state"), 1);
    assert_eq!(
        scheduler.get_stack_status(instance_id).await.unwrap().state,
        ServiceState::Failed
    );

    harness.sidecar.fail_save_state(false);
    scheduler.reset_status(instance_id).await.unwrap();
    wait_until_untracked(&scheduler, instance_id).await;

    assert_eq!(harness.sidecar.calls("save_service_state"), 2);
    assert_eq!(harness.events.count(Metric::ServiceStopped), 1);
    assert!(harness.swarm.service_names().is_empty());

    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_latched_instance_dropped_once_stack_is_removed_by_hand() {
    let harness = Harness::new();
    let scheduler = harness.scheduler();
    scheduler.start().await.unwrap();

    let data = harness.instance();
    let instance_id = data.instance_id;
    let service_name = data.service_name.to_string();
    let proxy_name = data.proxy_service_name.clone();
    scheduler.add(data).await.unwrap();
    wait_until_running(&scheduler, instance_id).await;

    harness.sidecar.fail_save_state(true);
    scheduler.mark_for_removal(instance_id, true, false).await.unwrap();
    wait_for_data(&scheduler, instance_id, "the manual intervention latch", |d| {
        d.dynamic_sidecar.is_awaiting_manual_intervention()
    })
    .await;

    harness.swarm.remove_service(&service_name).await.unwrap();
    harness.swarm.remove_service(&proxy_name).await.unwrap();
    wait_until_untracked(&scheduler, instance_id).await;

    // the operator cleaned up, the scheduler did not tear anything down
    assert_eq!(harness.events.count(Metric::ServiceStopped), 0);

    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_vanished_proxy_triggers_removal_without_saving() {
    let harness = Harness::new();
    let scheduler = harness.scheduler();
    scheduler.start().await.unwrap();

    let data = harness.instance();
    let instance_id = data.instance_id;
    let proxy_name = data.proxy_service_name.clone();
    scheduler.add(data).await.unwrap();
    wait_until_running(&scheduler, instance_id).await;

    harness.swarm.remove_service(&proxy_name).await.unwrap();
    wait_until_untracked(&scheduler, instance_id).await;

    assert_eq!(harness.sidecar.calls("save_service_state"), 0);
    assert_eq!(harness.events.count(Metric::ServiceStopped), 1);
    assert!(harness.swarm.service_names().is_empty());

    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_recovery_readopts_without_recreating() {
    let harness = Harness::new();
    let first = harness.scheduler();
    first.start().await.unwrap();

    let data = harness.instance();
    let instance_id = data.instance_id;
    first.add(data).await.unwrap();
    wait_until_running(&first, instance_id).await;
    first.stop().await;

    let service_creations = harness.swarm.service_creations();
    let network_creations = harness.swarm.network_creations();
    let container_creations = harness.sidecar.calls("create_containers");

    let second = harness.scheduler();
    assert_eq!(second.rediscover().await.unwrap(), 1);
    let once: Vec<InstanceId> = second.list(None, None).await.iter().map(|d| d.instance_id).collect();
    assert_eq!(second.rediscover().await.unwrap(), 1);
    let twice: Vec<InstanceId> = second.list(None, None).await.iter().map(|d| d.instance_id).collect();
    assert_eq!(once, vec![instance_id]);
    assert_eq!(once, twice);

    let recovered = second.get(instance_id).await.unwrap();
    assert!(recovered.dynamic_sidecar.was_dynamic_sidecar_started);
    assert!(recovered.dynamic_sidecar.compose_spec_submitted());

    second.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(harness.swarm.service_creations(), service_creations);
    assert_eq!(harness.swarm.network_creations(), network_creations);
    assert_eq!(harness.sidecar.calls("create_containers"), container_creations);
    assert_eq!(harness.events.count(Metric::ServiceStarted), 1);
    assert!(second.get(instance_id).await.unwrap().dynamic_sidecar.are_containers_running());

    second.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_one_reconciliation_per_instance() {
    let harness = Harness::new();
    // slower than the ticker, so instances are enqueued while still in flight
    harness.sidecar.set_latency(Duration::from_millis(2500));
    let scheduler = harness.scheduler();
    scheduler.start().await.unwrap();

    let first = harness.instance();
    let second = harness.instance();
    let ids = [first.instance_id, second.instance_id];
    let endpoints = [first.endpoint(), second.endpoint()];
    scheduler.add(first).await.unwrap();
    scheduler.add(second).await.unwrap();

    for instance_id in ids {
        wait_until_running(&scheduler, instance_id).await;
    }
    tokio::time::sleep(Duration::from_secs(30)).await;

    for endpoint in &endpoints {
        assert!(harness.sidecar.calls_for(endpoint).len() > 10);
        assert_eq!(harness.sidecar.max_concurrent_calls(endpoint, "is_healthy"), 1);
        assert_eq!(harness.sidecar.max_concurrent_calls(endpoint, "containers_inspect"), 1);
        assert_eq!(harness.sidecar.max_concurrent_calls(endpoint, "create_containers"), 1);
    }

    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_busy_node_defers_environment_preparation() {
    let harness = Harness::new();
    let mut held = Vec::new();
    for _ in 0..harness.config.node_rights.default_slots {
        held.push(
            harness
                .node_rights
                .acquire("node-1", RESOURCE_STATE_AND_INPUTS)
                .await
                .unwrap(),
        );
    }

    let scheduler = harness.scheduler();
    scheduler.start().await.unwrap();
    let data = harness.instance();
    let instance_id = data.instance_id;
    scheduler.add(data).await.unwrap();

    wait_until("preparation to be attempted twice", || {
        harness.sidecar.calls("pull_user_services_images") >= 2
    })
    .await;
    assert_eq!(harness.sidecar.calls("pull_service_output_ports"), 0);
    let waiting = scheduler.get(instance_id).await.unwrap();
    assert!(!waiting.dynamic_sidecar.is_service_environment_ready);
    assert!(waiting.dynamic_sidecar.status.is_ok());

    let mut slot = held.remove(0);
    slot.release().await.unwrap();

    wait_until_running(&scheduler, instance_id).await;
    assert_eq!(harness.sidecar.calls("pull_service_output_ports"), 1);
    assert_eq!(harness.sidecar.calls("restore_service_state"), 1);

    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_repeated_stack_creation_adopts_existing_resources() {
    let harness = Harness::new();
    let ctx = harness.context();
    let mut data = harness.instance();

    Rule::CreateStack.action(&ctx, &mut data).await.unwrap();
    let run_id = data.run_id;
    let sidecar_id = data.dynamic_sidecar.dynamic_sidecar_id.clone();

    Rule::CreateStack.action(&ctx, &mut data).await.unwrap();

    let mut services = harness.swarm.service_names();
    services.sort();
    let mut expected = vec![data.service_name.to_string(), data.proxy_service_name.clone()];
    expected.sort();
    assert_eq!(services, expected);
    assert_eq!(harness.swarm.service_creations(), 2);

    let mut networks = harness.swarm.network_names();
    networks.sort();
    let mut expected = vec![
        "interactive_services_subnet".to_string(),
        data.dynamic_sidecar_network_name.clone(),
    ];
    expected.sort();
    assert_eq!(networks, expected);

    assert_eq!(data.run_id, run_id);
    assert_eq!(data.dynamic_sidecar.dynamic_sidecar_id, sidecar_id);
    assert_eq!(harness.events.count(Metric::ServiceStarted), 1);
}

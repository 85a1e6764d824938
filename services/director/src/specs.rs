//! Swarm service specs of an instance's stack, and the compose spec its
//! sidecar runs.

use std::collections::BTreeMap;
use std::time::Duration;

use dynsched_swarm::models::{
    ContainerSpec, Labels, Mount, MountKind, NetworkAttachmentConfig, Placement, ResourceObject,
    Resources, RestartCondition, RestartPolicy, ServiceSpec, TaskTemplate,
};
use serde_json::{json, Map, Value};

use crate::config::Config;
use crate::models::{labels, volume_remover_service_name, SchedulerData};
use crate::volumes::VolumePathsResolver;

const DOCKER_SOCKET: &str = "/var/run/docker.sock";
const PROXY_LISTEN: &str = ":80";
const PROXY_UPSTREAM_ENV: &str = "PROXY_UPSTREAM";

/// Label of the service image describing its output ports, shaped as
/// `{"outputs": {"<port key>": {...}}}`.
pub const OUTPUTS_LABEL: &str = "io.simcore.outputs";

/// Name the default compose spec gives its only container.
pub const DEFAULT_CONTAINER_NAME: &str = "container";

fn stack_labels(data: &SchedulerData, config: &Config, service_type: &str) -> Labels {
    BTreeMap::from([
        (labels::SWARM_STACK_NAME.to_string(), config.swarm_stack_name.clone()),
        (labels::UUID.to_string(), data.instance_id.to_string()),
        (labels::SERVICE_TYPE.to_string(), service_type.to_string()),
        (labels::USER_ID.to_string(), data.user_id.to_string()),
        (labels::STUDY_ID.to_string(), data.project_id.to_string()),
        (labels::SERVICE_KEY.to_string(), data.key.clone()),
        (labels::SERVICE_VERSION.to_string(), data.version.clone()),
    ])
}

fn bind(source: &str, target: &str) -> Mount {
    Mount {
        source: Some(source.to_string()),
        target: target.to_string(),
        kind: MountKind::Bind,
        read_only: None,
        volume_options: None,
    }
}

fn sidecar_mounts(data: &SchedulerData, config: &Config) -> Vec<Mount> {
    let stack = config.swarm_stack_name.as_str();
    let paths = &data.paths_mapping;
    let mut mounts = vec![
        bind(DOCKER_SOCKET, DOCKER_SOCKET),
        VolumePathsResolver::mount_shared_store(
            stack,
            data.instance_id,
            data.run_id,
            data.project_id,
            data.user_id,
        ),
    ];
    for path in [&paths.inputs_path, &paths.outputs_path] {
        mounts.push(VolumePathsResolver::mount_entry(
            stack,
            path,
            data.instance_id,
            data.run_id,
            data.project_id,
            data.user_id,
        ));
    }
    for path in &paths.state_paths {
        let mount = match (&config.remote_storage, config.scheduler.rclone_mounts_enabled) {
            (Some(storage), true) => VolumePathsResolver::mount_remote_storage(
                stack,
                path,
                data.instance_id,
                data.run_id,
                data.project_id,
                data.user_id,
                storage,
            ),
            _ => VolumePathsResolver::mount_entry(
                stack,
                path,
                data.instance_id,
                data.run_id,
                data.project_id,
                data.user_id,
            ),
        };
        mounts.push(mount);
    }
    mounts
}

fn sidecar_env(data: &SchedulerData, config: &Config) -> Result<Vec<String>, serde_json::Error> {
    let paths = &data.paths_mapping;
    Ok(vec![
        format!("DY_SIDECAR_RUN_ID={}", data.run_id),
        format!("DY_SIDECAR_NODE_ID={}", data.instance_id),
        format!("DY_SIDECAR_USER_ID={}", data.user_id),
        format!("DY_SIDECAR_PROJECT_ID={}", data.project_id),
        format!("DY_SIDECAR_PRODUCT_NAME={}", data.product_name),
        format!("DY_SIDECAR_SERVICE_KEY={}", data.key),
        format!("DY_SIDECAR_SERVICE_VERSION={}", data.version),
        format!("DY_SIDECAR_PATH_INPUTS={}", paths.inputs_path.display()),
        format!("DY_SIDECAR_PATH_OUTPUTS={}", paths.outputs_path.display()),
        format!("DY_SIDECAR_STATE_PATHS={}", serde_json::to_string(&paths.state_paths)?),
        format!("DY_SIDECAR_STATE_EXCLUDE={}", serde_json::to_string(&paths.state_exclude)?),
        format!("DYNAMIC_SIDECAR_COMPOSE_NAMESPACE={}", data.service_name),
        format!("SIMCORE_HOST_NAME={}", data.service_name),
        format!("SWARM_STACK_NAME={}", config.swarm_stack_name),
        format!("REGISTRY_URL={}", config.registry),
    ])
}

fn resources(data: &SchedulerData) -> Option<Resources> {
    let wanted = &data.service_resources;
    if wanted.nano_cpus.is_none() && wanted.memory_bytes.is_none() {
        return None;
    }
    Some(Resources {
        limits: None,
        reservations: Some(ResourceObject {
            nano_cpus: wanted.nano_cpus,
            memory_bytes: wanted.memory_bytes,
        }),
    })
}

/// The sidecar service. Its labels carry the recovery snapshot.
pub fn sidecar_spec(
    data: &SchedulerData,
    config: &Config,
    swarm_network_id: &str,
    sidecar_network_id: &str,
) -> Result<ServiceSpec, serde_json::Error> {
    let mut labels = stack_labels(data, config, labels::TYPE_MAIN);
    labels.insert(labels::RUN_ID.to_string(), data.run_id.to_string());
    labels.insert(labels::SCHEDULER_DATA.to_string(), data.as_label_data()?);

    Ok(ServiceSpec {
        name: data.service_name.to_string(),
        labels,
        task_template: TaskTemplate {
            container_spec: ContainerSpec {
                image: config.sidecar_image.clone(),
                hostname: Some(data.hostname.clone()),
                env: sidecar_env(data, config)?,
                mounts: sidecar_mounts(data, config),
                init: Some(true),
                ..Default::default()
            },
            placement: Some(Placement {
                constraints: config.placement_constraints.clone(),
            }),
            resources: resources(data),
            restart_policy: Some(RestartPolicy {
                condition: RestartCondition::OnFailure,
            }),
            networks: vec![
                NetworkAttachmentConfig {
                    target: swarm_network_id.to_string(),
                    aliases: vec![data.service_name.to_string()],
                },
                NetworkAttachmentConfig {
                    target: sidecar_network_id.to_string(),
                    aliases: Vec::new(),
                },
            ],
        },
    })
}

fn upstream_args(upstream: &str) -> Vec<String> {
    ["--from", PROXY_LISTEN, "--to", upstream, "--change-host-header"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// The reverse proxy in front of the user service.
///
/// Until the entrypoint container is known the proxy forwards to the sidecar.
pub fn proxy_spec(
    data: &SchedulerData,
    config: &Config,
    swarm_network_id: &str,
    sidecar_network_id: &str,
    docker_node_id: &str,
) -> ServiceSpec {
    let upstream = format!("{}:{}", data.hostname, data.port);
    let mut container_spec = ContainerSpec {
        image: config.proxy_image.clone(),
        command: vec!["caddy".to_string(), "reverse-proxy".to_string()],
        args: upstream_args(&upstream),
        hostname: Some(data.proxy_service_name.clone()),
        ..Default::default()
    };
    container_spec.set_env_var(PROXY_UPSTREAM_ENV, &upstream);
    container_spec.set_env_var(
        "CADDY_ADMIN",
        &format!("0.0.0.0:{}", data.proxy_admin_api_port),
    );

    ServiceSpec {
        name: data.proxy_service_name.clone(),
        labels: stack_labels(data, config, labels::TYPE_DEPENDENCY),
        task_template: TaskTemplate {
            container_spec,
            placement: Some(Placement {
                constraints: vec![format!("node.id == {docker_node_id}")],
            }),
            resources: Some(Resources {
                limits: Some(ResourceObject {
                    nano_cpus: Some(100_000_000),
                    memory_bytes: Some(64 * 1024 * 1024),
                }),
                reservations: None,
            }),
            restart_policy: Some(RestartPolicy {
                condition: RestartCondition::OnFailure,
            }),
            networks: vec![
                NetworkAttachmentConfig {
                    target: swarm_network_id.to_string(),
                    aliases: vec![data.proxy_service_name.clone()],
                },
                NetworkAttachmentConfig {
                    target: sidecar_network_id.to_string(),
                    aliases: Vec::new(),
                },
            ],
        },
    }
}

/// Point an existing proxy spec at the entrypoint container.
pub fn route_proxy_to(spec: &mut ServiceSpec, entrypoint: &str, service_port: u16) {
    let upstream = format!("{entrypoint}:{service_port}");
    let container_spec = &mut spec.task_template.container_spec;
    container_spec.args = upstream_args(&upstream);
    container_spec.set_env_var(PROXY_UPSTREAM_ENV, &upstream);
}

pub fn proxy_upstream(spec: &ServiceSpec) -> Option<&str> {
    spec.task_template.container_spec.env_var(PROXY_UPSTREAM_ENV)
}

// =============================================================================
// Volume remover
// =============================================================================

/// Volumes to remove from one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRemoval {
    pub swarm_stack_name: String,
    pub docker_node_id: String,
    pub volume_names: Vec<String>,
}

fn removal_script(volume_names: &[String], attempts: u32, sleep: Duration) -> String {
    let volumes = volume_names
        .iter()
        .map(|v| format!("'{v}'"))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "set -e; for volume in {volumes}; do \
         n=0; \
         until docker volume rm -f \"$volume\"; do \
         n=$((n+1)); \
         if [ \"$n\" -ge {attempts} ]; then echo \"could not remove $volume\"; exit 1; fi; \
         sleep {sleep}; \
         done; \
         done",
        sleep = sleep.as_secs().max(1),
    )
}

/// One-shot service that removes volumes on the node it is pinned to.
///
/// Runs the engine's own CLI image so the client matches the node's engine.
pub fn volume_remover_spec(
    removal: &VolumeRemoval,
    docker_version: &str,
    service_timeout: Duration,
) -> ServiceSpec {
    ServiceSpec {
        name: volume_remover_service_name(),
        labels: BTreeMap::from([
            (
                labels::SWARM_STACK_NAME.to_string(),
                removal.swarm_stack_name.clone(),
            ),
            (
                labels::SERVICE_TIMEOUT_S.to_string(),
                service_timeout.as_secs().to_string(),
            ),
        ]),
        task_template: TaskTemplate {
            container_spec: ContainerSpec {
                image: format!("docker:{docker_version}-dind"),
                command: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    removal_script(
                        &removal.volume_names,
                        crate::docker_api::VOLUME_REMOVAL_ATTEMPTS,
                        crate::docker_api::VOLUME_REMOVAL_SLEEP,
                    ),
                ],
                mounts: vec![bind(DOCKER_SOCKET, DOCKER_SOCKET)],
                init: Some(true),
                ..Default::default()
            },
            placement: Some(Placement {
                constraints: vec![format!("node.id == {}", removal.docker_node_id)],
            }),
            resources: Some(Resources {
                limits: Some(ResourceObject {
                    nano_cpus: Some(1_000_000_000),
                    memory_bytes: Some(256 * 1024 * 1024),
                }),
                reservations: None,
            }),
            restart_policy: Some(RestartPolicy {
                condition: RestartCondition::None,
            }),
            networks: Vec::new(),
        },
    }
}

// =============================================================================
// Compose spec
// =============================================================================

fn default_compose_spec(data: &SchedulerData, config: &Config) -> Value {
    json!({
        "version": "3.8",
        "services": {
            DEFAULT_CONTAINER_NAME: {
                "image": format!("{}/{}:{}", config.registry, data.key, data.version),
            }
        }
    })
}

fn take_object(value: &mut Value, key: &str) -> Map<String, Value> {
    match value.get_mut(key).map(Value::take) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Compose accepts both the list and the mapping form of `environment`.
fn inject_environment(service: &mut Value, vars: &[(&str, String)]) {
    if let Some(Value::Array(list)) = service.get_mut("environment") {
        for (key, value) in vars {
            list.push(json!(format!("{key}={value}")));
        }
        return;
    }
    let mut environment = take_object(service, "environment");
    for (key, value) in vars {
        environment.insert(key.to_string(), json!(value));
    }
    service["environment"] = Value::Object(environment);
}

fn join_network(service: &mut Value, network: &str, alias: &str) {
    if let Some(Value::Array(list)) = service.get_mut("networks") {
        list.push(json!(network));
        return;
    }
    let mut networks = take_object(service, "networks");
    networks.insert(network.to_string(), json!({ "aliases": [alias] }));
    service["networks"] = Value::Object(networks);
}

/// Compose spec handed to the sidecar.
///
/// Starts from the declared spec (or a one-container default), joins the HTTP
/// entry container to the dedicated network, and passes the path mapping and
/// resource limits down to every container.
pub fn assemble_compose_spec(data: &SchedulerData, config: &Config) -> Result<String, serde_json::Error> {
    let mut spec = data
        .compose_spec
        .clone()
        .filter(Value::is_object)
        .unwrap_or_else(|| default_compose_spec(data, config));
    let http_entry = data
        .container_http_entry
        .clone()
        .unwrap_or_else(|| DEFAULT_CONTAINER_NAME.to_string());
    let network = data.dynamic_sidecar_network_name.as_str();

    let mut networks = take_object(&mut spec, "networks");
    networks.insert(
        network.to_string(),
        json!({ "external": true, "name": network }),
    );
    spec["networks"] = Value::Object(networks);

    let paths = &data.paths_mapping;
    let vars = [
        ("DY_SIDECAR_PATH_INPUTS", paths.inputs_path.display().to_string()),
        ("DY_SIDECAR_PATH_OUTPUTS", paths.outputs_path.display().to_string()),
        ("DY_SIDECAR_STATE_PATHS", serde_json::to_string(&paths.state_paths)?),
    ];

    let mut services = take_object(&mut spec, "services");
    for (name, service) in services.iter_mut() {
        if !service.is_object() {
            continue;
        }
        inject_environment(service, &vars);
        if let Some(cpus) = data.service_resources.nano_cpus {
            service["cpus"] = json!(cpus as f64 / 1e9);
        }
        if let Some(memory) = data.service_resources.memory_bytes {
            service["mem_limit"] = json!(memory);
        }
        if *name == http_entry {
            join_network(service, network, name);
        }
    }
    spec["services"] = Value::Object(services);

    serde_json::to_string(&spec)
}

/// Output port keys declared in the service image labels.
pub fn output_port_keys(service_labels: &BTreeMap<String, String>) -> Vec<String> {
    service_labels
        .get(OUTPUTS_LABEL)
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|label| match label.get("outputs") {
            Some(Value::Object(outputs)) => Some(outputs.keys().cloned().collect()),
            _ => None,
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures;

    #[test]
    fn test_sidecar_spec_carries_recovery_label() {
        let data = fixtures::scheduler_data();
        let config = Config::for_stack("test-stack");
        let spec = sidecar_spec(&data, &config, "swarm-net", "sidecar-net").unwrap();

        assert_eq!(spec.name, data.service_name.as_str());
        assert_eq!(spec.labels[labels::SERVICE_TYPE], labels::TYPE_MAIN);
        let recovered = SchedulerData::from_label_data(&spec.labels[labels::SCHEDULER_DATA]).unwrap();
        assert_eq!(recovered.run_id, data.run_id);
        assert_eq!(spec.labels[labels::SWARM_STACK_NAME], "test-stack");
        // socket, shared store, inputs, outputs, one state path
        assert_eq!(spec.task_template.container_spec.mounts.len(), 5);
        assert_eq!(
            spec.task_template.container_spec.env_var("DY_SIDECAR_RUN_ID"),
            Some(data.run_id.to_string().as_str())
        );
    }

    #[test]
    fn test_proxy_is_pinned_and_rerouted() {
        let data = fixtures::scheduler_data();
        let config = Config::for_stack("test-stack");
        let mut spec = proxy_spec(&data, &config, "swarm-net", "sidecar-net", "node-3");

        assert_eq!(spec.labels[labels::SERVICE_TYPE], labels::TYPE_DEPENDENCY);
        assert_eq!(
            spec.task_template.placement.as_ref().unwrap().constraints,
            vec!["node.id == node-3".to_string()]
        );
        assert_eq!(proxy_upstream(&spec), Some(format!("{}:8000", data.hostname).as_str()));

        route_proxy_to(&mut spec, "app-entry", 8888);
        assert_eq!(proxy_upstream(&spec), Some("app-entry:8888"));
        assert!(spec
            .task_template
            .container_spec
            .args
            .contains(&"app-entry:8888".to_string()));
    }

    #[test]
    fn test_volume_remover_spec() {
        let removal = VolumeRemoval {
            swarm_stack_name: "s".to_string(),
            docker_node_id: "node-2".to_string(),
            volume_names: vec!["dyv_a".to_string(), "dyv_b".to_string()],
        };
        let spec = volume_remover_spec(&removal, "27.3.1", Duration::from_secs(60));

        assert!(spec.name.starts_with("dy-volume-remover_"));
        assert_eq!(spec.labels[labels::SERVICE_TIMEOUT_S], "60");
        assert_eq!(spec.task_template.container_spec.image, "docker:27.3.1-dind");
        let script = &spec.task_template.container_spec.command[2];
        assert!(script.contains("'dyv_a' 'dyv_b'"));
        assert!(script.contains("-ge 15"));
        assert_eq!(
            spec.task_template.restart_policy.unwrap().condition,
            RestartCondition::None
        );
    }

    #[test]
    fn test_default_compose_spec_joins_network() {
        let data = fixtures::scheduler_data();
        let config = Config::for_stack("test-stack");
        let raw = assemble_compose_spec(&data, &config).unwrap();
        let spec: Value = serde_json::from_str(&raw).unwrap();

        let network = &data.dynamic_sidecar_network_name;
        assert_eq!(spec["networks"][network]["external"], true);
        let container = &spec["services"][DEFAULT_CONTAINER_NAME];
        assert_eq!(
            container["image"],
            format!("registry.osparc.local/{}:{}", data.key, data.version)
        );
        assert!(container["networks"][network].is_object());
        assert_eq!(
            container["environment"]["DY_SIDECAR_PATH_OUTPUTS"],
            "/home/jovyan/work/outputs"
        );
    }

    #[test]
    fn test_declared_compose_spec_is_kept() {
        let mut data = fixtures::scheduler_data();
        data.compose_spec = Some(json!({
            "version": "3.8",
            "services": {
                "web": {"image": "nginx"},
                "db": {"image": "postgres", "environment": {"A": "1"}}
            }
        }));
        data.container_http_entry = Some("web".to_string());
        let config = Config::for_stack("test-stack");
        let spec: Value =
            serde_json::from_str(&assemble_compose_spec(&data, &config).unwrap()).unwrap();

        let network = &data.dynamic_sidecar_network_name;
        assert!(spec["services"]["web"]["networks"][network].is_object());
        assert!(spec["services"]["db"].get("networks").is_none());
        assert_eq!(spec["services"]["db"]["environment"]["A"], "1");
    }

    #[test]
    fn test_output_port_keys() {
        let labels = BTreeMap::from([(
            OUTPUTS_LABEL.to_string(),
            r#"{"outputs": {"output_1": {"type": "data:*/*"}, "output_2": {"type": "number"}}}"#
                .to_string(),
        )]);
        assert_eq!(output_port_keys(&labels), vec!["output_1", "output_2"]);
        assert!(output_port_keys(&BTreeMap::new()).is_empty());

        let flat = BTreeMap::from([(
            OUTPUTS_LABEL.to_string(),
            r#"{"output_1": {"type": "number"}}"#.to_string(),
        )]);
        assert!(output_port_keys(&flat).is_empty());
    }
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::volumes::RemoteStorage;

/// Scheduler configuration, read from `DIRECTOR_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,

    /// Docker Engine Unix socket.
    pub docker_socket: PathBuf,
    /// Value of the `swarm_stack_name` label on every service this process owns.
    pub swarm_stack_name: String,
    /// Substring identifying the shared swarm network.
    pub swarm_network_name: String,
    /// Extra placement constraints applied to every sidecar.
    pub placement_constraints: Vec<String>,

    pub sidecar_image: String,
    pub proxy_image: String,
    pub sidecar_port: u16,
    pub proxy_admin_port: u16,
    /// Registry the user service images are pulled from.
    pub registry: String,
    /// Backing store of rclone state mounts.
    pub remote_storage: Option<RemoteStorage>,

    pub scheduler: SchedulerConfig,
    pub node_rights: NodeRightsConfig,
    pub janitor_interval: Duration,
}

/// Timing knobs of the scheduler loops.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Period of the ticker that enqueues every tracked instance.
    pub interval: Duration,
    /// Overall deadline for the sidecar to answer its health check.
    pub startup_timeout: Duration,
    /// Deadline for a sidecar task to reach `running`.
    pub placement_timeout: Duration,
    /// Per-request timeout of the sidecar HTTP client.
    pub api_client_timeout: Duration,
    /// Deadline for the sidecar to report its entrypoint container.
    pub entrypoint_timeout: Duration,
    /// Window during which container-inspect failures are tolerated.
    pub network_error_tolerance: Duration,
    /// Bounded wait when cancelling a reconciliation.
    pub task_cancel_timeout: Duration,
    /// Bounded wait for in-flight reconciliations at shutdown.
    pub shutdown_timeout: Duration,
    /// Sub-timer for the stack-disappeared check while waiting for an operator.
    pub manual_intervention_check: Duration,
    /// Pause between stopping user containers and saving their data.
    pub wait_after_containers_removal: Duration,
    /// State volumes are mounted from remote storage, the sidecar never restores them.
    pub rclone_mounts_enabled: bool,
    /// Gate state/outputs transfers on node rights.
    pub node_rights_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: dynsched_reconcile::DEFAULT_RECONCILE_INTERVAL,
            startup_timeout: Duration::from_secs(3600),
            placement_timeout: Duration::from_secs(300),
            api_client_timeout: Duration::from_secs(60),
            entrypoint_timeout: Duration::from_secs(60),
            network_error_tolerance: dynsched_reconcile::DEFAULT_ERROR_TOLERANCE,
            task_cancel_timeout: dynsched_reconcile::DEFAULT_CANCEL_TIMEOUT,
            shutdown_timeout: Duration::from_secs(5),
            manual_intervention_check: Duration::from_secs(30),
            wait_after_containers_removal: Duration::ZERO,
            rclone_mounts_enabled: false,
            node_rights_enabled: true,
        }
    }
}

/// Distributed lock settings.
#[derive(Debug, Clone)]
pub struct NodeRightsConfig {
    /// Lock service; the in-process backend is used when unset.
    pub redis_url: Option<String>,
    pub default_slots: u32,
    pub lock_ttl: Duration,
    pub key_prefix: String,
}

impl Default for NodeRightsConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            default_slots: 2,
            lock_ttl: Duration::from_secs(10),
            key_prefix: "node_rights".to_string(),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    env_or(key, default.as_secs()).map(Duration::from_secs)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = env_or("DIRECTOR_LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?;
        let log_level = std::env::var("DIRECTOR_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            interval: env_secs("DIRECTOR_SCHEDULER_INTERVAL_SECS", defaults.interval)?,
            startup_timeout: env_secs("DIRECTOR_STARTUP_TIMEOUT_SECS", defaults.startup_timeout)?,
            placement_timeout: env_secs(
                "DIRECTOR_PLACEMENT_TIMEOUT_SECS",
                defaults.placement_timeout,
            )?,
            api_client_timeout: env_secs(
                "DIRECTOR_API_CLIENT_TIMEOUT_SECS",
                defaults.api_client_timeout,
            )?,
            entrypoint_timeout: env_secs(
                "DIRECTOR_ENTRYPOINT_TIMEOUT_SECS",
                defaults.entrypoint_timeout,
            )?,
            network_error_tolerance: env_secs(
                "DIRECTOR_NETWORK_ERROR_TOLERANCE_SECS",
                defaults.network_error_tolerance,
            )?,
            task_cancel_timeout: env_secs(
                "DIRECTOR_TASK_CANCEL_TIMEOUT_SECS",
                defaults.task_cancel_timeout,
            )?,
            shutdown_timeout: env_secs("DIRECTOR_SHUTDOWN_TIMEOUT_SECS", defaults.shutdown_timeout)?,
            manual_intervention_check: env_secs(
                "DIRECTOR_MANUAL_INTERVENTION_CHECK_SECS",
                defaults.manual_intervention_check,
            )?,
            wait_after_containers_removal: env_secs(
                "DIRECTOR_WAIT_AFTER_CONTAINERS_REMOVAL_SECS",
                defaults.wait_after_containers_removal,
            )?,
            rclone_mounts_enabled: env_flag("DIRECTOR_RCLONE_MOUNTS_ENABLED", false),
            node_rights_enabled: env_flag("DIRECTOR_NODE_RIGHTS_ENABLED", true),
        };

        let rights_defaults = NodeRightsConfig::default();
        let node_rights = NodeRightsConfig {
            redis_url: std::env::var("DIRECTOR_REDIS_URL")
                .ok()
                .filter(|v| !v.is_empty()),
            default_slots: env_or("DIRECTOR_NODE_RIGHTS_SLOTS", rights_defaults.default_slots)?,
            lock_ttl: env_secs("DIRECTOR_NODE_RIGHTS_LOCK_TTL_SECS", rights_defaults.lock_ttl)?,
            key_prefix: std::env::var("DIRECTOR_NODE_RIGHTS_PREFIX")
                .unwrap_or(rights_defaults.key_prefix),
        };
        if node_rights.default_slots == 0 {
            anyhow::bail!("DIRECTOR_NODE_RIGHTS_SLOTS must be at least 1");
        }

        let remote_storage = match (
            std::env::var("DIRECTOR_REMOTE_STORAGE_ENDPOINT"),
            std::env::var("DIRECTOR_REMOTE_STORAGE_BUCKET"),
        ) {
            (Ok(endpoint), Ok(bucket)) => Some(RemoteStorage {
                endpoint,
                bucket,
                access_key: std::env::var("DIRECTOR_REMOTE_STORAGE_ACCESS_KEY").unwrap_or_default(),
                secret_key: std::env::var("DIRECTOR_REMOTE_STORAGE_SECRET_KEY").unwrap_or_default(),
            }),
            _ => None,
        };
        if scheduler.rclone_mounts_enabled && remote_storage.is_none() {
            anyhow::bail!(
                "DIRECTOR_RCLONE_MOUNTS_ENABLED requires DIRECTOR_REMOTE_STORAGE_ENDPOINT and DIRECTOR_REMOTE_STORAGE_BUCKET"
            );
        }

        let placement_constraints = std::env::var("DIRECTOR_PLACEMENT_CONSTRAINTS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            listen_addr,
            log_level,
            docker_socket: std::env::var("DIRECTOR_DOCKER_SOCKET")
                .unwrap_or_else(|_| "/var/run/docker.sock".to_string())
                .into(),
            swarm_stack_name: std::env::var("DIRECTOR_SWARM_STACK_NAME")
                .unwrap_or_else(|_| "simcore".to_string()),
            swarm_network_name: std::env::var("DIRECTOR_SWARM_NETWORK_NAME")
                .unwrap_or_else(|_| "interactive_services_subnet".to_string()),
            placement_constraints,
            sidecar_image: std::env::var("DIRECTOR_SIDECAR_IMAGE")
                .unwrap_or_else(|_| "local/dynamic-sidecar:production".to_string()),
            proxy_image: std::env::var("DIRECTOR_PROXY_IMAGE")
                .unwrap_or_else(|_| "caddy:2.7.6-alpine".to_string()),
            sidecar_port: env_or("DIRECTOR_SIDECAR_PORT", 8000)?,
            proxy_admin_port: env_or("DIRECTOR_PROXY_ADMIN_PORT", 2019)?,
            registry: std::env::var("DIRECTOR_REGISTRY")
                .unwrap_or_else(|_| "registry.osparc.local".to_string()),
            remote_storage,
            scheduler,
            node_rights,
            janitor_interval: env_secs("DIRECTOR_JANITOR_INTERVAL_SECS", Duration::from_secs(60))?,
        })
    }

    /// Built-in defaults for one stack, without reading the environment.
    pub fn for_stack(swarm_stack_name: impl Into<String>) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_level: "info".to_string(),
            docker_socket: "/var/run/docker.sock".into(),
            swarm_stack_name: swarm_stack_name.into(),
            swarm_network_name: "interactive_services_subnet".to_string(),
            placement_constraints: Vec::new(),
            sidecar_image: "local/dynamic-sidecar:production".to_string(),
            proxy_image: "caddy:2.7.6-alpine".to_string(),
            sidecar_port: 8000,
            proxy_admin_port: 2019,
            registry: "registry.osparc.local".to_string(),
            remote_storage: None,
            scheduler: SchedulerConfig::default(),
            node_rights: NodeRightsConfig::default(),
            janitor_interval: Duration::from_secs(60),
        }
    }
}

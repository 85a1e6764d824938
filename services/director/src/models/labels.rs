//! Label keys written on swarm services owned by the scheduler.

/// Stack membership; discovery and the janitor filter on it.
pub const SWARM_STACK_NAME: &str = "swarm_stack_name";
pub const UUID: &str = "uuid";
/// `main` for the sidecar, `dependency` for the proxy.
pub const SERVICE_TYPE: &str = "type";
pub const USER_ID: &str = "user_id";
pub const STUDY_ID: &str = "study_id";
pub const SERVICE_KEY: &str = "service_key";
pub const SERVICE_VERSION: &str = "service_version";
pub const RUN_ID: &str = "run_id";
/// JSON snapshot of the instance's `SchedulerData`, the only recovery record.
pub const SCHEDULER_DATA: &str = "io.simcore.scheduler-data";
/// Declared runtime of a volume-remover helper, in seconds.
pub const SERVICE_TIMEOUT_S: &str = "service_timeout_s";

pub const TYPE_MAIN: &str = "main";
pub const TYPE_DEPENDENCY: &str = "dependency";

//! Per-instance state and the naming scheme of its cluster resources.

pub mod labels;
mod names;
mod scheduler_data;

pub use names::{
    proxy_service_name, sidecar_network_name, sidecar_service_name, volume_remover_service_name,
    ServiceName, MAX_SERVICE_NAME_LENGTH, PROXY_SERVICE_PREFIX, SIDECAR_SERVICE_PREFIX,
    VOLUME_REMOVER_PREFIX,
};
pub use scheduler_data::{
    ContainerInspect, ContainerState, DynamicSidecar, DynamicSidecarStatus, Instrumentation,
    NewInstance, PathMappings, RestartPolicy, SchedulerData, ServiceRemovalState,
    ServiceResources, Status,
};

#[cfg(test)]
pub(crate) use scheduler_data::fixtures;

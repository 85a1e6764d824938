use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{SidecarApi, SidecarError, SidecarResult, VolumeCategory, VolumeStatus};
use crate::models::{ContainerInspect, ContainerState};

#[derive(Default)]
struct Inner {
    unhealthy: bool,
    fail_inspect: bool,
    fail_save: bool,
    fail_push: bool,
    latency: Option<Duration>,
    containers: HashMap<String, Vec<ContainerInspect>>,
    entrypoints: HashMap<String, String>,
    volume_states: HashMap<String, Vec<(VolumeCategory, VolumeStatus)>>,
    attached: HashMap<String, HashSet<String>>,
    output_dirs: HashMap<String, Vec<String>>,
    calls: Vec<(String, &'static str)>,
    in_flight: HashMap<(String, &'static str), usize>,
    max_in_flight: HashMap<(String, &'static str), usize>,
}

/// Scripted sidecar for tests.
///
/// Tracks how many calls of each operation are in flight per endpoint, so
/// tests can check that one instance never sees overlapping reconciliations.
#[derive(Clone, Default)]
pub struct MockSidecar {
    inner: Arc<Mutex<Inner>>,
}

struct InFlight {
    inner: Arc<Mutex<Inner>>,
    key: (String, &'static str),
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = inner.in_flight.get_mut(&self.key) {
            *count = count.saturating_sub(1);
        }
    }
}

fn injected(endpoint: &str, op: &str) -> SidecarError {
    SidecarError::Api {
        url: format!("{endpoint}/{op}"),
        status: 500,
        body: "injected failure".to_string(),
    }
}

impl MockSidecar {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enter(&self, endpoint: &str, op: &'static str) -> InFlight {
        let latency = {
            let mut inner = self.lock();
            inner.calls.push((endpoint.to_string(), op));
            let key = (endpoint.to_string(), op);
            let count = inner.in_flight.entry(key.clone()).or_insert(0);
            *count += 1;
            let current = *count;
            let max = inner.max_in_flight.entry(key).or_insert(0);
            *max = (*max).max(current);
            inner.latency
        };
        let guard = InFlight {
            inner: self.inner.clone(),
            key: (endpoint.to_string(), op),
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        guard
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.lock().unhealthy = !healthy;
    }

    pub fn fail_inspect(&self, fail: bool) {
        self.lock().fail_inspect = fail;
    }

    pub fn fail_save_state(&self, fail: bool) {
        self.lock().fail_save = fail;
    }

    pub fn fail_push_outputs(&self, fail: bool) {
        self.lock().fail_push = fail;
    }

    /// Every call sleeps this long before answering.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    pub fn set_container_state(&self, endpoint: &str, state: ContainerState) {
        let mut inner = self.lock();
        if let Some(containers) = inner.containers.get_mut(endpoint) {
            for container in containers {
                container.status = state;
            }
        }
    }

    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|(_, o)| *o == op).count()
    }

    pub fn calls_for(&self, endpoint: &str) -> Vec<&'static str> {
        self.lock()
            .calls
            .iter()
            .filter(|(e, _)| e == endpoint)
            .map(|(_, op)| *op)
            .collect()
    }

    /// Highest number of simultaneous `op` calls seen for `endpoint`.
    pub fn max_concurrent_calls(&self, endpoint: &str, op: &'static str) -> usize {
        self.lock()
            .max_in_flight
            .get(&(endpoint.to_string(), op))
            .copied()
            .unwrap_or(0)
    }

    pub fn volume_states(&self, endpoint: &str) -> Vec<(VolumeCategory, VolumeStatus)> {
        self.lock()
            .volume_states
            .get(endpoint)
            .cloned()
            .unwrap_or_default()
    }

    /// Port keys of the last `create_output_dirs` call for `endpoint`.
    pub fn output_dirs(&self, endpoint: &str) -> Vec<String> {
        self.lock()
            .output_dirs
            .get(endpoint)
            .cloned()
            .unwrap_or_default()
    }

    pub fn attached_networks(&self, endpoint: &str) -> HashSet<String> {
        self.lock()
            .attached
            .get(endpoint)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SidecarApi for MockSidecar {
    async fn is_healthy(&self, endpoint: &str) -> SidecarResult<bool> {
        let _call = self.enter(endpoint, "is_healthy").await;
        let healthy = !self.lock().unhealthy;
        Ok(healthy)
    }

    async fn containers_inspect(&self, endpoint: &str) -> SidecarResult<Vec<ContainerInspect>> {
        let _call = self.enter(endpoint, "containers_inspect").await;
        let inner = self.lock();
        if inner.fail_inspect {
            return Err(injected(endpoint, "containers_inspect"));
        }
        Ok(inner.containers.get(endpoint).cloned().unwrap_or_default())
    }

    async fn create_containers(&self, endpoint: &str, _compose_spec: &str) -> SidecarResult<()> {
        let _call = self.enter(endpoint, "create_containers").await;
        let host = endpoint
            .trim_start_matches("http://")
            .split(':')
            .next()
            .unwrap_or(endpoint);
        let name = format!("{host}-entrypoint");
        let mut inner = self.lock();
        inner.containers.insert(
            endpoint.to_string(),
            vec![ContainerInspect {
                id: format!("ctr-{host}"),
                name: name.clone(),
                status: ContainerState::Running,
            }],
        );
        inner.entrypoints.insert(endpoint.to_string(), name);
        Ok(())
    }

    async fn stop_service(&self, endpoint: &str) -> SidecarResult<()> {
        let _call = self.enter(endpoint, "stop_service").await;
        let mut inner = self.lock();
        inner.containers.remove(endpoint);
        inner.entrypoints.remove(endpoint);
        Ok(())
    }

    async fn restart_containers(&self, endpoint: &str) -> SidecarResult<()> {
        let _call = self.enter(endpoint, "restart_containers").await;
        Ok(())
    }

    async fn pull_user_services_images(&self, endpoint: &str) -> SidecarResult<()> {
        let _call = self.enter(endpoint, "pull_user_services_images").await;
        Ok(())
    }

    async fn entrypoint_container_name(
        &self,
        endpoint: &str,
        _network_name: &str,
    ) -> SidecarResult<Option<String>> {
        let _call = self.enter(endpoint, "entrypoint_container_name").await;
        let name = self.lock().entrypoints.get(endpoint).cloned();
        Ok(name)
    }

    async fn set_outputs_watcher(&self, endpoint: &str, _enabled: bool) -> SidecarResult<()> {
        let _call = self.enter(endpoint, "set_outputs_watcher").await;
        Ok(())
    }

    async fn create_output_dirs(&self, endpoint: &str, port_keys: &[String]) -> SidecarResult<()> {
        let _call = self.enter(endpoint, "create_output_dirs").await;
        self.lock()
            .output_dirs
            .insert(endpoint.to_string(), port_keys.to_vec());
        Ok(())
    }

    async fn pull_service_input_ports(
        &self,
        endpoint: &str,
        _port_keys: Option<&[String]>,
    ) -> SidecarResult<u64> {
        let _call = self.enter(endpoint, "pull_service_input_ports").await;
        Ok(0)
    }

    async fn pull_service_output_ports(&self, endpoint: &str) -> SidecarResult<u64> {
        let _call = self.enter(endpoint, "pull_service_output_ports").await;
        Ok(0)
    }

    async fn push_service_output_ports(&self, endpoint: &str) -> SidecarResult<()> {
        let _call = self.enter(endpoint, "push_service_output_ports").await;
        if self.lock().fail_push {
            return Err(injected(endpoint, "push_service_output_ports"));
        }
        Ok(())
    }

    async fn restore_service_state(&self, endpoint: &str) -> SidecarResult<u64> {
        let _call = self.enter(endpoint, "restore_service_state").await;
        Ok(0)
    }

    async fn save_service_state(&self, endpoint: &str) -> SidecarResult<u64> {
        let _call = self.enter(endpoint, "save_service_state").await;
        if self.lock().fail_save {
            return Err(injected(endpoint, "save_service_state"));
        }
        Ok(0)
    }

    async fn update_volume_state(
        &self,
        endpoint: &str,
        category: VolumeCategory,
        status: VolumeStatus,
    ) -> SidecarResult<()> {
        let _call = self.enter(endpoint, "update_volume_state").await;
        self.lock()
            .volume_states
            .entry(endpoint.to_string())
            .or_default()
            .push((category, status));
        Ok(())
    }

    async fn free_reserved_disk_space(&self, endpoint: &str) -> SidecarResult<()> {
        let _call = self.enter(endpoint, "free_reserved_disk_space").await;
        Ok(())
    }

    async fn attach_container_to_network(
        &self,
        endpoint: &str,
        _container_id: &str,
        network_id: &str,
        _aliases: &[String],
    ) -> SidecarResult<()> {
        let _call = self.enter(endpoint, "attach_container_to_network").await;
        self.lock()
            .attached
            .entry(endpoint.to_string())
            .or_default()
            .insert(network_id.to_string());
        Ok(())
    }

    async fn detach_container_from_network(
        &self,
        endpoint: &str,
        _container_id: &str,
        network_id: &str,
    ) -> SidecarResult<()> {
        let _call = self.enter(endpoint, "detach_container_from_network").await;
        {
            let mut inner = self.lock();
            if let Some(networks) = inner.attached.get_mut(endpoint) {
                networks.remove(network_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_inspect() {
        let sidecar = MockSidecar::new();
        let endpoint = "http://dy-sidecar_x:8000";
        sidecar.create_containers(endpoint, "{}").await.unwrap();

        let containers = sidecar.containers_inspect(endpoint).await.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(
            sidecar.entrypoint_container_name(endpoint, "net").await.unwrap(),
            Some("dy-sidecar_x-entrypoint".to_string())
        );
        assert_eq!(sidecar.calls("create_containers"), 1);
        assert_eq!(sidecar.max_concurrent_calls(endpoint, "create_containers"), 1);
    }

    #[tokio::test]
    async fn test_health_answers_release_the_call_slot() {
        let sidecar = MockSidecar::new();
        let endpoint = "http://dy-sidecar_y:8000";
        let answer = tokio::time::timeout(Duration::from_secs(5), async {
            let first = sidecar.is_healthy(endpoint).await.unwrap();
            sidecar.set_healthy(false);
            let second = sidecar.is_healthy(endpoint).await.unwrap();
            (first, second)
        })
        .await
        .expect("is_healthy must not block");
        assert_eq!(answer, (true, false));

        let name = tokio::time::timeout(
            Duration::from_secs(5),
            sidecar.entrypoint_container_name(endpoint, "net"),
        )
        .await
        .expect("entrypoint lookup must not block")
        .unwrap();
        assert!(name.is_none());
        assert_eq!(sidecar.max_concurrent_calls(endpoint, "is_healthy"), 1);
    }

    #[tokio::test]
    async fn test_injected_save_failure() {
        let sidecar = MockSidecar::new();
        sidecar.fail_save_state(true);
        assert!(sidecar.save_service_state("http://a:1").await.is_err());
    }
}

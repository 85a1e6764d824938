use std::sync::Arc;
use std::time::Duration;

use dynsched_swarm::SwarmApi;
use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::docker_api;

pub struct VolumeRemovalJanitor {
    swarm: Arc<dyn SwarmApi>,
    swarm_stack_name: String,
    interval: Duration,
}

impl VolumeRemovalJanitor {
    pub fn new(swarm: Arc<dyn SwarmApi>, swarm_stack_name: String, interval: Duration) -> Self {
        Self {
            swarm,
            swarm_stack_name,
            interval,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            swarm_stack_name = %self.swarm_stack_name,
            "Starting volume removal janitor"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cleanup().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Volume removal janitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub async fn run_cleanup(&self) -> usize {
        match docker_api::remove_pending_volume_removal_services(self.swarm.as_ref(), &self.swarm_stack_name)
            .await
        {
            Ok(0) => 0,
            Ok(count) => {
                info!(removed = count, "Removed stuck volume removers");
                count
            }
            Err(e) => {
                error!(error = %e, "Failed to clean up volume removers");
                0
            }
        }
    }
}

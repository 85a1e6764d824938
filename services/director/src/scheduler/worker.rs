use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument};

use super::registry::Inner;
use crate::models::ServiceName;

/// Enqueues every tracked instance once per interval.
pub(super) struct Ticker {
    inner: Arc<Inner>,
    interval: Duration,
}

impl Ticker {
    pub(super) fn new(inner: Arc<Inner>, interval: Duration) -> Self {
        Self { inner, interval }
    }

    #[instrument(skip(self, shutdown))]
    pub(super) async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting scheduler ticker");

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let names = self.inner.tracked_names().await;
                    debug!(tracked = names.len(), "Enqueueing tracked instances");
                    for name in names {
                        self.inner.enqueue(name);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler ticker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Starts a reconciliation for each enqueued instance that has none running.
pub(super) struct Dispatcher {
    inner: Arc<Inner>,
    queue: mpsc::UnboundedReceiver<ServiceName>,
}

impl Dispatcher {
    pub(super) fn new(inner: Arc<Inner>, queue: mpsc::UnboundedReceiver<ServiceName>) -> Self {
        Self { inner, queue }
    }

    #[instrument(skip(self, shutdown))]
    pub(super) async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting scheduler dispatcher");

        loop {
            tokio::select! {
                next = self.queue.recv() => match next {
                    Some(service_name) => self.inner.dispatch(service_name),
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler dispatcher shutting down");
                        break;
                    }
                }
            }
        }
    }
}

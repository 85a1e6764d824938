//! Per-node concurrency limits for heavy operations.
//!
//! Every (node, resource) pair owns a fixed number of slots. A slot is one
//! distributed lock named `<prefix>:<node>:<resource>:slot-<n>`. Acquisition
//! tries each slot once and never waits: when every slot is taken the caller
//! gets [`NodeRightsError::NoCapacity`] and is expected to come back on its
//! next reconciliation cycle.
//!
//! A held slot is kept alive by a renewal task that extends the lock every
//! TTL/2. [`SlotGuard::release`] stops that task (bounded wait) before giving
//! the lock back. If an extension finds the lock owned by someone else the
//! guard is flagged as lost and [`SlotGuard::lost`] resolves.

mod backend;
mod redis_backend;

use std::sync::Arc;
use std::time::Duration;

use dynsched_id::LockToken;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

pub use self::backend::{InMemoryLockBackend, LockBackend, LockBackendError};
pub use self::redis_backend::RedisLockBackend;
use crate::config::NodeRightsConfig;

/// Saving and restoring state, pulling and pushing ports.
pub const RESOURCE_STATE_AND_INPUTS: &str = "state_and_inputs";

#[derive(Debug, Error)]
pub enum NodeRightsError {
    #[error("no free slot for '{resource}' on node {node}")]
    NoCapacity { node: String, resource: String },

    #[error("node rights lock {lock} expired while held")]
    Lost { lock: String },

    #[error("lock service error: {0}")]
    Backend(#[from] LockBackendError),
}

impl NodeRightsError {
    pub fn is_no_capacity(&self) -> bool {
        matches!(self, Self::NoCapacity { .. })
    }
}

pub struct NodeRightsManager {
    backend: Arc<dyn LockBackend>,
    prefix: String,
    default_slots: u32,
    lock_ttl: Duration,
}

impl NodeRightsManager {
    pub fn new(backend: Arc<dyn LockBackend>, config: &NodeRightsConfig) -> Self {
        Self {
            backend,
            prefix: config.key_prefix.clone(),
            default_slots: config.default_slots,
            lock_ttl: config.lock_ttl,
        }
    }

    /// Redis when a URL is configured, otherwise locks local to this process.
    pub async fn from_config(config: &NodeRightsConfig) -> Result<Self, NodeRightsError> {
        let backend: Arc<dyn LockBackend> = match &config.redis_url {
            Some(url) => Arc::new(RedisLockBackend::connect(url).await?),
            None => {
                info!("No lock service configured, node rights are local to this process");
                Arc::new(InMemoryLockBackend::new())
            }
        };
        Ok(Self::new(backend, config))
    }

    fn resource_key(&self, node: &str, resource: &str) -> String {
        format!("{}:{node}:{resource}", self.prefix)
    }

    pub fn lock_name(&self, node: &str, resource: &str, slot: u32) -> String {
        format!("{}:slot-{slot}", self.resource_key(node, resource))
    }

    /// Take a free slot or fail straight away.
    #[instrument(skip(self))]
    pub async fn acquire(&self, node: &str, resource: &str) -> Result<SlotGuard, NodeRightsError> {
        let slots_key = format!("{}:slots", self.resource_key(node, resource));
        let slots = self.backend.slots(&slots_key, self.default_slots).await?;
        let token = LockToken::new().to_string();

        for slot in 0..slots {
            let name = self.lock_name(node, resource, slot);
            if self.backend.try_acquire(&name, &token, self.lock_ttl).await? {
                debug!(lock = %name, "Acquired node rights");
                return Ok(SlotGuard::start(
                    Arc::clone(&self.backend),
                    name,
                    token,
                    self.lock_ttl,
                ));
            }
        }

        Err(NodeRightsError::NoCapacity {
            node: node.to_string(),
            resource: resource.to_string(),
        })
    }
}

// =============================================================================
// Slot guard
// =============================================================================

struct Renewal {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// A held slot. Call [`release`](Self::release) when done; dropping the guard
/// also gives the slot back, on a detached task.
pub struct SlotGuard {
    backend: Arc<dyn LockBackend>,
    name: String,
    token: String,
    renewal: Option<Renewal>,
    lost: watch::Receiver<bool>,
    release_timeout: Duration,
    released: bool,
}

impl SlotGuard {
    fn start(backend: Arc<dyn LockBackend>, name: String, token: String, ttl: Duration) -> Self {
        let (stop, mut stopped) = oneshot::channel();
        let (lost_tx, lost) = watch::channel(false);
        let handle = tokio::spawn({
            let backend = Arc::clone(&backend);
            let name = name.clone();
            let token = token.clone();
            async move {
                let period = ttl / 2;
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(period) => {
                            match backend.extend(&name, &token, ttl).await {
                                Ok(true) => {}
                                Ok(false) => {
                                    warn!(lock = %name, "Lost node rights lock before release");
                                    let _ = lost_tx.send(true);
                                    break;
                                }
                                Err(e) => warn!(lock = %name, error = %e, "Failed to extend node rights lock"),
                            }
                        }
                        _ = &mut stopped => break,
                    }
                }
            }
        });

        Self {
            backend,
            name,
            token,
            renewal: Some(Renewal { stop, handle }),
            lost,
            release_timeout: ttl,
            released: false,
        }
    }

    pub fn lock_name(&self) -> &str {
        &self.name
    }

    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// Resolves once the lock was found taken by another owner. Pending
    /// forever while the slot is still held.
    pub async fn lost(&self) -> NodeRightsError {
        let mut lost = self.lost.clone();
        let flagged = lost.wait_for(|lost| *lost).await.is_ok();
        if !flagged {
            // renewal stopped without losing the lock
            std::future::pending::<()>().await;
        }
        NodeRightsError::Lost {
            lock: self.name.clone(),
        }
    }

    /// Stop renewing and give the slot back. Safe to call more than once.
    pub async fn release(&mut self) -> Result<(), NodeRightsError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        if let Some(renewal) = self.renewal.take() {
            let _ = renewal.stop.send(());
            match tokio::time::timeout(self.release_timeout, renewal.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(lock = %self.name, error = %e, "Lock renewal task failed"),
                Err(_) => warn!(lock = %self.name, "Timed out stopping lock renewal"),
            }
        }

        if !self.backend.release(&self.name, &self.token).await? {
            debug!(lock = %self.name, "Node rights lock had already expired");
        }
        Ok(())
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(renewal) = self.renewal.take() {
            renewal.handle.abort();
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let backend = Arc::clone(&self.backend);
        let name = std::mem::take(&mut self.name);
        let token = std::mem::take(&mut self.token);
        runtime.spawn(async move {
            if let Err(e) = backend.release(&name, &token).await {
                warn!(lock = %name, error = %e, "Failed to release dropped node rights lock");
            }
        });
    }
}

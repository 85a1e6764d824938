use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum LockBackendError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// A lock service offering named, owner-tagged, expiring locks.
///
/// Every operation is non-blocking: it either succeeds immediately or reports
/// that the lock belongs to someone else.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Take `name` for `token` unless someone holds it.
    async fn try_acquire(&self, name: &str, token: &str, ttl: Duration) -> Result<bool, LockBackendError>;

    /// Push the expiry of a lock still owned by `token`.
    async fn extend(&self, name: &str, token: &str, ttl: Duration) -> Result<bool, LockBackendError>;

    /// Drop the lock if `token` still owns it.
    async fn release(&self, name: &str, token: &str) -> Result<bool, LockBackendError>;

    /// Slot count stored at `key`, initialising it to `default` when absent.
    async fn slots(&self, key: &str, default: u32) -> Result<u32, LockBackendError>;
}

// =============================================================================
// In-process backend
// =============================================================================

/// Lock table local to this process. Honours TTLs like the real service.
#[derive(Default)]
pub struct InMemoryLockBackend {
    locks: Mutex<HashMap<String, (String, Instant)>>,
    slots: Mutex<HashMap<String, u32>>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the slot count of a key, like an operator would.
    pub fn set_slots(&self, key: &str, slots: u32) {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), slots);
    }

    /// Drop a lock whoever holds it, like an expired lease would.
    pub fn force_release(&self, name: &str) {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    pub fn holder(&self, name: &str) -> Option<String> {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .get(name)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(token, _)| token.clone())
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(&self, name: &str, token: &str, ttl: Duration) -> Result<bool, LockBackendError> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match locks.get(name) {
            Some((_, expires)) if *expires > now => Ok(false),
            _ => {
                locks.insert(name.to_string(), (token.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn extend(&self, name: &str, token: &str, ttl: Duration) -> Result<bool, LockBackendError> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match locks.get_mut(name) {
            Some((owner, expires)) if owner == token && *expires > now => {
                *expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, token: &str) -> Result<bool, LockBackendError> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(name).is_some_and(|(owner, _)| owner == token) {
            locks.remove(name);
            return Ok(true);
        }
        Ok(false)
    }

    async fn slots(&self, key: &str, default: u32) -> Result<u32, LockBackendError> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Ok(*slots.entry(key.to_string()).or_insert(default))
    }
}

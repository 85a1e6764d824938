//! Redis lock backend.
//!
//! Locks are plain keys set with `NX PX`; the value is the owner token.
//! Extending and releasing go through scripts so they only touch a key the
//! caller still owns.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;
use tracing::debug;

use super::backend::{LockBackend, LockBackendError};

const EXTEND_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

pub struct RedisLockBackend {
    connection: MultiplexedConnection,
    extend_script: Script,
    release_script: Script,
}

impl RedisLockBackend {
    pub async fn connect(url: &str) -> Result<Self, LockBackendError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        debug!("Connected to redis lock service");
        Ok(Self {
            connection,
            extend_script: Script::new(EXTEND_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        })
    }
}

fn millis(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_acquire(&self, name: &str, token: &str, ttl: Duration) -> Result<bool, LockBackendError> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn extend(&self, name: &str, token: &str, ttl: Duration) -> Result<bool, LockBackendError> {
        let mut conn = self.connection.clone();
        let extended: i64 = self
            .extend_script
            .key(name)
            .arg(token)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn release(&self, name: &str, token: &str) -> Result<bool, LockBackendError> {
        let mut conn = self.connection.clone();
        let deleted: i64 = self
            .release_script
            .key(name)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn slots(&self, key: &str, default: u32) -> Result<u32, LockBackendError> {
        let mut conn = self.connection.clone();
        let _: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(default)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        match raw {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| LockBackendError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        }
    }
}

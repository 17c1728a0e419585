//! Redis storage backend.
//!
//! Counters live under the raw identity key and block markers under
//! `blocked:<key>`, so both kinds of state share one keyspace without
//! colliding.

use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{
    AsyncCommands, Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, Script,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, error, info, trace};

use super::{blocked_key, Storage};
use crate::config::RedisConfig;
use crate::error::{Result, StorageError, TurnstileError};

/// Increments the counter and arms its expiry only when the key carries no
/// TTL, i.e. when this call created the window.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Storage backed by a shared Redis instance.
pub struct RedisStorage {
    /// Auto-reconnecting connection; `None` once shut down
    connection: RwLock<Option<ConnectionManager>>,
    increment_script: Script,
}

impl RedisStorage {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(connection_info(config))
            .map_err(|e| TurnstileError::Storage(e.into()))?;

        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        let connect = async {
            let mut manager = ConnectionManager::new(client).await?;
            ::redis::cmd("PING")
                .query_async::<_, String>(&mut manager)
                .await?;
            Ok::<_, ::redis::RedisError>(manager)
        };

        let manager = tokio::time::timeout(connect_timeout, connect)
            .await
            .map_err(StorageError::from)?
            .map_err(|e| {
                error!(host = %config.host, port = config.port, error = %e, "Failed to connect to Redis");
                StorageError::from(e)
            })?;

        info!(
            host = %config.host,
            port = config.port,
            db = config.db,
            "Connected to Redis"
        );

        Ok(Self {
            connection: RwLock::new(Some(manager)),
            increment_script: Script::new(INCREMENT_SCRIPT),
        })
    }

    /// Clone the shared connection handle without holding the lock across I/O.
    fn connection(&self) -> std::result::Result<ConnectionManager, StorageError> {
        self.connection
            .read()
            .clone()
            .ok_or_else(|| StorageError::Unavailable("storage has been shut down".to_string()))
    }
}

fn connection_info(config: &RedisConfig) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
        redis: RedisConnectionInfo {
            db: config.db,
            password: config.password.clone().filter(|p| !p.is_empty()),
            ..Default::default()
        },
    }
}

fn millis(duration: Duration) -> u64 {
    // Redis rejects a zero expiry.
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl Storage for RedisStorage {
    async fn increment(&self, key: &str, window: Duration) -> std::result::Result<u64, StorageError> {
        let mut conn = self.connection()?;
        let count: u64 = self
            .increment_script
            .key(key)
            .arg(millis(window))
            .invoke_async(&mut conn)
            .await?;

        trace!(count, "Incremented Redis counter");
        Ok(count)
    }

    async fn is_blocked(&self, key: &str) -> std::result::Result<bool, StorageError> {
        let mut conn = self.connection()?;
        let exists: bool = conn.exists(blocked_key(key)).await?;
        Ok(exists)
    }

    async fn block(&self, key: &str, duration: Duration) -> std::result::Result<(), StorageError> {
        let mut conn = self.connection()?;
        ::redis::cmd("SET")
            .arg(blocked_key(key))
            .arg(1)
            .arg("PX")
            .arg(millis(duration))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn clear_counter(&self, key: &str) -> std::result::Result<(), StorageError> {
        let mut conn = self.connection()?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn reset(&self, key: &str) -> std::result::Result<(), StorageError> {
        let mut conn = self.connection()?;
        // One DEL keeps the removal of both keys atomic.
        conn.del::<_, ()>(vec![key.to_string(), blocked_key(key)]).await?;
        Ok(())
    }

    async fn shutdown(&self) -> std::result::Result<(), StorageError> {
        if self.connection.write().take().is_some() {
            debug!("Redis connection released");
        }
        Ok(())
    }
}

//! Storage gateway for rate limit counters and block markers.
//!
//! The decision engine only ever talks to the [`Storage`] trait. Any backend
//! that honours its atomicity and expiry rules can sit behind it; the
//! in-memory and Redis variants are interchangeable apart from latency and
//! failure modes.

mod memory;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{Result, StorageError};

pub use self::memory::MemoryStorage;
pub use self::redis::RedisStorage;

/// Namespace tag separating block markers from counters in a shared keyspace.
pub const BLOCKED_PREFIX: &str = "blocked:";

/// Key under which the block marker for `key` is stored.
pub fn blocked_key(key: &str) -> String {
    format!("{}{}", BLOCKED_PREFIX, key)
}

/// Trait for counter and block storage implementations.
///
/// Every operation is keyed by an opaque identity string. Implementations
/// must make `increment` atomic per key and keep `block`, `is_blocked`,
/// `clear_counter` and `reset` linearizable per key; nothing is required
/// across keys.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Add one to the counter for `key` and return the new count.
    ///
    /// A missing or expired counter starts over at 1 and expires `window`
    /// from now. Later increments within the window leave the expiry alone.
    async fn increment(&self, key: &str, window: Duration) -> std::result::Result<u64, StorageError>;

    /// Whether a live block marker exists for `key`.
    async fn is_blocked(&self, key: &str) -> std::result::Result<bool, StorageError>;

    /// Block `key` until `duration` from now, replacing any earlier marker.
    async fn block(&self, key: &str, duration: Duration) -> std::result::Result<(), StorageError>;

    /// Remove the counter for `key`, leaving any block marker in place.
    async fn clear_counter(&self, key: &str) -> std::result::Result<(), StorageError>;

    /// Remove both the counter and the block marker for `key`.
    async fn reset(&self, key: &str) -> std::result::Result<(), StorageError>;

    /// Release held resources. Calling it more than once is harmless.
    async fn shutdown(&self) -> std::result::Result<(), StorageError>;
}

/// Build the backend selected in the configuration.
///
/// Failing to reach a remote backend here is fatal to startup; there is no
/// retry at this layer. The in-memory backend gets a background sweeper on
/// the current runtime, so this must be called from within one.
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    match config.backend {
        StorageBackend::Redis => {
            let storage = RedisStorage::connect(&config.redis).await?;
            Ok(Arc::new(storage))
        }
        StorageBackend::Memory => {
            info!(
                sweep_interval_secs = config.sweep_interval_secs,
                "Using in-memory storage; counters are local to this process"
            );
            let storage = Arc::new(MemoryStorage::new());
            storage.spawn_sweeper(Duration::from_secs(config.sweep_interval_secs));
            Ok(storage)
        }
    }
}

//! Rate decision engine.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::caller::{Caller, Dimension};
use super::decision::{Decision, RejectReason};
use crate::error::StorageError;
use crate::storage::Storage;

/// Length of the fixed counting window.
pub const WINDOW: Duration = Duration::from_secs(1);

/// Limits the engine is constructed with. Immutable for the engine's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterSettings {
    /// Requests admitted per address per window
    pub address_limit: u64,
    /// Requests admitted per token per window
    pub token_limit: u64,
    /// How long a key stays blocked after exceeding its limit
    pub block_duration: Duration,
}

impl LimiterSettings {
    fn limit_for(&self, dimension: Dimension) -> u64 {
        match dimension {
            Dimension::Address => self.address_limit,
            Dimension::Token => self.token_limit,
        }
    }
}

/// Decides whether a request is admitted.
///
/// The limiter keeps no per-key state of its own, so one instance can be
/// shared across all request handlers. Every storage failure rejects the
/// request.
pub struct RateLimiter {
    storage: Arc<dyn Storage>,
    settings: LimiterSettings,
    /// Deadline applied to each individual storage call
    operation_timeout: Option<Duration>,
}

impl RateLimiter {
    /// Create a new rate limiter over the given storage.
    pub fn new(storage: Arc<dyn Storage>, settings: LimiterSettings) -> Self {
        Self {
            storage,
            settings,
            operation_timeout: None,
        }
    }

    /// Bound every storage call by `timeout`; a call that overruns counts as
    /// a storage failure.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    /// Check and count one request.
    ///
    /// `token` is authoritative when non-empty; `address` is only consulted
    /// when no token was supplied.
    pub async fn decide(&self, address: &str, token: &str) -> Decision {
        let caller = Caller::resolve(address, token);

        match self.check(caller).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    dimension = %caller.dimension,
                    error = %e,
                    "Rate limit storage failure, rejecting request"
                );
                Decision::Reject(RejectReason::StorageFailure)
            }
        }
    }

    async fn check(&self, caller: Caller<'_>) -> Result<Decision, StorageError> {
        let key = caller.key;

        // An already-blocked key must not touch its counter.
        if self.call(self.storage.is_blocked(key)).await? {
            debug!(
                dimension = %caller.dimension,
                address = display_key(&caller),
                "Request from blocked caller"
            );
            return Ok(Decision::Reject(RejectReason::blocked(caller.dimension)));
        }

        let count = self.call(self.storage.increment(key, WINDOW)).await?;
        let limit = self.settings.limit_for(caller.dimension);

        trace!(
            dimension = %caller.dimension,
            count,
            limit,
            "Counted request"
        );

        if count <= limit {
            return Ok(Decision::Allow);
        }

        // Without an established block there is nothing to report but failure.
        self.call(self.storage.block(key, self.settings.block_duration))
            .await?;

        warn!(
            dimension = %caller.dimension,
            address = display_key(&caller),
            count,
            limit,
            block_secs = self.settings.block_duration.as_secs(),
            "Rate limit exceeded, caller blocked"
        );

        // The caller starts from zero once the block lapses; the block itself stays.
        if let Err(e) = self.call(self.storage.clear_counter(key)).await {
            warn!(
                dimension = %caller.dimension,
                error = %e,
                "Failed to clear counter after blocking"
            );
        }

        Ok(Decision::Reject(RejectReason::limit_exceeded(caller.dimension)))
    }

    async fn call<T, F>(&self, operation: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        match self.operation_timeout {
            Some(timeout) => tokio::time::timeout(timeout, operation).await?,
            None => operation.await,
        }
    }

    /// Release the underlying storage. Call once during orderly teardown.
    pub async fn shutdown(&self) -> Result<(), StorageError> {
        self.storage.shutdown().await
    }
}

/// Addresses are safe to log; tokens are credentials and are not.
fn display_key<'a>(caller: &Caller<'a>) -> &'a str {
    match caller.dimension {
        Dimension::Address => caller.key,
        Dimension::Token => "-",
    }
}

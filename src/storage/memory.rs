//! In-memory storage backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::Storage;
use crate::error::StorageError;

/// Source of "now" for expiry decisions.
#[derive(Debug)]
enum Clock {
    /// Wall clock, shifted by whatever `advance` has added
    System { offset: Duration },
    /// Frozen instant that only moves through `advance`
    Manual { now: Instant },
}

impl Clock {
    fn now(&self) -> Instant {
        match self {
            Clock::System { offset } => Instant::now() + *offset,
            Clock::Manual { now } => *now,
        }
    }

    /// A shift that would leave the representable range is ignored.
    fn advance(&mut self, by: Duration) {
        match self {
            Clock::System { offset } => {
                if let Some(next) = offset
                    .checked_add(by)
                    .filter(|next| Instant::now().checked_add(*next).is_some())
                {
                    *offset = next;
                }
            }
            Clock::Manual { now } => {
                if let Some(next) = now.checked_add(by) {
                    *now = next;
                }
            }
        }
    }
}

fn expiry(now: Instant, after: Duration) -> Result<Instant, StorageError> {
    now.checked_add(after).ok_or_else(|| {
        StorageError::Unavailable(format!("expiry {:?} from now is out of range", after))
    })
}

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at: Instant,
}

#[derive(Debug)]
struct State {
    counters: HashMap<String, CounterEntry>,
    blocks: HashMap<String, Instant>,
    clock: Clock,
}

/// Map-backed storage guarded by a single lock.
///
/// The lock is held for one map operation at a time and never across an
/// await point. Expired entries are treated as absent when read; the
/// optional [`purge_expired`](MemoryStorage::purge_expired) sweep only
/// reclaims memory.
pub struct MemoryStorage {
    state: Mutex<State>,
    closed: AtomicBool,
}

impl MemoryStorage {
    /// Create storage that follows the system clock.
    pub fn new() -> Self {
        Self::with_clock(Clock::System {
            offset: Duration::ZERO,
        })
    }

    /// Create storage whose clock stands still until [`advance`](Self::advance)
    /// is called. Intended for tests.
    pub fn with_manual_clock() -> Self {
        Self::with_clock(Clock::Manual {
            now: Instant::now(),
        })
    }

    fn with_clock(clock: Clock) -> Self {
        Self {
            state: Mutex::new(State {
                counters: HashMap::new(),
                blocks: HashMap::new(),
                clock,
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Move this storage's notion of "now" forward. Intended for tests.
    pub fn advance(&self, by: Duration) {
        self.state.lock().clock.advance(by);
    }

    /// Current count for `key` in its live window, if any.
    pub fn counter_value(&self, key: &str) -> Option<u64> {
        let state = self.state.lock();
        let now = state.clock.now();
        state
            .counters
            .get(key)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.count)
    }

    /// Drop expired counters and block markers. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut state = self.state.lock();
        let now = state.clock.now();
        let before = state.counters.len() + state.blocks.len();

        state.counters.retain(|_, entry| now < entry.expires_at);
        state.blocks.retain(|_, expires_at| now < *expires_at);

        let removed = before - (state.counters.len() + state.blocks.len());
        if removed > 0 {
            debug!(removed, "Purged expired rate limit entries");
        }
        removed
    }

    /// Run [`purge_expired`](Self::purge_expired) every `every` on the
    /// current runtime. The task stops once the storage is shut down or
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let storage = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                match storage.upgrade() {
                    Some(storage) if !storage.closed.load(Ordering::Acquire) => {
                        storage.purge_expired();
                    }
                    _ => break,
                }
            }
            debug!("In-memory sweeper stopped");
        })
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Unavailable("storage has been shut down".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StorageError> {
        self.ensure_open()?;

        let mut state = self.state.lock();
        let now = state.clock.now();
        let fresh = CounterEntry {
            count: 0,
            expires_at: expiry(now, window)?,
        };

        let entry = state
            .counters
            .entry(key.to_string())
            .and_modify(|entry| {
                if now >= entry.expires_at {
                    *entry = fresh;
                }
            })
            .or_insert(fresh);
        entry.count += 1;

        trace!(count = entry.count, "Incremented in-memory counter");
        Ok(entry.count)
    }

    async fn is_blocked(&self, key: &str) -> Result<bool, StorageError> {
        self.ensure_open()?;

        let state = self.state.lock();
        let now = state.clock.now();
        Ok(state
            .blocks
            .get(key)
            .is_some_and(|expires_at| now < *expires_at))
    }

    async fn block(&self, key: &str, duration: Duration) -> Result<(), StorageError> {
        self.ensure_open()?;

        let mut state = self.state.lock();
        let expires_at = expiry(state.clock.now(), duration)?;
        state.blocks.insert(key.to_string(), expires_at);
        Ok(())
    }

    async fn clear_counter(&self, key: &str) -> Result<(), StorageError> {
        self.ensure_open()?;

        self.state.lock().counters.remove(key);
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<(), StorageError> {
        self.ensure_open()?;

        let mut state = self.state.lock();
        state.counters.remove(key);
        state.blocks.remove(key);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StorageError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("In-memory storage shut down");
        }
        Ok(())
    }
}

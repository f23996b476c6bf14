//! In-memory response cache with per-key time-based expiry.
//!
//! [`CacheStore`] maps a request key to the decoded JSON document the upstream
//! returned for it. Every entry expires a fixed TTL after it was written. Expiry
//! is enforced twice, against the same instant:
//!
//! - [`CacheStore::get`] treats an entry whose deadline has passed as absent,
//!   even if nothing has removed it yet.
//! - Each [`CacheStore::put`] spawns one Tokio timer task that removes the
//!   entry at its deadline, so keys that are never read again do not linger.
//!
//! Overwriting a key aborts the previous timer. Each entry also carries a
//! generation number, and a timer only removes the entry it was scheduled for,
//! so a timer that fires while a newer write lands cannot erase the fresh value.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Default time-to-live for cached responses (30 s).
pub const DEFAULT_TTL: Duration = Duration::from_millis(30_000);

struct CacheEntry {
    value: Value,
    expires_at: Instant,
    generation: u64,
    timer: JoinHandle<()>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Thread-safe key → JSON cache with independent per-key expiry.
///
/// Cheap to share: wrap it in an [`Arc`] and hand clones to every request task.
///
/// # Examples
///
/// ```
/// use kraken_cache_proxy::cache::CacheStore;
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache = CacheStore::new();
/// cache.put("/0/public/Time", json!({"result": {"unixtime": 1}}));
/// assert_eq!(cache.get("/0/public/Time"), Some(json!({"result": {"unixtime": 1}})));
/// assert_eq!(cache.get("/0/public/Assets"), None);
/// # }
/// ```
pub struct CacheStore {
    entries: Arc<DashMap<String, CacheEntry>>,
    ttl: Duration,
    next_generation: AtomicU64,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    /// Creates an empty store using [`DEFAULT_TTL`].
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    /// Creates an empty store whose entries live for `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
            next_generation: AtomicU64::new(0),
        }
    }

    /// Returns the time-to-live applied to every write.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached value for `key` if present and not expired.
    ///
    /// A read at or after the entry's deadline returns `None` whether or not
    /// the expiry timer has run yet.
    pub fn get(&self, key: &str) -> Option<Value> {
        let entry = self.entries.get(key)?;
        if entry.is_live(Instant::now()) {
            Some(entry.value.clone())
        } else {
            trace!(key, "cache entry past deadline");
            None
        }
    }

    /// Stores `value` under `key`, expiring `ttl` from now.
    ///
    /// Replaces any existing entry for `key` and cancels its pending timer.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime, since the expiry timer is
    /// spawned as a task.
    pub fn put(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let expires_at = Instant::now() + self.ttl;

        // The slot stays locked until the entry is stored, so the timer cannot
        // look for its generation before it exists.
        let slot = self.entries.entry(key);
        let timer = tokio::spawn(expire_at(
            Arc::clone(&self.entries),
            slot.key().clone(),
            generation,
            expires_at,
        ));

        let entry = CacheEntry {
            value,
            expires_at,
            generation,
            timer,
        };

        match slot {
            Entry::Occupied(mut occupied) => {
                occupied.insert(entry).timer.abort();
                debug!(key = %occupied.key(), "replaced cache entry");
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
    }

    /// Removes the entry for `key` unconditionally, cancelling its timer.
    ///
    /// Returns `true` if an entry (live or expired) was removed.
    pub fn invalidate(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Returns the number of entries held, including expired ones whose timer
    /// has not run yet.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        for entry in self.entries.iter() {
            entry.timer.abort();
        }
    }
}

// Body of the per-entry timer task.
async fn expire_at(
    entries: Arc<DashMap<String, CacheEntry>>,
    key: String,
    generation: u64,
    deadline: Instant,
) {
    tokio::time::sleep_until(deadline).await;
    remove_generation(&entries, &key, generation);
}

// Removes `key` only while it still holds the write tagged `generation`.
fn remove_generation(entries: &DashMap<String, CacheEntry>, key: &str, generation: u64) -> bool {
    let removed = entries
        .remove_if(key, |_, entry| entry.generation == generation)
        .is_some();
    if removed {
        debug!(key, "cache entry expired");
    }
    removed
}

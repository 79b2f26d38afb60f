//! RAM resource cache with creation-order eviction
//!
//! Holds decoded page resources keyed by content key. The cache is bounded by
//! an entry count (and optionally a byte budget); when a bound is exceeded the
//! entries with the oldest creation timestamp are evicted first. Every removal
//! path (eviction, session mismatch, explicit removal, clear, drop) releases the
//! entry's handle exactly once.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::debug;

use crate::config::CacheConfig;
use crate::resource::OwnedResource;
use crate::session::SessionId;

/// Default maximum number of cached entries
pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// A cached resource and its bookkeeping
#[derive(Debug)]
pub struct CacheEntry {
    /// Content key
    pub key: String,

    /// Session the resource was produced for
    pub session: SessionId,

    /// When the entry was committed
    pub created_at: Instant,

    resource: OwnedResource,
}

impl CacheEntry {
    /// Displayable reference of the cached resource
    pub fn display_ref(&self) -> &str {
        self.resource.display_ref()
    }

    /// Size of the cached resource in bytes
    pub fn byte_len(&self) -> usize {
        self.resource.byte_len()
    }

    fn release(mut self) -> bool {
        self.resource.release()
    }
}

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCacheStats {
    /// Number of entries currently cached
    pub entry_count: usize,

    /// Bytes held by cached resources
    pub bytes_used: usize,

    /// Maximum number of entries
    pub max_entries: usize,

    /// Optional byte budget
    pub max_bytes: Option<usize>,

    /// Number of lookups that found an entry
    pub hits: u64,

    /// Number of lookups that found nothing
    pub misses: u64,

    /// Number of entries evicted because a bound was exceeded
    pub evictions: u64,

    /// Number of handles released through any removal path
    pub released: u64,
}

impl ResourceCacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,

    /// Keys in creation order (oldest at front)
    order: VecDeque<String>,

    bytes_used: usize,
    max_entries: usize,
    max_bytes: Option<usize>,
    stats: ResourceCacheStats,
}

impl CacheState {
    fn new(max_entries: usize, max_bytes: Option<usize>) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            bytes_used: 0,
            max_entries,
            max_bytes,
            stats: ResourceCacheStats::default(),
        }
    }

    fn over_bounds(&self) -> bool {
        self.entries.len() > self.max_entries
            || self.max_bytes.is_some_and(|max| self.bytes_used > max)
    }

    fn detach(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        self.bytes_used = self.bytes_used.saturating_sub(entry.byte_len());
        Some(entry)
    }

    /// Pop oldest entries until both bounds hold
    fn evict_to_fit(&mut self) -> Vec<CacheEntry> {
        let mut evicted = Vec::new();
        while self.over_bounds() {
            let Some(key) = self.order.pop_front() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                self.bytes_used = self.bytes_used.saturating_sub(entry.byte_len());
                self.stats.evictions += 1;
                evicted.push(entry);
            }
        }
        evicted
    }
}

/// Bounded cache of decoded resources
///
/// Thread-safe; handles are released after the internal lock is dropped so a
/// slow release never blocks other cache users.
///
/// # Example
///
/// ```
/// use pageview_cache::{DecodedBuffer, OwnedResource, ResourceCache, SessionId};
///
/// let cache = ResourceCache::new(2);
/// let session = SessionId::new("book.cbz");
///
/// for page in 0..3 {
///     let key = format!("book.cbz::{page:03}.jpg");
///     let buffer = DecodedBuffer::new(&key, vec![0u8; 16], 2, 2);
///     cache.insert(key, session.clone(), OwnedResource::new(Box::new(buffer)));
/// }
///
/// // The oldest page was evicted and released
/// assert_eq!(cache.len(), 2);
/// assert!(!cache.contains("book.cbz::000.jpg"));
/// ```
pub struct ResourceCache {
    state: Mutex<CacheState>,
}

impl ResourceCache {
    /// Create a cache bounded by entry count only
    pub fn new(max_entries: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::new(max_entries, None)),
        }
    }

    /// Create a cache bounded by entry count and total bytes
    pub fn with_byte_limit(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::new(max_entries, Some(max_bytes))),
        }
    }

    /// Create a cache from configuration
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState::new(config.max_entries, config.max_bytes())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Commit a resource
    ///
    /// Replaces (and releases) any entry with the same key, then evicts the
    /// oldest entries until the bounds hold. Returns the number of evicted
    /// entries.
    pub fn insert(&self, key: String, session: SessionId, resource: OwnedResource) -> usize {
        let (replaced, evicted) = {
            let mut state = self.lock();
            let replaced = state.detach(&key);

            state.bytes_used += resource.byte_len();
            state.order.push_back(key.clone());
            state.entries.insert(
                key.clone(),
                CacheEntry {
                    key,
                    session,
                    created_at: Instant::now(),
                    resource,
                },
            );

            let evicted = state.evict_to_fit();
            state.stats.released += evicted.len() as u64 + u64::from(replaced.is_some());
            (replaced, evicted)
        };

        if let Some(old) = replaced {
            old.release();
        }

        let count = evicted.len();
        for entry in evicted {
            debug!(key = %entry.key, session = %entry.session, "evicting cached resource");
            entry.release();
        }
        count
    }

    /// Look up the display reference for a key
    ///
    /// Updates hit/miss statistics.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut state = self.lock();
        match state.entries.get(key).map(|e| e.display_ref().to_owned()) {
            Some(display_ref) => {
                state.stats.hits += 1;
                Some(display_ref)
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    /// Check if a key is cached, regardless of session
    pub fn contains(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Check if a key is cached for the given session
    pub fn contains_for_session(&self, key: &str, session: &SessionId) -> bool {
        self.lock()
            .entries
            .get(key)
            .is_some_and(|entry| &entry.session == session)
    }

    /// Remove and release one entry
    ///
    /// Returns `true` if an entry was removed.
    pub fn remove(&self, key: &str) -> bool {
        let removed = {
            let mut state = self.lock();
            let removed = state.detach(key);
            if removed.is_some() {
                state.stats.released += 1;
            }
            removed
        };
        removed.map(CacheEntry::release).is_some()
    }

    /// Release every entry that does not belong to `session`
    ///
    /// With `None` every entry is released. Returns the number of released
    /// entries.
    pub fn retain_session(&self, session: Option<&SessionId>) -> usize {
        let stale = {
            let mut state = self.lock();
            let stale_keys: Vec<String> = state
                .entries
                .values()
                .filter(|entry| Some(&entry.session) != session)
                .map(|entry| entry.key.clone())
                .collect();

            let stale: Vec<CacheEntry> = stale_keys
                .iter()
                .filter_map(|key| state.detach(key))
                .collect();
            state.stats.released += stale.len() as u64;
            stale
        };

        let count = stale.len();
        if count > 0 {
            debug!(released = count, "released cached resources from other sessions");
        }
        for entry in stale {
            entry.release();
        }
        count
    }

    /// Release every entry
    ///
    /// Returns the number of released entries.
    pub fn clear(&self) -> usize {
        let drained: Vec<CacheEntry> = {
            let mut state = self.lock();
            state.order.clear();
            state.bytes_used = 0;
            let drained: Vec<CacheEntry> = state.entries.drain().map(|(_, e)| e).collect();
            state.stats.released += drained.len() as u64;
            drained
        };

        let count = drained.len();
        for entry in drained {
            entry.release();
        }
        count
    }

    /// Keys in creation order, oldest first
    pub fn keys(&self) -> Vec<String> {
        self.lock().order.iter().cloned().collect()
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Bytes held by cached resources
    pub fn bytes_used(&self) -> usize {
        self.lock().bytes_used
    }

    /// Maximum number of entries
    pub fn max_entries(&self) -> usize {
        self.lock().max_entries
    }

    /// Change the entry bound, evicting immediately if needed
    pub fn set_max_entries(&self, max_entries: usize) -> usize {
        let evicted = {
            let mut state = self.lock();
            state.max_entries = max_entries;
            let evicted = state.evict_to_fit();
            state.stats.released += evicted.len() as u64;
            evicted
        };

        let count = evicted.len();
        for entry in evicted {
            entry.release();
        }
        count
    }

    /// Get current cache statistics
    pub fn stats(&self) -> ResourceCacheStats {
        let state = self.lock();
        ResourceCacheStats {
            entry_count: state.entries.len(),
            bytes_used: state.bytes_used,
            max_entries: state.max_entries,
            max_bytes: state.max_bytes,
            ..state.stats
        }
    }
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

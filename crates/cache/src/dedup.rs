//! Time-bounded request deduplication
//!
//! Suppresses duplicate in-flight requests keyed by a caller supplied string.
//! A successful [`Deduplicator::try_acquire`] issues a token and claims the key
//! until the claim is released or its TTL runs out. The TTL protects against
//! permanent lockout when a caller never reports completion.
//!
//! Two policies are used by the viewer: a short window that coalesces repeated
//! "go to page" calls during rapid navigation, and a long window that coalesces
//! duplicate decode calls for the same page.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::config::DedupConfig;

/// Default record count that triggers a sweep of expired claims
pub const DEFAULT_MAX_RECORDS: usize = 1024;

/// Deduplication window presets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Rapid sequential navigation (100ms)
    Navigation,

    /// Image decode calls (30s)
    Decode,

    /// Caller supplied window
    Custom(Duration),
}

impl DedupPolicy {
    /// Time-to-live of a claim under this policy
    pub fn ttl(&self) -> Duration {
        match self {
            DedupPolicy::Navigation => Duration::from_millis(100),
            DedupPolicy::Decode => Duration::from_secs(30),
            DedupPolicy::Custom(ttl) => *ttl,
        }
    }
}

/// Deduplication statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupStats {
    /// Total `try_acquire` calls
    pub total_requests: u64,

    /// Calls rejected because the key was already claimed
    pub deduplicated: u64,

    /// Records currently stored (may include expired, not yet swept ones)
    pub active_requests: usize,
}

#[derive(Debug, Clone, Copy)]
struct DedupRecord {
    issued_at: Instant,
    token: u64,
}

impl DedupRecord {
    fn is_live(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.issued_at) < ttl
    }
}

/// Request deduplicator
///
/// # Example
///
/// ```
/// use pageview_cache::{DedupPolicy, Deduplicator};
///
/// let dedup = Deduplicator::new(DedupPolicy::Decode);
///
/// let token = dedup.try_acquire("book.cbz::001.jpg").unwrap();
/// assert!(dedup.try_acquire("book.cbz::001.jpg").is_none());
///
/// dedup.release_with_id("book.cbz::001.jpg", token);
/// assert!(dedup.try_acquire("book.cbz::001.jpg").is_some());
/// ```
pub struct Deduplicator {
    records: DashMap<String, DedupRecord>,
    ttl: Duration,
    max_records: usize,
    next_token: AtomicU64,
    total_requests: AtomicU64,
    deduplicated: AtomicU64,
}

impl Deduplicator {
    /// Create a deduplicator for a policy
    pub fn new(policy: DedupPolicy) -> Self {
        Self::with_ttl(policy.ttl())
    }

    /// Create a deduplicator with a custom TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
            max_records: DEFAULT_MAX_RECORDS,
            next_token: AtomicU64::new(1),
            total_requests: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
        }
    }

    /// Create a deduplicator for a policy, with windows taken from configuration
    pub fn from_config(config: &DedupConfig, policy: DedupPolicy) -> Self {
        Self::with_ttl(config.ttl_for(policy)).with_max_records(config.max_records)
    }

    /// Set the record count above which expired records are swept
    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records.max(1);
        self
    }

    /// Claim a key
    ///
    /// Returns a fresh token if no unexpired claim exists for `key`, or `None`
    /// if the request is a duplicate.
    pub fn try_acquire(&self, key: &str) -> Option<u64> {
        self.try_acquire_at(key, Instant::now())
    }

    fn try_acquire_at(&self, key: &str, now: Instant) -> Option<u64> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        // Sweep before taking the entry lock; `len` visits every shard
        if self.records.len() >= self.max_records {
            self.sweep(now);
        }

        let ttl = self.ttl;
        match self.records.entry(key.to_owned()) {
            Entry::Occupied(entry) if entry.get().is_live(now, ttl) => {
                self.deduplicated.fetch_add(1, Ordering::Relaxed);
                debug!(key, "deduplicated request");
                None
            }
            Entry::Occupied(mut entry) => {
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                entry.insert(DedupRecord {
                    issued_at: now,
                    token,
                });
                Some(token)
            }
            Entry::Vacant(entry) => {
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                entry.insert(DedupRecord {
                    issued_at: now,
                    token,
                });
                Some(token)
            }
        }
    }

    /// Drop expired records; live claims are never removed
    fn sweep(&self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.records.len();
        self.records.retain(|_, record| record.is_live(now, ttl));
        let removed = before.saturating_sub(self.records.len());

        if self.records.len() >= self.max_records {
            debug!(
                live = self.records.len(),
                max_records = self.max_records,
                "dedup record limit exceeded by live claims"
            );
        }
        removed
    }

    /// Release a claim unconditionally
    pub fn release(&self, key: &str) {
        self.records.remove(key);
    }

    /// Release a claim only if it is still held by `token`
    ///
    /// A stale completion from a superseded request is a no-op. Returns `true`
    /// if the claim was released.
    pub fn release_with_id(&self, key: &str, token: u64) -> bool {
        self.records
            .remove_if(key, |_, record| record.token == token)
            .is_some()
    }

    /// Check if a key currently holds an unexpired claim
    pub fn is_active(&self, key: &str) -> bool {
        let now = Instant::now();
        self.records
            .get(key)
            .is_some_and(|record| record.is_live(now, self.ttl))
    }

    /// Remove expired records, returning how many were removed
    pub fn cleanup_expired(&self) -> usize {
        self.sweep(Instant::now())
    }

    /// Drop every claim
    pub fn clear(&self) {
        self.records.clear();
    }

    /// Time-to-live of claims
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get deduplication statistics
    pub fn stats(&self) -> DedupStats {
        DedupStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            active_requests: self.records.len(),
        }
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DedupPolicy::Decode)
    }
}

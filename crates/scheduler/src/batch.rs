//! Batched thumbnail requests
//!
//! Visible-key requests from the UI are appended to a bounded backlog and
//! flushed on a short timer, so a burst of scroll events turns into a few
//! remote calls. When the backlog overflows, the oldest keys are dropped and
//! the most recently requested ones are kept.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::ServiceError;
use crate::session::{ContextSwitch, ContextSwitchListener};

/// Remote batch thumbnail endpoint
#[async_trait]
pub trait BatchThumbnailEndpoint: Send + Sync {
    /// Request thumbnails for up to one chunk of keys
    async fn request_batch(
        &self,
        keys: Vec<String>,
        context_hint: Option<String>,
    ) -> Result<(), ServiceError>;
}

/// Batch gate limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum number of keys waiting for dispatch
    pub max_pending: usize,

    /// Keys per remote call
    pub batch_size: usize,

    /// Delay before a flush in milliseconds
    pub flush_delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_pending: 512,
            batch_size: 64,
            flush_delay_ms: 16,
        }
    }
}

impl BatchConfig {
    /// Flush delay as a duration
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }
}

/// Batch gate statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    /// Keys passed to `request_visible_keys`
    pub requested: u64,

    /// Keys dropped by backlog overflow
    pub dropped: u64,

    /// Keys handed to the endpoint
    pub dispatched_keys: u64,

    /// Remote calls issued
    pub batches: u64,

    /// Remote calls that failed
    pub failed_batches: u64,
}

#[derive(Debug)]
struct PendingKey {
    key: String,
    context_hint: Option<String>,
}

struct GateState {
    pending: VecDeque<PendingKey>,
    flush_scheduled: bool,
    stats: BatchStats,
}

struct GateInner {
    state: Mutex<GateState>,
    endpoint: Arc<dyn BatchThumbnailEndpoint>,
    config: BatchConfig,
}

/// Batch request gate
///
/// Cloning yields another handle to the same gate.
///
/// # Example
///
/// ```
/// # use std::sync::Arc;
/// # use async_trait::async_trait;
/// # use pageview_scheduler::{BatchRequestGate, BatchThumbnailEndpoint, BatchConfig, ServiceError};
/// struct Endpoint;
///
/// #[async_trait]
/// impl BatchThumbnailEndpoint for Endpoint {
///     async fn request_batch(
///         &self,
///         keys: Vec<String>,
///         _hint: Option<String>,
///     ) -> Result<(), ServiceError> {
///         assert!(keys.len() <= 64);
///         Ok(())
///     }
/// }
///
/// let gate = BatchRequestGate::new(Arc::new(Endpoint), BatchConfig::default());
/// gate.request_visible_keys((0..70).map(|i| format!("thumb-{i}")), None);
/// assert_eq!(gate.pending_len(), 70);
///
/// // Without a runtime nothing is dispatched until an explicit flush
/// gate.clear();
/// assert_eq!(gate.pending_len(), 0);
/// ```
#[derive(Clone)]
pub struct BatchRequestGate {
    inner: Arc<GateInner>,
}

impl BatchRequestGate {
    /// Create a gate in front of an endpoint
    pub fn new(endpoint: Arc<dyn BatchThumbnailEndpoint>, config: BatchConfig) -> Self {
        let config = BatchConfig {
            max_pending: config.max_pending.max(1),
            batch_size: config.batch_size.max(1),
            ..config
        };

        Self {
            inner: Arc::new(GateInner {
                state: Mutex::new(GateState {
                    pending: VecDeque::new(),
                    flush_scheduled: false,
                    stats: BatchStats::default(),
                }),
                endpoint,
                config,
            }),
        }
    }

    /// Queue keys for batched dispatch
    ///
    /// A flush is scheduled `flush_delay` later on the current tokio runtime,
    /// unless one is already pending.
    pub fn request_visible_keys<I, K>(&self, keys: I, context_hint: Option<&str>)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let max_pending = self.inner.config.max_pending;
        let mut state = self.inner.lock();

        let mut dropped = 0u64;
        for key in keys {
            state.pending.push_back(PendingKey {
                key: key.into(),
                context_hint: context_hint.map(str::to_owned),
            });
            state.stats.requested += 1;
            if state.pending.len() > max_pending {
                state.pending.pop_front();
                dropped += 1;
            }
        }

        if dropped > 0 {
            state.stats.dropped += dropped;
            debug!(dropped, max_pending, "batch backlog full, dropped oldest keys");
        }

        if state.flush_scheduled || state.pending.is_empty() {
            return;
        }

        match Handle::try_current() {
            Ok(handle) => {
                state.flush_scheduled = true;
                let inner = self.inner.clone();
                handle.spawn(async move {
                    tokio::time::sleep(inner.config.flush_delay()).await;
                    inner.flush();
                });
            }
            Err(_) => debug!("no async runtime, batch flush deferred"),
        }
    }

    /// Dispatch the whole backlog now
    ///
    /// Returns the number of remote calls issued. Must run inside a tokio
    /// runtime for the calls to be spawned.
    pub fn flush(&self) -> usize {
        self.inner.flush()
    }

    /// Number of keys waiting for dispatch
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Drop the backlog, returning how many keys were dropped
    pub fn clear(&self) -> usize {
        let mut state = self.inner.lock();
        let count = state.pending.len();
        state.pending.clear();
        count
    }

    /// Get gate statistics
    pub fn stats(&self) -> BatchStats {
        self.inner.lock().stats
    }
}

impl ContextSwitchListener for BatchRequestGate {
    fn on_context_switch(&self, event: &ContextSwitch) {
        let dropped = self.clear();
        if dropped > 0 {
            debug!(dropped, reason = ?event.reason, "dropped thumbnail backlog on context switch");
        }
    }
}

impl GateInner {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Split the backlog into FIFO chunks that never mix context hints
    fn take_chunks(&self) -> Vec<(Vec<String>, Option<String>)> {
        let mut state = self.lock();
        state.flush_scheduled = false;

        let mut chunks: Vec<(Vec<String>, Option<String>)> = Vec::new();
        for PendingKey { key, context_hint } in state.pending.drain(..) {
            match chunks.last_mut() {
                Some((keys, hint))
                    if *hint == context_hint && keys.len() < self.config.batch_size =>
                {
                    keys.push(key);
                }
                _ => chunks.push((vec![key], context_hint)),
            }
        }

        state.stats.batches += chunks.len() as u64;
        state.stats.dispatched_keys += chunks
            .iter()
            .map(|(keys, _)| keys.len() as u64)
            .sum::<u64>();
        chunks
    }

    fn flush(self: &Arc<Self>) -> usize {
        let Ok(handle) = Handle::try_current() else {
            warn!("no async runtime, batch flush skipped");
            return 0;
        };

        let chunks = self.take_chunks();
        let count = chunks.len();

        for (keys, context_hint) in chunks {
            let inner = self.clone();
            handle.spawn(async move {
                let len = keys.len();
                if let Err(err) = inner.endpoint.request_batch(keys, context_hint).await {
                    warn!(keys = len, error = %err, "thumbnail batch request failed");
                    inner.lock().stats.failed_batches += 1;
                }
            });
        }

        if count > 0 {
            debug!(batches = count, "dispatched thumbnail batches");
        }
        count
    }
}

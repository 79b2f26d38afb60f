//! Session-scoped preload queue
//!
//! Prefetch tasks are decoded one at a time in priority order and committed
//! into a shared [`ResourceCache`]. There are no cancellation tokens: every
//! task carries the session it was created for, and that snapshot is compared
//! with the active session before the decode starts and again when the result
//! is committed. The commit-time comparison runs under the same lock as
//! [`PreloadQueue::switch_session`], so a result can never be cached for a
//! session that is no longer active.
//!
//! Lock order: queue state, then cache.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use pageview_cache::{
    DedupPolicy, Deduplicator, OwnedResource, ResourceCache, ResourceHandle, SessionId,
};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::error::ServiceError;
use crate::priority::{ContentRef, PrefetchTask, PriorityList};
use crate::session::{ContextSwitch, ContextSwitchListener};

/// Remote page decode service
#[async_trait]
pub trait DecodeService: Send + Sync {
    /// Decode a page into a releasable resource
    ///
    /// Must be safe to call redundantly for the same content.
    async fn decode(&self, content: &ContentRef) -> Result<Box<dyn ResourceHandle>, ServiceError>;
}

/// In-process decoder used when the remote service times out
pub trait FallbackDecoder: Send + Sync {
    /// Decode synchronously; runs on the blocking pool
    fn decode(&self, content: &ContentRef) -> Result<Box<dyn ResourceHandle>, ServiceError>;
}

/// Preload queue timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadConfig {
    /// Per-call decode timeout in milliseconds
    pub decode_timeout_ms: u64,

    /// Pause between tasks in milliseconds
    pub inter_task_delay_ms: u64,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            decode_timeout_ms: 5_000,
            inter_task_delay_ms: 100,
        }
    }
}

impl PreloadConfig {
    /// Decode timeout as a duration
    pub fn decode_timeout(&self) -> Duration {
        Duration::from_millis(self.decode_timeout_ms)
    }

    /// Inter-task delay as a duration
    pub fn inter_task_delay(&self) -> Duration {
        Duration::from_millis(self.inter_task_delay_ms)
    }
}

/// Result of [`PreloadQueue::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Task added to the pending list
    Queued,

    /// The content is already cached for this session
    AlreadyCached,

    /// A pending task has the same key; its priority was raised if needed
    AlreadyQueued,

    /// The session is not the active one
    RejectedStaleSession,

    /// No content key could be derived
    RejectedInvalidKey,
}

impl EnqueueOutcome {
    /// Whether the content will be (or already is) available
    pub fn is_accepted(&self) -> bool {
        !matches!(
            self,
            EnqueueOutcome::RejectedStaleSession | EnqueueOutcome::RejectedInvalidKey
        )
    }
}

/// Preload queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreloadStats {
    /// Tasks accepted into the pending list
    pub enqueued: u64,

    /// Results committed to the cache
    pub completed: u64,

    /// Decode failures
    pub failed: u64,

    /// Tasks or results dropped by a session check
    pub stale_discarded: u64,

    /// Tasks skipped because the decode was already in flight or cached
    pub deduplicated: u64,

    /// Decodes served by the fallback decoder
    pub fallback_decodes: u64,

    /// Tasks currently pending
    pub pending: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Committed,
    Stale,
    Skipped,
    Failed,
}

impl TaskOutcome {
    /// Whether the task reached the decode service
    fn was_decoded(&self) -> bool {
        !matches!(self, TaskOutcome::Skipped)
    }
}

struct QueueState {
    active_session: Option<SessionId>,
    pending: PriorityList,
    processing: bool,
    stats: PreloadStats,
}

struct QueueInner {
    state: Mutex<QueueState>,
    cache: Arc<ResourceCache>,
    dedup: Arc<Deduplicator>,
    service: Arc<dyn DecodeService>,
    fallback: Option<Arc<dyn FallbackDecoder>>,
    config: PreloadConfig,
}

/// Builder for [`PreloadQueue`]
pub struct PreloadQueueBuilder {
    service: Arc<dyn DecodeService>,
    cache: Arc<ResourceCache>,
    dedup: Option<Arc<Deduplicator>>,
    fallback: Option<Arc<dyn FallbackDecoder>>,
    config: PreloadConfig,
}

impl PreloadQueueBuilder {
    /// Set timing configuration
    pub fn config(mut self, config: PreloadConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a decode deduplicator
    pub fn dedup(mut self, dedup: Arc<Deduplicator>) -> Self {
        self.dedup = Some(dedup);
        self
    }

    /// Set the in-process fallback decoder
    pub fn fallback(mut self, fallback: Arc<dyn FallbackDecoder>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Build the queue; no session is active until the first switch
    pub fn build(self) -> PreloadQueue {
        PreloadQueue {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    active_session: None,
                    pending: PriorityList::new(),
                    processing: false,
                    stats: PreloadStats::default(),
                }),
                cache: self.cache,
                dedup: self
                    .dedup
                    .unwrap_or_else(|| Arc::new(Deduplicator::new(DedupPolicy::Decode))),
                service: self.service,
                fallback: self.fallback,
                config: self.config,
            }),
        }
    }
}

/// Session-scoped preload queue
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct PreloadQueue {
    inner: Arc<QueueInner>,
}

impl PreloadQueue {
    /// Start building a queue around a decode service and a cache
    pub fn builder(
        service: Arc<dyn DecodeService>,
        cache: Arc<ResourceCache>,
    ) -> PreloadQueueBuilder {
        PreloadQueueBuilder {
            service,
            cache,
            dedup: None,
            fallback: None,
            config: PreloadConfig::default(),
        }
    }

    /// Request a page to be decoded ahead of use
    ///
    /// Processing starts on the current tokio runtime if the queue is idle.
    pub fn enqueue(
        &self,
        content: ContentRef,
        priority: impl Into<i32>,
        session: &SessionId,
    ) -> EnqueueOutcome {
        let priority = priority.into();
        let mut state = self.inner.lock();

        if state.active_session.as_ref() != Some(session) {
            warn!(
                session = %session,
                active = ?state.active_session.as_ref().map(SessionId::as_str),
                "rejecting prefetch for inactive session"
            );
            return EnqueueOutcome::RejectedStaleSession;
        }

        let Some(task) = PrefetchTask::new(content, priority, session.clone()) else {
            warn!(session = %session, "rejecting prefetch without content key");
            return EnqueueOutcome::RejectedInvalidKey;
        };

        if self.inner.cache.contains_for_session(&task.key, session) {
            return EnqueueOutcome::AlreadyCached;
        }

        if state.pending.raise_priority(&task.key, priority) {
            return EnqueueOutcome::AlreadyQueued;
        }

        debug!(key = %task.key, priority, "queued prefetch");
        state.pending.insert(task);
        state.stats.enqueued += 1;

        if !state.processing {
            match Handle::try_current() {
                Ok(handle) => {
                    state.processing = true;
                    handle.spawn(self.inner.clone().run());
                }
                Err(_) => warn!("no async runtime, prefetch processing deferred"),
            }
        }

        EnqueueOutcome::Queued
    }

    /// Make `session` the active session
    ///
    /// Pending tasks are dropped and every cached entry of another session is
    /// released. Returns the number of released entries.
    pub fn switch_session(&self, session: Option<SessionId>) -> usize {
        let mut state = self.inner.lock();
        let dropped = state.pending.clear();
        let released = self.inner.cache.retain_session(session.as_ref());

        info!(
            session = ?session.as_ref().map(SessionId::as_str),
            dropped_tasks = dropped,
            released_entries = released,
            "prefetch session switched"
        );
        state.active_session = session;
        released
    }

    /// Currently active session
    pub fn active_session(&self) -> Option<SessionId> {
        self.inner.lock().active_session.clone()
    }

    /// Number of pending tasks
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Whether the processing loop is running
    pub fn is_processing(&self) -> bool {
        self.inner.lock().processing
    }

    /// Display reference of a cached page
    pub fn cached_display_ref(&self, key: &str) -> Option<String> {
        self.inner.cache.get(key)
    }

    /// Shared resource cache
    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.inner.cache
    }

    /// Get queue statistics
    pub fn stats(&self) -> PreloadStats {
        let state = self.inner.lock();
        PreloadStats {
            pending: state.pending.len(),
            ..state.stats
        }
    }
}

impl ContextSwitchListener for PreloadQueue {
    fn on_context_switch(&self, event: &ContextSwitch) {
        self.switch_session(event.session.clone());
    }
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_active(&self, session: &SessionId) -> bool {
        self.lock().active_session.as_ref() == Some(session)
    }

    fn next_task(&self) -> Option<PrefetchTask> {
        let mut state = self.lock();
        let task = state.pending.pop();
        if task.is_none() {
            state.processing = false;
        }
        task
    }

    async fn run(self: Arc<Self>) {
        debug!("prefetch processing started");
        while let Some(task) = self.next_task() {
            let outcome = self.process(task).await;
            if outcome.was_decoded() {
                tokio::time::sleep(self.config.inter_task_delay()).await;
            }
        }
        debug!("prefetch processing idle");
    }

    async fn process(&self, task: PrefetchTask) -> TaskOutcome {
        if !self.is_active(&task.session) {
            debug!(key = %task.key, session = %task.session, "dropping task for inactive session");
            self.lock().stats.stale_discarded += 1;
            return TaskOutcome::Skipped;
        }

        if self.cache.contains_for_session(&task.key, &task.session) {
            self.lock().stats.deduplicated += 1;
            return TaskOutcome::Skipped;
        }

        let Some(token) = self.dedup.try_acquire(&task.key) else {
            debug!(key = %task.key, "decode already in flight");
            self.lock().stats.deduplicated += 1;
            return TaskOutcome::Skipped;
        };

        let outcome = match self.decode(&task).await {
            Ok(handle) => self.commit(&task, OwnedResource::new(handle)),
            Err(err) => {
                warn!(key = %task.key, error = %err, "prefetch decode failed");
                self.lock().stats.failed += 1;
                TaskOutcome::Failed
            }
        };

        self.dedup.release_with_id(&task.key, token);
        outcome
    }

    async fn decode(&self, task: &PrefetchTask) -> Result<Box<dyn ResourceHandle>, ServiceError> {
        let timeout = self.config.decode_timeout();

        // Own task per call so a panicking service cannot take the loop down
        let service = self.service.clone();
        let content = task.content.clone();
        let mut call = tokio::spawn(async move { service.decode(&content).await });

        match tokio::time::timeout(timeout, &mut call).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(ServiceError::Aborted(err.to_string())),
            Err(_) => {
                call.abort();
                let Some(fallback) = self.fallback.clone() else {
                    return Err(ServiceError::Timeout(timeout));
                };

                warn!(key = %task.key, ?timeout, "decode timed out, using in-process fallback");
                self.lock().stats.fallback_decodes += 1;

                let content = task.content.clone();
                tokio::task::spawn_blocking(move || fallback.decode(&content))
                    .await
                    .map_err(|err| ServiceError::Aborted(err.to_string()))?
            }
        }
    }

    fn commit(&self, task: &PrefetchTask, mut resource: OwnedResource) -> TaskOutcome {
        let mut state = self.lock();

        if state.active_session.as_ref() != Some(&task.session) {
            state.stats.stale_discarded += 1;
            drop(state);

            debug!(
                key = %task.key,
                session = %task.session,
                "discarding result for inactive session"
            );
            resource.release();
            return TaskOutcome::Stale;
        }

        let evicted = self
            .cache
            .insert(task.key.clone(), task.session.clone(), resource);
        state.stats.completed += 1;

        debug!(key = %task.key, evicted, "prefetched page");
        TaskOutcome::Committed
    }
}

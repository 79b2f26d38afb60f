//! Prefetch coordinator
//!
//! Owns one instance of every prefetch component and wires them to a shared
//! [`ContextSignal`]:
//!
//! ```text
//! on_scroll / request_page
//!     -> PredictiveLoader + RangePredictor   (what)
//!     -> navigation Deduplicator             (whether now)
//!     -> PreloadQueue                        (when)
//!     -> DecodeService -> ResourceCache      (where)
//! ```
//!
//! Opening a book or closing the viewer publishes a [`ContextSwitch`]. The
//! cleanup orchestrator, the preload queue and the batch gate are subscribed
//! in that order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pageview_cache::{
    DedupPolicy, DedupStats, Deduplicator, ResourceCache, ResourceCacheStats, SessionId,
};
use pageview_scheduler::{
    BatchRequestGate, BatchStats, BatchThumbnailEndpoint, ContentRef, ContextSignal, ContextSwitch,
    DecodeService, EnqueueOutcome, FallbackDecoder, IndexRange, LoadDirection, PredictedRange,
    PredictiveLoader, PrefetchPriority, PreloadQueue, PreloadStats, RangePredictor, ScrollSample,
};
use tracing::{debug, info};

use crate::cleanup::{CleanupOrchestrator, CleanupReport};
use crate::config::{ConfigError, PrefetchConfig};

/// Scroll axis followed by the coordinate predictor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScrollAxis {
    /// Items stack top to bottom
    #[default]
    Vertical,
    /// Items run left to right
    Horizontal,
}

/// One scroll observation from the viewer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollUpdate {
    /// Vertical scroll offset
    pub scroll_top: f64,
    /// Horizontal scroll offset
    pub scroll_left: f64,
    /// Observation time in milliseconds
    pub timestamp_ms: f64,
    /// Visible extent along `axis`
    pub viewport_extent: f64,
    /// Axis the list scrolls along
    pub axis: ScrollAxis,
    /// Index of the item at the viewport anchor
    pub current_index: usize,
    /// Number of items in the list
    pub total_items: usize,
}

impl ScrollUpdate {
    /// Vertical scroll observation
    pub fn vertical(
        scroll_top: f64,
        timestamp_ms: f64,
        viewport_extent: f64,
        current_index: usize,
        total_items: usize,
    ) -> Self {
        Self {
            scroll_top,
            scroll_left: 0.0,
            timestamp_ms,
            viewport_extent,
            axis: ScrollAxis::Vertical,
            current_index,
            total_items,
        }
    }

    /// Horizontal scroll observation
    pub fn horizontal(
        scroll_left: f64,
        timestamp_ms: f64,
        viewport_extent: f64,
        current_index: usize,
        total_items: usize,
    ) -> Self {
        Self {
            scroll_top: 0.0,
            scroll_left,
            timestamp_ms,
            viewport_extent,
            axis: ScrollAxis::Horizontal,
            current_index,
            total_items,
        }
    }

    fn position(&self) -> f64 {
        match self.axis {
            ScrollAxis::Vertical => self.scroll_top,
            ScrollAxis::Horizontal => self.scroll_left,
        }
    }
}

/// What a scroll observation led to
#[derive(Debug, Clone, PartialEq)]
pub struct ScrollPrediction {
    /// Committed load direction
    pub direction: LoadDirection,

    /// Index range selected for prefetch
    pub range: Option<IndexRange>,

    /// Coordinate range the reader is expected to reach next
    pub predicted: Option<PredictedRange>,

    /// Indices newly queued for decode
    pub queued: usize,
}

/// Result of [`PrefetchCoordinator::request_page`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRequest {
    /// No book is open
    NoSession,

    /// No content key could be derived
    InvalidKey,

    /// The same page was requested within the navigation window
    Coalesced,

    /// Handed to the preload queue
    Submitted(EnqueueOutcome),
}

/// Snapshot of every component's counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinatorStats {
    /// Resource cache occupancy and evictions
    pub cache: ResourceCacheStats,
    /// Preload queue outcomes
    pub preload: PreloadStats,
    /// Thumbnail batch dispatches
    pub batch: BatchStats,
    /// Navigation claim deduplication
    pub navigation: DedupStats,
    /// Decode claim deduplication
    pub decode: DedupStats,
}

/// Builder for [`PrefetchCoordinator`]
pub struct PrefetchCoordinatorBuilder {
    service: Arc<dyn DecodeService>,
    endpoint: Arc<dyn BatchThumbnailEndpoint>,
    config: PrefetchConfig,
    fallback: Option<Arc<dyn FallbackDecoder>>,
    cleanup: Option<CleanupOrchestrator>,
}

impl PrefetchCoordinatorBuilder {
    /// Use a non-default configuration
    pub fn config(mut self, config: PrefetchConfig) -> Self {
        self.config = config;
        self
    }

    /// In-process decoder used when the decode service times out
    pub fn fallback(mut self, fallback: Arc<dyn FallbackDecoder>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Teardown collaborators run on every context switch
    ///
    /// If the orchestrator has no pooled-image cache, the coordinator's
    /// resource cache takes that slot.
    pub fn cleanup(mut self, cleanup: CleanupOrchestrator) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    /// Validate the configuration and wire the components
    pub fn build(self) -> Result<PrefetchCoordinator, ConfigError> {
        let config = self.config;
        config.validate()?;

        let cache = Arc::new(ResourceCache::from_config(&config.cache));
        let decode_dedup = Arc::new(Deduplicator::from_config(&config.dedup, DedupPolicy::Decode));
        let navigation = Deduplicator::from_config(&config.dedup, DedupPolicy::Navigation);

        let mut queue = PreloadQueue::builder(self.service, cache.clone())
            .config(config.preload.clone())
            .dedup(decode_dedup.clone());
        if let Some(fallback) = self.fallback {
            queue = queue.fallback(fallback);
        }
        let queue = queue.build();

        let batch = BatchRequestGate::new(self.endpoint, config.batch.clone());

        let cleanup = self.cleanup.unwrap_or_default();
        let cleanup = if cleanup.has_pooled_images() {
            cleanup
        } else {
            cleanup.with_pooled_images(cache.clone())
        };
        let cleanup = Arc::new(cleanup);

        let signal = Arc::new(ContextSignal::new());
        signal.subscribe(cleanup.clone());
        signal.subscribe(Arc::new(queue.clone()));
        signal.subscribe(Arc::new(batch.clone()));

        let scroll = ScrollState {
            loader: PredictiveLoader::new(config.loader.clone()),
            predictor: RangePredictor::new(&config.velocity),
        };

        Ok(PrefetchCoordinator {
            config,
            signal,
            cache,
            queue,
            batch,
            cleanup,
            navigation,
            decode_dedup,
            scroll: Mutex::new(scroll),
        })
    }
}

struct ScrollState {
    loader: PredictiveLoader,
    predictor: RangePredictor,
}

impl ScrollState {
    fn reset(&mut self) {
        self.loader.reset();
        self.predictor.reset();
    }
}

/// Composition root of the prefetch core
///
/// # Example
///
/// ```
/// # use std::sync::Arc;
/// # use async_trait::async_trait;
/// # use pageview_cache::{DecodedBuffer, ResourceHandle, SessionId};
/// # use pageview_core::{PageRequest, PrefetchCoordinator};
/// # use pageview_scheduler::{
/// #     BatchThumbnailEndpoint, ContentRef, DecodeService, EnqueueOutcome, ServiceError,
/// # };
/// struct Decoder;
///
/// #[async_trait]
/// impl DecodeService for Decoder {
///     async fn decode(
///         &self,
///         content: &ContentRef,
///     ) -> Result<Box<dyn ResourceHandle>, ServiceError> {
///         let key = content.content_key().unwrap_or_default();
///         Ok(Box::new(DecodedBuffer::new(&key, vec![0; 16], 2, 2)))
///     }
/// }
///
/// struct Thumbnails;
///
/// #[async_trait]
/// impl BatchThumbnailEndpoint for Thumbnails {
///     async fn request_batch(
///         &self,
///         _keys: Vec<String>,
///         _hint: Option<String>,
///     ) -> Result<(), ServiceError> {
///         Ok(())
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let coordinator = PrefetchCoordinator::builder(Arc::new(Decoder), Arc::new(Thumbnails))
///     .build()
///     .unwrap();
///
/// let page = ContentRef::new("book.cbz", 0);
/// assert_eq!(coordinator.request_page(page.clone()), PageRequest::NoSession);
///
/// coordinator.open_session(SessionId::new("book.cbz"));
/// assert_eq!(
///     coordinator.request_page(page),
///     PageRequest::Submitted(EnqueueOutcome::Queued)
/// );
/// # }
/// ```
pub struct PrefetchCoordinator {
    config: PrefetchConfig,
    signal: Arc<ContextSignal>,
    cache: Arc<ResourceCache>,
    queue: PreloadQueue,
    batch: BatchRequestGate,
    cleanup: Arc<CleanupOrchestrator>,
    navigation: Deduplicator,
    decode_dedup: Arc<Deduplicator>,
    scroll: Mutex<ScrollState>,
}

impl PrefetchCoordinator {
    /// Start building a coordinator around the two remote collaborators
    pub fn builder(
        service: Arc<dyn DecodeService>,
        endpoint: Arc<dyn BatchThumbnailEndpoint>,
    ) -> PrefetchCoordinatorBuilder {
        PrefetchCoordinatorBuilder {
            service,
            endpoint,
            config: PrefetchConfig::default(),
            fallback: None,
            cleanup: None,
        }
    }

    fn scroll_state(&self) -> MutexGuard<'_, ScrollState> {
        self.scroll.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `session` the open book
    ///
    /// Every subscriber runs before this returns: context resources are torn
    /// down, cached pages of other sessions released and pending work dropped.
    pub fn open_session(&self, session: SessionId) {
        info!(session = %session, "opening session");
        self.reset_navigation();
        self.signal.publish(ContextSwitch::opened(session));
    }

    /// Close the viewer; no session is active afterwards
    pub fn close_viewer(&self) {
        info!("closing viewer");
        self.reset_navigation();
        self.signal.publish(ContextSwitch::closed());
    }

    fn reset_navigation(&self) {
        self.scroll_state().reset();
        self.navigation.clear();
    }

    /// Currently open session
    pub fn active_session(&self) -> Option<SessionId> {
        self.queue.active_session()
    }

    /// Request the page the reader navigated to
    ///
    /// Repeated requests for the same page inside the navigation window are
    /// coalesced before they reach the queue.
    pub fn request_page(&self, content: ContentRef) -> PageRequest {
        let Some(session) = self.active_session() else {
            debug!("page requested without an open session");
            return PageRequest::NoSession;
        };
        let Some(key) = content.content_key() else {
            return PageRequest::InvalidKey;
        };

        if self.navigation.try_acquire(&format!("goto:{session}:{key}")).is_none() {
            return PageRequest::Coalesced;
        }

        PageRequest::Submitted(self.queue.enqueue(content, PrefetchPriority::Current, &session))
    }

    /// Feed a scroll observation and queue the pages around the viewport
    ///
    /// Items are identified by index within the open book. Nearest items are
    /// queued first.
    pub fn on_scroll(&self, update: ScrollUpdate) -> ScrollPrediction {
        let (direction, range, predicted) = {
            let mut scroll = self.scroll_state();
            let direction =
                scroll
                    .loader
                    .record(update.scroll_top, update.scroll_left, update.timestamp_ms);
            scroll
                .predictor
                .update(ScrollSample::new(update.position(), update.timestamp_ms));

            let position = update.position();
            let predicted = scroll.predictor.predict(
                position,
                position + update.viewport_extent,
                update.viewport_extent,
            );
            let range = scroll
                .loader
                .adaptive_range(update.current_index, update.total_items);
            (direction, range, predicted)
        };

        let mut prediction = ScrollPrediction {
            direction,
            range,
            predicted,
            queued: 0,
        };

        let (Some(session), Some(range)) = (self.active_session(), range) else {
            return prediction;
        };

        let current = update.current_index;
        let mut indices: Vec<usize> = range.indices().collect();
        indices.sort_by_key(|index| index.abs_diff(current));

        for index in indices {
            if self
                .navigation
                .try_acquire(&format!("scroll:{session}:{index}"))
                .is_none()
            {
                continue;
            }

            let content = ContentRef::new(session.as_str(), index);
            let priority = priority_for(index, current, direction);
            match self.queue.enqueue(content, priority, &session) {
                EnqueueOutcome::Queued => prediction.queued += 1,
                EnqueueOutcome::RejectedStaleSession => break,
                _ => {}
            }
        }

        debug!(
            direction = ?direction,
            start = range.start,
            end = range.end,
            queued = prediction.queued,
            "scroll prefetch"
        );
        prediction
    }

    /// Request thumbnails for keys that became visible
    pub fn request_thumbnails<I, K>(&self, keys: I, context_hint: Option<&str>)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.batch.request_visible_keys(keys, context_hint);
    }

    /// Display reference of a decoded page, if cached for the open session
    pub fn cached_display_ref(&self, content: &ContentRef) -> Option<String> {
        let session = self.active_session()?;
        let key = content.content_key()?;
        if !self.cache.contains_for_session(&key, &session) {
            return None;
        }
        self.queue.cached_display_ref(&key)
    }

    /// Run the context teardown outside of a session change
    pub fn cleanup_now(&self) -> CleanupReport {
        self.cleanup.cleanup_context_resources()
    }

    /// Drop expired navigation and decode claims
    pub fn sweep_expired(&self) -> usize {
        self.navigation.cleanup_expired() + self.decode_dedup.cleanup_expired()
    }

    /// Context signal, for subscribing further listeners
    pub fn signal(&self) -> &Arc<ContextSignal> {
        &self.signal
    }

    /// Shared resource cache
    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    /// Cleanup orchestrator
    pub fn cleanup(&self) -> &CleanupOrchestrator {
        &self.cleanup
    }

    /// Effective configuration
    pub fn config(&self) -> &PrefetchConfig {
        &self.config
    }

    /// Counters of every component
    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            cache: self.cache.stats(),
            preload: self.queue.stats(),
            batch: self.batch.stats(),
            navigation: self.navigation.stats(),
            decode: self.decode_dedup.stats(),
        }
    }
}

fn priority_for(index: usize, current: usize, direction: LoadDirection) -> PrefetchPriority {
    if index == current {
        return PrefetchPriority::Current;
    }
    if index.abs_diff(current) == 1 {
        return PrefetchPriority::Adjacent;
    }

    let ahead = if direction.is_backward() {
        index < current
    } else {
        index > current
    };
    if ahead {
        PrefetchPriority::Predicted
    } else {
        PrefetchPriority::Behind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pageview_cache::ResourceHandle;
    use pageview_scheduler::{BatchConfig, ServiceError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn setup() {
        tracing_subscriber::fmt()
            .with_env_filter("pageview_cache=debug,pageview_scheduler=debug,pageview_core=debug")
            .with_test_writer()
            .try_init()
            .ok();
    }

    struct CountedHandle {
        display_ref: String,
        released: Arc<AtomicUsize>,
    }

    impl ResourceHandle for CountedHandle {
        fn display_ref(&self) -> &str {
            &self.display_ref
        }

        fn byte_len(&self) -> usize {
            64
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Decoder {
        calls: Mutex<Vec<String>>,
        released: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DecodeService for Decoder {
        async fn decode(
            &self,
            content: &ContentRef,
        ) -> Result<Box<dyn ResourceHandle>, ServiceError> {
            let key = content.content_key().unwrap_or_default();
            self.calls.lock().unwrap().push(key.clone());
            Ok(Box::new(CountedHandle {
                display_ref: format!("blob:{key}"),
                released: self.released.clone(),
            }))
        }
    }

    #[derive(Default)]
    struct Endpoint {
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl BatchThumbnailEndpoint for Endpoint {
        async fn request_batch(
            &self,
            keys: Vec<String>,
            _hint: Option<String>,
        ) -> Result<(), ServiceError> {
            self.batches.lock().unwrap().push(keys.len());
            Ok(())
        }
    }

    fn coordinator() -> (PrefetchCoordinator, Arc<Decoder>, Arc<Endpoint>) {
        let decoder = Arc::new(Decoder::default());
        let endpoint = Arc::new(Endpoint::default());
        let coordinator = PrefetchCoordinator::builder(decoder.clone(), endpoint.clone())
            .build()
            .unwrap();
        (coordinator, decoder, endpoint)
    }

    #[test]
    fn test_priority_for() {
        assert_eq!(priority_for(5, 5, LoadDirection::Down), PrefetchPriority::Current);
        assert_eq!(priority_for(4, 5, LoadDirection::Down), PrefetchPriority::Adjacent);
        assert_eq!(priority_for(8, 5, LoadDirection::Down), PrefetchPriority::Predicted);
        assert_eq!(priority_for(2, 5, LoadDirection::Down), PrefetchPriority::Behind);
        assert_eq!(priority_for(2, 5, LoadDirection::Up), PrefetchPriority::Predicted);
        assert_eq!(priority_for(8, 5, LoadDirection::Left), PrefetchPriority::Behind);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PrefetchConfig::default().with_batch(BatchConfig {
            batch_size: 0,
            ..BatchConfig::default()
        });
        let result = PrefetchCoordinator::builder(
            Arc::new(Decoder::default()),
            Arc::new(Endpoint::default()),
        )
        .config(config)
        .build();
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_page_flow() {
        setup();
        let (coordinator, decoder, _) = coordinator();
        let page = ContentRef::new("book-a.cbz", 3);

        assert_eq!(coordinator.request_page(page.clone()), PageRequest::NoSession);

        coordinator.open_session(SessionId::new("book-a.cbz"));
        assert_eq!(
            coordinator.request_page(page.clone()),
            PageRequest::Submitted(EnqueueOutcome::Queued)
        );
        assert_eq!(coordinator.request_page(page.clone()), PageRequest::Coalesced);
        assert_eq!(
            coordinator.request_page(ContentRef::new("", 0)),
            PageRequest::InvalidKey
        );

        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(*decoder.calls.lock().unwrap(), vec!["book-a.cbz#3".to_string()]);
        assert_eq!(
            coordinator.cached_display_ref(&page).as_deref(),
            Some("blob:book-a.cbz#3")
        );
        assert_eq!(coordinator.stats().preload.completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_switch_releases_pages() {
        setup();
        let (coordinator, decoder, _) = coordinator();

        coordinator.open_session(SessionId::new("book-a.cbz"));
        for index in 0..3 {
            coordinator.request_page(ContentRef::new("book-a.cbz", index));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(coordinator.cache().len(), 3);

        coordinator.open_session(SessionId::new("book-b.cbz"));
        assert!(coordinator.cache().is_empty());
        assert_eq!(decoder.released.load(Ordering::SeqCst), 3);
        assert_eq!(coordinator.active_session(), Some(SessionId::new("book-b.cbz")));
        assert_eq!(
            coordinator.cached_display_ref(&ContentRef::new("book-a.cbz", 0)),
            None
        );

        let report = coordinator.cleanup().last_report().unwrap();
        assert!(report.is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_viewer() {
        setup();
        let (coordinator, decoder, _) = coordinator();

        coordinator.open_session(SessionId::new("book-a.cbz"));
        coordinator.request_page(ContentRef::new("book-a.cbz", 0));
        tokio::time::sleep(Duration::from_millis(500)).await;

        coordinator.close_viewer();
        assert_eq!(coordinator.active_session(), None);
        assert!(coordinator.cache().is_empty());
        assert_eq!(decoder.released.load(Ordering::SeqCst), 1);
        assert_eq!(
            coordinator.request_page(ContentRef::new("book-a.cbz", 1)),
            PageRequest::NoSession
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_scroll_queues_ahead() {
        setup();
        let (coordinator, _, _) = coordinator();
        coordinator.open_session(SessionId::new("book-a.cbz"));

        let first = coordinator.on_scroll(ScrollUpdate::vertical(0.0, 0.0, 800.0, 3, 40));
        assert_eq!(first.direction, LoadDirection::None);
        assert_eq!(first.range, Some(IndexRange { start: 1, end: 5 }));
        assert_eq!(first.predicted, None);
        assert!(first.queued > 0);

        let second = coordinator.on_scroll(ScrollUpdate::vertical(80.0, 50.0, 800.0, 3, 40));
        assert_eq!(second.direction, LoadDirection::Down);
        assert_eq!(second.range, Some(IndexRange { start: 3, end: 13 }));

        let predicted = second.predicted.unwrap();
        assert_eq!(predicted.start, 880.0);
        assert_eq!(predicted.width(), 1600.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scroll_without_session_queues_nothing() {
        let (coordinator, decoder, _) = coordinator();

        let prediction = coordinator.on_scroll(ScrollUpdate::horizontal(0.0, 0.0, 600.0, 0, 10));
        assert_eq!(prediction.range, Some(IndexRange { start: 0, end: 2 }));
        assert_eq!(prediction.queued, 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(decoder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_thumbnails_batched() {
        setup();
        let (coordinator, _, endpoint) = coordinator();

        coordinator.request_thumbnails((0..70).map(|i| format!("thumb-{i}")), None);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut batches = endpoint.batches.lock().unwrap().clone();
        batches.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(batches, vec![64, 6]);
        assert_eq!(coordinator.stats().batch.dispatched_keys, 70);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_drops_thumbnail_backlog() {
        let (coordinator, _, endpoint) = coordinator();

        coordinator.request_thumbnails(["a", "b"], Some("book-a.cbz"));
        coordinator.open_session(SessionId::new("book-b.cbz"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(endpoint.batches.lock().unwrap().is_empty());
    }
}

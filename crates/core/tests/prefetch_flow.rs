//! End-to-end prefetch behavior across the cache, scheduler and core crates

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pageview_cache::{
    DedupPolicy, Deduplicator, OwnedResource, ResourceCache, ResourceHandle, SessionId,
};
use pageview_core::{
    CleanupError, CleanupOrchestrator, CleanupStep, DecodeInstancePool, PageRequest,
    PersistedThumbnailStore, PooledImageCache, PrefetchCoordinator, StepOutcome, TempFileCache,
    ThumbnailHandleCache,
};
use pageview_scheduler::{
    BatchConfig, BatchRequestGate, BatchThumbnailEndpoint, ContentRef, DecodeService,
    EnqueueOutcome, RangePredictor, ScrollDirection, ScrollSample, ServiceError, VelocityConfig,
    VelocityTracker,
};
use tokio::sync::Notify;

fn setup() {
    tracing_subscriber::fmt()
        .with_env_filter("pageview_cache=debug,pageview_scheduler=debug,pageview_core=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

struct Page {
    display_ref: String,
    released: Arc<AtomicUsize>,
}

impl ResourceHandle for Page {
    fn display_ref(&self) -> &str {
        &self.display_ref
    }

    fn byte_len(&self) -> usize {
        1024
    }

    fn release(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Decoder that blocks every call until the test opens the gate
#[derive(Default)]
struct GatedDecoder {
    started: Notify,
    gate: Notify,
    released: Arc<AtomicUsize>,
}

#[async_trait]
impl DecodeService for GatedDecoder {
    async fn decode(&self, content: &ContentRef) -> Result<Box<dyn ResourceHandle>, ServiceError> {
        self.started.notify_one();
        self.gate.notified().await;
        Ok(Box::new(Page {
            display_ref: format!("blob:{}", content.content_key().unwrap_or_default()),
            released: self.released.clone(),
        }))
    }
}

#[derive(Default)]
struct Endpoint {
    calls: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl BatchThumbnailEndpoint for Endpoint {
    async fn request_batch(
        &self,
        keys: Vec<String>,
        _hint: Option<String>,
    ) -> Result<(), ServiceError> {
        self.calls.lock().unwrap().push(keys);
        Ok(())
    }
}

#[test]
fn dedup_grants_one_claim_per_window() {
    let dedup = Deduplicator::new(DedupPolicy::Decode);

    let first = dedup.try_acquire("book#1");
    assert!(first.is_some());
    for _ in 0..10 {
        assert_eq!(dedup.try_acquire("book#1"), None);
    }

    dedup.release("book#1");
    assert!(dedup.try_acquire("book#1").is_some());
    assert_eq!(dedup.stats().deduplicated, 10);
}

#[test]
fn dedup_ignores_stale_release() {
    let dedup = Deduplicator::new(DedupPolicy::Navigation);

    let old = dedup.try_acquire("goto:7").unwrap();
    dedup.release("goto:7");
    let new = dedup.try_acquire("goto:7").unwrap();
    assert!(new > old);

    assert!(!dedup.release_with_id("goto:7", old));
    assert_eq!(dedup.try_acquire("goto:7"), None);

    assert!(dedup.release_with_id("goto:7", new));
    assert!(dedup.try_acquire("goto:7").is_some());
}

#[test]
fn cache_stays_within_cap_and_releases_oldest() {
    let released = Arc::new(AtomicUsize::new(0));
    let cache = ResourceCache::new(3);
    let session = SessionId::new("book.cbz");

    for index in 0..10 {
        let page = Page {
            display_ref: format!("blob:{index}"),
            released: released.clone(),
        };
        cache.insert(
            format!("book.cbz#{index}"),
            session.clone(),
            OwnedResource::new(Box::new(page)),
        );
        assert!(cache.len() <= 3);
    }

    let mut keys = cache.keys();
    keys.sort();
    assert_eq!(keys, vec!["book.cbz#7", "book.cbz#8", "book.cbz#9"]);
    assert_eq!(released.load(Ordering::SeqCst), 7);

    cache.clear();
    assert_eq!(released.load(Ordering::SeqCst), 10);
}

#[tokio::test(start_paused = true)]
async fn in_flight_result_discarded_after_switch() {
    setup();
    let decoder = Arc::new(GatedDecoder::default());
    let coordinator = PrefetchCoordinator::builder(decoder.clone(), Arc::new(Endpoint::default()))
        .build()
        .unwrap();

    let book_a = SessionId::new("book-a.cbz");
    coordinator.open_session(book_a);
    let page = ContentRef::new("book-a.cbz", 0);
    assert_eq!(
        coordinator.request_page(page.clone()),
        PageRequest::Submitted(EnqueueOutcome::Queued)
    );

    decoder.started.notified().await;
    coordinator.open_session(SessionId::new("book-b.cbz"));
    decoder.gate.notify_one();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(coordinator.cache().is_empty());
    assert_eq!(coordinator.cached_display_ref(&page), None);
    assert_eq!(decoder.released.load(Ordering::SeqCst), 1);

    let stats = coordinator.stats();
    assert_eq!(stats.preload.completed, 0);
    assert_eq!(stats.preload.stale_discarded, 1);
}

#[tokio::test(start_paused = true)]
async fn seventy_keys_dispatch_as_64_and_6() {
    setup();
    let endpoint = Arc::new(Endpoint::default());
    let gate = BatchRequestGate::new(endpoint.clone(), BatchConfig::default());

    gate.request_visible_keys((0..70).map(|i| format!("thumb-{i}")), None);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let calls = endpoint.calls.lock().unwrap();
    let mut sizes: Vec<usize> = calls.iter().map(Vec::len).collect();
    sizes.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(sizes, vec![64, 6]);

    let first = calls.iter().find(|keys| keys.len() == 64).unwrap();
    assert_eq!(first[0], "thumb-0");
    assert_eq!(first[63], "thumb-63");
}

#[tokio::test(start_paused = true)]
async fn backlog_overflow_drops_oldest() {
    let endpoint = Arc::new(Endpoint::default());
    let gate = BatchRequestGate::new(endpoint.clone(), BatchConfig::default());

    gate.request_visible_keys((0..600).map(|i| format!("thumb-{i}")), None);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let calls = endpoint.calls.lock().unwrap();
    let dispatched: Vec<&String> = calls.iter().flatten().collect();
    assert_eq!(dispatched.len(), 512);
    assert!(dispatched.iter().all(|key| {
        let index: usize = key["thumb-".len()..].parse().unwrap();
        index >= 88
    }));
    assert_eq!(gate.stats().dropped, 88);
}

#[test]
fn velocity_smooths_from_zero() {
    let mut tracker = VelocityTracker::new(&VelocityConfig::default());

    let first = tracker.update(ScrollSample::new(0.0, 1000.0));
    assert_eq!(first.direction, ScrollDirection::None);
    assert_eq!(first.velocity, 0.0);

    let second = tracker.update(ScrollSample::new(100.0, 1100.0));
    assert_eq!(second.direction, ScrollDirection::Forward);
    assert!((second.velocity - 0.3).abs() < 1e-12);

    // 0.3 * 2.0 + 0.7 * 0.3
    let third = tracker.update(ScrollSample::new(300.0, 1200.0));
    assert!((third.velocity - 0.81).abs() < 1e-12);
}

#[test]
fn predictor_width_follows_extent() {
    let config = VelocityConfig::default();
    let mut predictor = RangePredictor::new(&config);
    assert_eq!(predictor.predict(0.0, 800.0, 800.0), None);

    predictor.update(ScrollSample::new(5000.0, 0.0));
    assert_eq!(predictor.predict(5000.0, 5800.0, 800.0), None);

    predictor.update(ScrollSample::new(4800.0, 100.0));
    let backward = predictor.predict(4800.0, 5600.0, 800.0).unwrap();
    assert_eq!(backward.end, 4800.0);
    assert_eq!(backward.width(), 800.0 * config.prediction_multiplier);

    // Clamped at zero near the top
    let clamped = predictor.predict(500.0, 1300.0, 800.0).unwrap();
    assert_eq!(clamped.start, 0.0);
    assert_eq!(clamped.end, 500.0);
}

#[derive(Default)]
struct Effects {
    rotated: AtomicUsize,
    handles_released: AtomicUsize,
    temp_cleared: AtomicUsize,
    thumbnails_cleared: AtomicUsize,
}

impl DecodeInstancePool for Effects {
    fn rotate(&self) -> Result<(), CleanupError> {
        self.rotated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl PersistedThumbnailStore for Effects {
    fn release_memory_handles(&self) -> Result<(), CleanupError> {
        self.handles_released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl TempFileCache for Effects {
    fn clear(&self) -> Result<(), CleanupError> {
        self.temp_cleared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl ThumbnailHandleCache for Effects {
    fn clear(&self) -> Result<(), CleanupError> {
        self.thumbnails_cleared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct BrokenImages;

impl PooledImageCache for BrokenImages {
    fn evict(&self) -> Result<(), CleanupError> {
        Err(CleanupError::Failed("image pool locked".to_string()))
    }
}

#[tokio::test(start_paused = true)]
async fn failing_image_eviction_does_not_stop_cleanup() {
    setup();
    let effects = Arc::new(Effects::default());
    let cleanup = CleanupOrchestrator::new()
        .with_decode_pool(effects.clone())
        .with_thumbnail_store(effects.clone())
        .with_pooled_images(Arc::new(BrokenImages))
        .with_temp_files(effects.clone())
        .with_thumbnail_handles(effects.clone());

    let decoder = Arc::new(GatedDecoder::default());
    let coordinator = PrefetchCoordinator::builder(decoder, Arc::new(Endpoint::default()))
        .cleanup(cleanup)
        .build()
        .unwrap();

    coordinator.open_session(SessionId::new("book-a.cbz"));

    assert_eq!(effects.rotated.load(Ordering::SeqCst), 1);
    assert_eq!(effects.handles_released.load(Ordering::SeqCst), 1);
    assert_eq!(effects.temp_cleared.load(Ordering::SeqCst), 1);
    assert_eq!(effects.thumbnails_cleared.load(Ordering::SeqCst), 1);

    let report = coordinator.cleanup().last_report().unwrap();
    assert_eq!(report.failed_steps(), vec![CleanupStep::EvictPooledImages]);
    assert!(matches!(
        report.outcome(CleanupStep::ClearTempFiles),
        Some(StepOutcome::Completed)
    ));
}

//! Context cleanup orchestration
//!
//! When the viewing context changes, every cache that holds memory-backed
//! handles has to be torn down. The caches are independent of each other, so
//! each teardown step runs isolated: an error or a panic in one step is logged
//! and recorded, and the remaining steps still run.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use pageview_cache::ResourceCache;
use pageview_scheduler::{ContextSwitch, ContextSwitchListener};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Failure of a single teardown step
#[derive(Debug, Error)]
pub enum CleanupError {
    /// The collaborator refused or failed the teardown
    #[error("{0}")]
    Failed(String),
}

/// Pool of decode instances that can be retired as a whole
pub trait DecodeInstancePool: Send + Sync {
    /// Replace the active pool; the predecessor releases its handles in the background
    fn rotate(&self) -> Result<(), CleanupError>;
}

/// Persistence adapter that materializes thumbnails in memory
pub trait PersistedThumbnailStore: Send + Sync {
    /// Release every in-memory handle created from durable storage
    fn release_memory_handles(&self) -> Result<(), CleanupError>;
}

/// Pooled image cache
pub trait PooledImageCache: Send + Sync {
    /// Evict and release every pooled image
    fn evict(&self) -> Result<(), CleanupError>;
}

/// Cache of temporary files
pub trait TempFileCache: Send + Sync {
    /// Remove every cached temp file
    fn clear(&self) -> Result<(), CleanupError>;
}

/// Store-level thumbnail handle cache
pub trait ThumbnailHandleCache: Send + Sync {
    /// Release every thumbnail handle
    fn clear(&self) -> Result<(), CleanupError>;
}

impl PooledImageCache for ResourceCache {
    fn evict(&self) -> Result<(), CleanupError> {
        let released = self.clear();
        debug!(released, "evicted pooled page resources");
        Ok(())
    }
}

/// Teardown steps in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CleanupStep {
    /// Retire the active decode instance pool
    RotateDecodePool,
    /// Drop in-memory handles of persisted thumbnails
    ReleasePersistedThumbnails,
    /// Evict pooled decoded images
    EvictPooledImages,
    /// Delete temporary extraction files
    ClearTempFiles,
    /// Drop cached thumbnail handles
    ClearThumbnailHandles,
}

impl CleanupStep {
    /// All steps, in the order they run
    pub const ALL: [CleanupStep; 5] = [
        CleanupStep::RotateDecodePool,
        CleanupStep::ReleasePersistedThumbnails,
        CleanupStep::EvictPooledImages,
        CleanupStep::ClearTempFiles,
        CleanupStep::ClearThumbnailHandles,
    ];

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            CleanupStep::RotateDecodePool => "rotate_decode_pool",
            CleanupStep::ReleasePersistedThumbnails => "release_persisted_thumbnails",
            CleanupStep::EvictPooledImages => "evict_pooled_images",
            CleanupStep::ClearTempFiles => "clear_temp_files",
            CleanupStep::ClearThumbnailHandles => "clear_thumbnail_handles",
        }
    }
}

impl fmt::Display for CleanupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one teardown step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Step ran to completion
    Completed,

    /// No collaborator registered for the step
    Skipped,

    /// Step returned an error
    Failed(String),

    /// Step panicked
    Panicked(String),
}

impl StepOutcome {
    /// Whether the step failed or panicked
    pub fn is_failure(&self) -> bool {
        matches!(self, StepOutcome::Failed(_) | StepOutcome::Panicked(_))
    }
}

/// Result of a cleanup run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// Wall-clock duration of the whole run
    pub elapsed: Duration,

    /// Per-step outcomes in execution order
    pub steps: Vec<(CleanupStep, StepOutcome)>,
}

impl CleanupReport {
    /// Outcome of a specific step
    pub fn outcome(&self, step: CleanupStep) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|(s, _)| *s == step)
            .map(|(_, outcome)| outcome)
    }

    /// Steps that failed or panicked
    pub fn failed_steps(&self) -> Vec<CleanupStep> {
        self.steps
            .iter()
            .filter(|(_, outcome)| outcome.is_failure())
            .map(|(step, _)| *step)
            .collect()
    }

    /// Whether every step completed or was skipped
    pub fn is_clean(&self) -> bool {
        self.failed_steps().is_empty()
    }
}

/// Runs the five context teardown steps in a fixed order
///
/// # Example
///
/// ```
/// use pageview_core::{CleanupOrchestrator, CleanupStep, StepOutcome};
///
/// let orchestrator = CleanupOrchestrator::new();
/// let report = orchestrator.cleanup_context_resources();
///
/// assert_eq!(report.steps.len(), 5);
/// assert_eq!(report.outcome(CleanupStep::ClearTempFiles), Some(&StepOutcome::Skipped));
/// ```
#[derive(Default)]
pub struct CleanupOrchestrator {
    decode_pool: Option<Arc<dyn DecodeInstancePool>>,
    thumbnail_store: Option<Arc<dyn PersistedThumbnailStore>>,
    pooled_images: Option<Arc<dyn PooledImageCache>>,
    temp_files: Option<Arc<dyn TempFileCache>>,
    thumbnail_handles: Option<Arc<dyn ThumbnailHandleCache>>,
    last_report: Mutex<Option<CleanupReport>>,
}

impl CleanupOrchestrator {
    /// Create an orchestrator with no collaborators
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the decode-instance pool
    pub fn with_decode_pool(mut self, pool: Arc<dyn DecodeInstancePool>) -> Self {
        self.decode_pool = Some(pool);
        self
    }

    /// Set the persisted thumbnail store
    pub fn with_thumbnail_store(mut self, store: Arc<dyn PersistedThumbnailStore>) -> Self {
        self.thumbnail_store = Some(store);
        self
    }

    /// Set the pooled image cache
    pub fn with_pooled_images(mut self, cache: Arc<dyn PooledImageCache>) -> Self {
        self.pooled_images = Some(cache);
        self
    }

    /// Set the temp-file cache
    pub fn with_temp_files(mut self, cache: Arc<dyn TempFileCache>) -> Self {
        self.temp_files = Some(cache);
        self
    }

    /// Set the store-level thumbnail cache
    pub fn with_thumbnail_handles(mut self, cache: Arc<dyn ThumbnailHandleCache>) -> Self {
        self.thumbnail_handles = Some(cache);
        self
    }

    /// Whether a pooled image cache is registered
    pub fn has_pooled_images(&self) -> bool {
        self.pooled_images.is_some()
    }

    /// Tear down every registered cache
    ///
    /// Never fails: step errors and panics are logged and recorded in the
    /// report.
    pub fn cleanup_context_resources(&self) -> CleanupReport {
        let start = Instant::now();

        let steps = CleanupStep::ALL
            .iter()
            .map(|&step| (step, self.run_step(step)))
            .collect();

        let report = CleanupReport {
            elapsed: start.elapsed(),
            steps,
        };

        let failed = report.failed_steps();
        if failed.is_empty() {
            info!(elapsed_ms = report.elapsed.as_millis() as u64, "context cleanup finished");
        } else {
            warn!(
                elapsed_ms = report.elapsed.as_millis() as u64,
                failed = ?failed,
                "context cleanup finished with failures"
            );
        }

        *self.last_report.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        report
    }

    /// Report of the most recent run
    pub fn last_report(&self) -> Option<CleanupReport> {
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn run_step(&self, step: CleanupStep) -> StepOutcome {
        let outcome = match step {
            CleanupStep::RotateDecodePool => {
                self.decode_pool.as_ref().map(|pool| guarded(step, || pool.rotate()))
            }
            CleanupStep::ReleasePersistedThumbnails => self
                .thumbnail_store
                .as_ref()
                .map(|store| guarded(step, || store.release_memory_handles())),
            CleanupStep::EvictPooledImages => {
                self.pooled_images.as_ref().map(|cache| guarded(step, || cache.evict()))
            }
            CleanupStep::ClearTempFiles => {
                self.temp_files.as_ref().map(|cache| guarded(step, || cache.clear()))
            }
            CleanupStep::ClearThumbnailHandles => {
                self.thumbnail_handles.as_ref().map(|cache| guarded(step, || cache.clear()))
            }
        };

        outcome.unwrap_or_else(|| {
            debug!(step = %step, "cleanup step skipped, no collaborator");
            StepOutcome::Skipped
        })
    }
}

/// Run one step, converting errors and panics into an outcome
fn guarded<F>(step: CleanupStep, action: F) -> StepOutcome
where
    F: FnOnce() -> Result<(), CleanupError>,
{
    match catch_unwind(AssertUnwindSafe(action)) {
        Ok(Ok(())) => {
            debug!(step = %step, "cleanup step completed");
            StepOutcome::Completed
        }
        Ok(Err(err)) => {
            error!(step = %step, error = %err, "cleanup step failed");
            StepOutcome::Failed(err.to_string())
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(step = %step, panic = %message, "cleanup step panicked");
            StepOutcome::Panicked(message)
        }
    }
}

impl ContextSwitchListener for CleanupOrchestrator {
    fn on_context_switch(&self, event: &ContextSwitch) {
        debug!(reason = ?event.reason, "running context cleanup");
        self.cleanup_context_resources();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

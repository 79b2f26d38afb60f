//! Page viewer prefetch core
//!
//! Composition layer over `pageview-cache` and `pageview-scheduler`:
//! - [`PrefetchCoordinator`] owns every prefetch component and routes viewer
//!   events (scroll, page navigation, visible thumbnails, book open/close)
//! - [`CleanupOrchestrator`] tears down memory-backed caches on every context
//!   switch, one isolated step at a time
//! - [`PrefetchConfig`] aggregates the configuration of all components

pub mod cleanup;
pub mod config;
pub mod coordinator;

pub use cleanup::{
    CleanupError, CleanupOrchestrator, CleanupReport, CleanupStep, DecodeInstancePool,
    PersistedThumbnailStore, PooledImageCache, StepOutcome, TempFileCache, ThumbnailHandleCache,
};
pub use config::{ConfigError, PrefetchConfig};
pub use coordinator::{
    CoordinatorStats, PageRequest, PrefetchCoordinator, PrefetchCoordinatorBuilder, ScrollAxis,
    ScrollPrediction, ScrollUpdate,
};

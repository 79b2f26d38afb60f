//! Page viewer prefetch scheduling
//!
//! Decides what to fetch ahead of the reader and when:
//! - [`VelocityTracker`], [`RangePredictor`] and [`PredictiveLoader`] turn
//!   scroll samples into look-ahead ranges
//! - [`PreloadQueue`] decodes pages one at a time in priority order and
//!   discards results that outlive their session
//! - [`BatchRequestGate`] coalesces visible thumbnail keys into fixed-size
//!   remote calls
//! - [`ContextSignal`] delivers "book opened / viewer closed" events
//!
//! # Example
//!
//! ```
//! use pageview_scheduler::{LoadDirection, PredictiveLoader};
//!
//! let mut loader = PredictiveLoader::default();
//! loader.record(0.0, 0.0, 0.0);
//! loader.record(0.0, 80.0, 50.0);
//!
//! assert_eq!(loader.direction(), LoadDirection::Right);
//! let range = loader.adaptive_range(3, 40).unwrap();
//! assert_eq!(range.start, 3);
//! assert_eq!(range.end, 13);
//! ```

mod batch;
mod error;
mod preload;
mod priority;
mod session;
mod velocity;
mod viewport;

// Re-export public API
pub use batch::{BatchConfig, BatchRequestGate, BatchStats, BatchThumbnailEndpoint};
pub use error::ServiceError;
pub use preload::{
    DecodeService, EnqueueOutcome, FallbackDecoder, PreloadConfig, PreloadQueue,
    PreloadQueueBuilder, PreloadStats,
};
pub use priority::{ContentRef, PrefetchPriority, PrefetchTask, PriorityList};
pub use session::{
    ContextSignal, ContextSwitch, ContextSwitchListener, SubscriptionId, SwitchReason,
};
pub use velocity::{ScrollDirection, ScrollSample, VelocityConfig, VelocityReading, VelocityTracker};
pub use viewport::{
    IndexRange, LoadDirection, LoaderConfig, PredictedRange, PredictiveLoader, RangePredictor,
};

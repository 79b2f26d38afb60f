//! Viewport look-ahead prediction
//!
//! Two predictors live here:
//! 1. [`RangePredictor`] - coordinate based; projects the current viewport
//!    range along the smoothed scroll velocity
//! 2. [`PredictiveLoader`] - index based; keeps a short sample history and
//!    picks which item indices to prefetch around the current one

use std::collections::VecDeque;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::velocity::{
    ScrollDirection, ScrollSample, VelocityConfig, VelocityReading, VelocityTracker,
};

/// Velocity (units/ms) at which prediction confidence saturates
const FULL_CONFIDENCE_VELOCITY: f64 = 2.0;

/// Predicted coordinate range
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictedRange {
    /// Range start (never negative)
    pub start: f64,

    /// Range end
    pub end: f64,

    /// Confidence in `[0, 1]`
    pub confidence: f64,
}

impl PredictedRange {
    /// Width of the range
    pub fn width(&self) -> f64 {
        self.end - self.start
    }
}

/// Coordinate-based look-ahead predictor
///
/// # Example
///
/// ```
/// use pageview_scheduler::{RangePredictor, ScrollSample, VelocityConfig};
///
/// let mut predictor = RangePredictor::new(&VelocityConfig::default());
/// predictor.update(ScrollSample::new(0.0, 0.0));
/// predictor.update(ScrollSample::new(100.0, 100.0));
///
/// let range = predictor.predict(1000.0, 1800.0, 800.0).unwrap();
/// assert_eq!(range.start, 1800.0);
/// assert_eq!(range.end, 3400.0);
/// ```
#[derive(Debug, Clone)]
pub struct RangePredictor {
    tracker: VelocityTracker,
    prediction_multiplier: f64,
}

impl RangePredictor {
    /// Create a predictor
    pub fn new(config: &VelocityConfig) -> Self {
        Self {
            tracker: VelocityTracker::new(config),
            prediction_multiplier: config.prediction_multiplier,
        }
    }

    /// Feed a scroll sample
    pub fn update(&mut self, sample: ScrollSample) -> VelocityReading {
        self.tracker.update(sample)
    }

    /// Current velocity reading
    pub fn reading(&self) -> VelocityReading {
        self.tracker.reading()
    }

    /// Predict the range the user is about to reach
    ///
    /// Returns `None` when there is no direction signal.
    pub fn predict(
        &self,
        range_start: f64,
        range_end: f64,
        viewport_extent: f64,
    ) -> Option<PredictedRange> {
        let reading = self.tracker.reading();
        let distance = viewport_extent * self.prediction_multiplier;
        let confidence = (reading.velocity.abs() / FULL_CONFIDENCE_VELOCITY).min(1.0);

        let (start, end) = match reading.direction {
            ScrollDirection::None => return None,
            ScrollDirection::Forward => (range_end, range_end + distance),
            ScrollDirection::Backward => ((range_start - distance).max(0.0), range_start),
        };

        Some(PredictedRange {
            start,
            end,
            confidence,
        })
    }

    /// Forget velocity history
    pub fn reset(&mut self) {
        self.tracker.reset();
    }
}

impl Default for RangePredictor {
    fn default() -> Self {
        Self::new(&VelocityConfig::default())
    }
}

/// Two-axis scroll direction used by [`PredictiveLoader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadDirection {
    /// Towards the top of a vertical list
    Up,
    /// Towards the bottom of a vertical list
    Down,
    /// Towards the start of a horizontal list
    Left,
    /// Towards the end of a horizontal list
    Right,
    /// No committed direction yet
    #[default]
    None,
}

impl LoadDirection {
    /// Whether the direction moves towards higher indices
    pub fn is_forward(&self) -> bool {
        matches!(self, LoadDirection::Down | LoadDirection::Right)
    }

    /// Whether the direction moves towards lower indices
    pub fn is_backward(&self) -> bool {
        matches!(self, LoadDirection::Up | LoadDirection::Left)
    }

    fn opposite(&self) -> LoadDirection {
        match self {
            LoadDirection::Up => LoadDirection::Down,
            LoadDirection::Down => LoadDirection::Up,
            LoadDirection::Left => LoadDirection::Right,
            LoadDirection::Right => LoadDirection::Left,
            LoadDirection::None => LoadDirection::None,
        }
    }
}

/// Inclusive range of item indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRange {
    /// First index (inclusive)
    pub start: usize,
    /// Last index (inclusive)
    pub end: usize,
}

impl IndexRange {
    /// Number of indices in the range
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    /// Always `false`; an index range holds at least one index
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Check if an index lies in the range
    pub fn contains(&self, index: usize) -> bool {
        (self.start..=self.end).contains(&index)
    }

    /// Iterate the indices
    pub fn indices(&self) -> RangeInclusive<usize> {
        self.start..=self.end
    }
}

/// Index-based predictor parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Base number of items to prefetch ahead
    pub look_ahead: usize,

    /// Upper bound for the adaptive look-ahead
    pub max_look_ahead: usize,

    /// Minimum dominant-axis delta (units) before a direction change commits
    pub scroll_threshold: f64,

    /// Instantaneous speed (units/ms) above which transient reversals are ignored
    pub hold_speed: f64,

    /// Number of samples kept in the ring buffer
    pub history_len: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            look_ahead: 5,
            max_look_ahead: 50,
            scroll_threshold: 50.0,
            hold_speed: 2.0,
            history_len: 10,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LoaderSample {
    scroll_top: f64,
    scroll_left: f64,
    timestamp_ms: f64,
}

/// Number of trailing samples used for the windowed velocity
const VELOCITY_WINDOW: usize = 3;

/// Index-based predictive loader
///
/// # Example
///
/// ```
/// use pageview_scheduler::{LoadDirection, PredictiveLoader};
///
/// let mut loader = PredictiveLoader::default();
/// loader.record(0.0, 0.0, 0.0);
/// loader.record(60.0, 0.0, 100.0);
/// assert_eq!(loader.direction(), LoadDirection::Down);
///
/// let range = loader.get_predictive_range(10, 100, LoadDirection::Down).unwrap();
/// assert_eq!((range.start, range.end), (10, 15));
/// ```
#[derive(Debug, Clone)]
pub struct PredictiveLoader {
    config: LoaderConfig,
    samples: VecDeque<LoaderSample>,
    direction: LoadDirection,
    speed: f64,
}

impl PredictiveLoader {
    /// Create a loader
    pub fn new(config: LoaderConfig) -> Self {
        let capacity = config.history_len.max(VELOCITY_WINDOW);
        Self {
            config: LoaderConfig {
                history_len: capacity,
                ..config
            },
            samples: VecDeque::with_capacity(capacity),
            direction: LoadDirection::None,
            speed: 0.0,
        }
    }

    /// Record a scroll sample and get the committed direction
    pub fn record(
        &mut self,
        scroll_top: f64,
        scroll_left: f64,
        timestamp_ms: f64,
    ) -> LoadDirection {
        self.samples.push_back(LoaderSample {
            scroll_top,
            scroll_left,
            timestamp_ms,
        });
        while self.samples.len() > self.config.history_len {
            self.samples.pop_front();
        }

        let n = self.samples.len();
        if n < 2 {
            return self.direction;
        }

        let first = self.samples[n.saturating_sub(VELOCITY_WINDOW)];
        let prev = self.samples[n - 2];
        let last = self.samples[n - 1];

        let dt = last.timestamp_ms - first.timestamp_ms;
        if dt <= 0.0 {
            return self.direction;
        }

        let dx = last.scroll_left - first.scroll_left;
        let dy = last.scroll_top - first.scroll_top;
        self.speed = dx.hypot(dy) / dt;

        let step_dt = last.timestamp_ms - prev.timestamp_ms;
        let instant_speed = if step_dt > 0.0 {
            (last.scroll_left - prev.scroll_left).hypot(last.scroll_top - prev.scroll_top) / step_dt
        } else {
            self.speed
        };

        let (delta, candidate) = if dy.abs() >= dx.abs() {
            let direction = if dy > 0.0 {
                LoadDirection::Down
            } else if dy < 0.0 {
                LoadDirection::Up
            } else {
                LoadDirection::None
            };
            (dy, direction)
        } else {
            let direction = if dx > 0.0 { LoadDirection::Right } else { LoadDirection::Left };
            (dx, direction)
        };

        if delta.abs() < self.config.scroll_threshold {
            return self.direction;
        }

        if candidate == self.direction.opposite()
            && self.direction != LoadDirection::None
            && instant_speed > self.config.hold_speed
            && !self.reversal_sustained(candidate)
        {
            trace!(
                held = ?self.direction,
                candidate = ?candidate,
                instant_speed,
                "holding direction through reversal"
            );
            return self.direction;
        }

        self.direction = candidate;
        self.direction
    }

    /// Whether every step of the velocity window moves towards `candidate`
    fn reversal_sustained(&self, candidate: LoadDirection) -> bool {
        let n = self.samples.len();
        if n < VELOCITY_WINDOW {
            return false;
        }

        (n - VELOCITY_WINDOW + 1..n).all(|i| {
            let (from, to) = (self.samples[i - 1], self.samples[i]);
            let step = match candidate {
                LoadDirection::Up | LoadDirection::Down => to.scroll_top - from.scroll_top,
                LoadDirection::Left | LoadDirection::Right => to.scroll_left - from.scroll_left,
                LoadDirection::None => return false,
            };
            if candidate.is_forward() {
                step > 0.0
            } else {
                step < 0.0
            }
        })
    }

    /// Committed direction
    pub fn direction(&self) -> LoadDirection {
        self.direction
    }

    /// Speed (units/ms) over the velocity window
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Indices to prefetch around `current_index` using the base look-ahead
    ///
    /// Returns `None` when there are no items.
    pub fn get_predictive_range(
        &self,
        current_index: usize,
        total_items: usize,
        direction: LoadDirection,
    ) -> Option<IndexRange> {
        range_around(current_index, total_items, direction, self.config.look_ahead)
    }

    /// Look-ahead scaled by the current scroll speed
    pub fn get_adaptive_look_ahead(&self, direction: LoadDirection) -> usize {
        let base = self.config.look_ahead;
        if direction == LoadDirection::None {
            return base;
        }

        if self.speed > 1.0 {
            (base * 2).min(self.config.max_look_ahead)
        } else if self.speed > 0.5 {
            ((base as f64 * 1.5).round() as usize).min(self.config.max_look_ahead)
        } else {
            base
        }
    }

    /// Indices to prefetch using the committed direction and adaptive look-ahead
    pub fn adaptive_range(&self, current_index: usize, total_items: usize) -> Option<IndexRange> {
        let look_ahead = self.get_adaptive_look_ahead(self.direction);
        range_around(current_index, total_items, self.direction, look_ahead)
    }

    /// Drop sample history and the committed direction
    pub fn reset(&mut self) {
        self.samples.clear();
        self.direction = LoadDirection::None;
        self.speed = 0.0;
    }
}

impl Default for PredictiveLoader {
    fn default() -> Self {
        Self::new(LoaderConfig::default())
    }
}

fn range_around(
    current_index: usize,
    total_items: usize,
    direction: LoadDirection,
    look_ahead: usize,
) -> Option<IndexRange> {
    if total_items == 0 {
        return None;
    }

    let last = total_items - 1;
    let current = current_index.min(last);

    let (start, end) = if direction.is_forward() {
        (current, current.saturating_add(look_ahead).min(last))
    } else if direction.is_backward() {
        (current.saturating_sub(look_ahead), current)
    } else {
        let half = look_ahead / 2;
        (current.saturating_sub(half), current.saturating_add(half).min(last))
    };

    Some(IndexRange { start, end })
}

//! Scroll velocity tracking
//!
//! Derives a direction and an exponentially smoothed velocity from a stream
//! of scalar scroll positions. Only the previous sample and the smoothed
//! value are retained.

use serde::{Deserialize, Serialize};

/// Scroll direction along a single axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScrollDirection {
    /// No reliable signal
    #[default]
    None,

    /// Increasing position (down / next page)
    Forward,

    /// Decreasing position (up / previous page)
    Backward,
}

/// A single scroll position sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollSample {
    /// Scroll offset
    pub position: f64,

    /// Sample time in milliseconds
    pub timestamp_ms: f64,
}

impl ScrollSample {
    /// Create a sample
    pub fn new(position: f64, timestamp_ms: f64) -> Self {
        Self {
            position,
            timestamp_ms,
        }
    }
}

/// Output of [`VelocityTracker::update`]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VelocityReading {
    /// Current direction
    pub direction: ScrollDirection,

    /// Smoothed velocity in units per millisecond (signed)
    pub velocity: f64,
}

/// Velocity tracking and range prediction parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VelocityConfig {
    /// EMA smoothing factor applied to the newest instantaneous velocity
    pub smoothing_factor: f64,

    /// Minimum |velocity| (units/ms) that yields a direction
    pub min_velocity: f64,

    /// Prediction distance as a multiple of the viewport extent
    pub prediction_multiplier: f64,
}

impl Default for VelocityConfig {
    fn default() -> Self {
        Self {
            smoothing_factor: 0.3,
            min_velocity: 0.1,
            prediction_multiplier: 2.0,
        }
    }
}

/// Exponentially smoothed scroll velocity tracker
///
/// # Example
///
/// ```
/// use pageview_scheduler::{ScrollDirection, ScrollSample, VelocityTracker};
///
/// let mut tracker = VelocityTracker::default();
/// tracker.update(ScrollSample::new(0.0, 0.0));
/// let reading = tracker.update(ScrollSample::new(100.0, 100.0));
///
/// assert_eq!(reading.direction, ScrollDirection::Forward);
/// assert!((reading.velocity - 0.3).abs() < 1e-9);
/// ```
#[derive(Debug, Clone)]
pub struct VelocityTracker {
    smoothing_factor: f64,
    min_velocity: f64,
    last: Option<ScrollSample>,
    reading: VelocityReading,
}

impl VelocityTracker {
    /// Create a tracker
    pub fn new(config: &VelocityConfig) -> Self {
        Self {
            smoothing_factor: config.smoothing_factor.clamp(0.0, 1.0),
            min_velocity: config.min_velocity.abs(),
            last: None,
            reading: VelocityReading::default(),
        }
    }

    /// Feed a sample and get the updated reading
    ///
    /// Samples with a non-increasing timestamp leave the reading and the stored
    /// sample untouched.
    pub fn update(&mut self, sample: ScrollSample) -> VelocityReading {
        let Some(last) = self.last else {
            self.last = Some(sample);
            return self.reading;
        };

        let dt = sample.timestamp_ms - last.timestamp_ms;
        if dt <= 0.0 {
            return self.reading;
        }

        let instant = (sample.position - last.position) / dt;
        let velocity = self.smoothing_factor * instant
            + (1.0 - self.smoothing_factor) * self.reading.velocity;

        let direction = if velocity > self.min_velocity {
            ScrollDirection::Forward
        } else if velocity < -self.min_velocity {
            ScrollDirection::Backward
        } else {
            ScrollDirection::None
        };

        self.last = Some(sample);
        self.reading = VelocityReading {
            direction,
            velocity,
        };
        self.reading
    }

    /// Last computed reading
    pub fn reading(&self) -> VelocityReading {
        self.reading
    }

    /// Forget all samples
    pub fn reset(&mut self) {
        self.last = None;
        self.reading = VelocityReading::default();
    }
}

impl Default for VelocityTracker {
    fn default() -> Self {
        Self::new(&VelocityConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_first_sample_has_no_direction() {
        let mut tracker = VelocityTracker::default();
        let reading = tracker.update(ScrollSample::new(500.0, 1000.0));
        assert_eq!(reading.direction, ScrollDirection::None);
        assert_eq!(reading.velocity, 0.0);
    }

    #[test]
    fn test_first_real_sample_smooths_from_zero() {
        let mut tracker = VelocityTracker::default();
        tracker.update(ScrollSample::new(0.0, 1000.0));
        let reading = tracker.update(ScrollSample::new(100.0, 1100.0));

        assert_eq!(reading.direction, ScrollDirection::Forward);
        assert!(approx(reading.velocity, 0.3));
    }

    #[test]
    fn test_ema_sequence() {
        let mut tracker = VelocityTracker::default();
        tracker.update(ScrollSample::new(0.0, 0.0));
        tracker.update(ScrollSample::new(100.0, 100.0)); // 0.3
        let reading = tracker.update(ScrollSample::new(300.0, 200.0)); // instant 2.0

        assert!(approx(reading.velocity, 0.3 * 2.0 + 0.7 * 0.3));

        // Reverse hard enough to flip the sign
        let reading = tracker.update(ScrollSample::new(-300.0, 300.0)); // instant -6.0
        assert!(approx(reading.velocity, 0.3 * -6.0 + 0.7 * 0.81));
        assert_eq!(reading.direction, ScrollDirection::Backward);
    }

    #[test]
    fn test_duplicate_timestamp_keeps_reading() {
        let mut tracker = VelocityTracker::default();
        tracker.update(ScrollSample::new(0.0, 0.0));
        let before = tracker.update(ScrollSample::new(100.0, 100.0));

        let same = tracker.update(ScrollSample::new(5000.0, 100.0));
        assert_eq!(same, before);

        // Next delta spans from the last accepted sample
        let reading = tracker.update(ScrollSample::new(200.0, 200.0));
        assert!(approx(reading.velocity, 0.3 * 1.0 + 0.7 * 0.3));
    }

    #[test]
    fn test_slow_scroll_has_no_direction() {
        let mut tracker = VelocityTracker::default();
        tracker.update(ScrollSample::new(0.0, 0.0));
        let reading = tracker.update(ScrollSample::new(10.0, 100.0)); // 0.3 * 0.1
        assert_eq!(reading.direction, ScrollDirection::None);
    }

    #[test]
    fn test_reset() {
        let mut tracker = VelocityTracker::default();
        tracker.update(ScrollSample::new(0.0, 0.0));
        tracker.update(ScrollSample::new(100.0, 100.0));
        tracker.reset();

        assert_eq!(tracker.reading(), VelocityReading::default());
        let reading = tracker.update(ScrollSample::new(900.0, 900.0));
        assert_eq!(reading.direction, ScrollDirection::None);
    }
}

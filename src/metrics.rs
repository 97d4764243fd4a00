//! ==============================================================================
//! metrics.rs - scroll metrics aggregator
//! ==============================================================================
//!
//! purpose:
//!     folds raw scroll samples into the single ScrollMetrics record.
//!     derives direction, instantaneous speed, a simple moving average of
//!     the last N speeds, container index and total distance.
//!
//! relationships:
//!     - used by: server.rs (POST /api/scroll-metrics updates the record)
//!     - used by: tracker.rs (local metrics on the client side)
//!     - produces: domain::ScrollMetrics (read by relay.rs)
//!
//! ==============================================================================

use std::collections::VecDeque;

use crate::domain::{Direction, ScrollMetrics, ScrollSample};

/// default moving-average window
pub const DEFAULT_WINDOW: usize = 10;

/// current unix time in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// |delta| / seconds, with a non-positive time delta reported as 0
pub fn instantaneous_speed(delta_px: f64, delta_ms: i64) -> f64 {
    if delta_ms <= 0 || !delta_px.is_finite() {
        return 0.0;
    }
    let speed = delta_px.abs() / (delta_ms as f64 / 1000.0);
    if speed.is_finite() {
        speed
    } else {
        0.0
    }
}

/// which container is centered for a given scroll offset
///
/// an unmeasured (zero) container height maps everything to container 0.
pub fn container_index(position_px: f64, container_height_px: f64) -> i64 {
    if container_height_px <= 0.0 || !container_height_px.is_finite() || !position_px.is_finite() {
        return 0;
    }
    (position_px.max(0.0) / container_height_px).floor() as i64
}

fn total_containers(total_height_px: f64, container_height_px: f64) -> Option<i64> {
    if container_height_px <= 0.0 || !total_height_px.is_finite() || total_height_px < 0.0 {
        return None;
    }
    Some((total_height_px / container_height_px).ceil() as i64)
}

pub struct ScrollAggregator {
    window: usize,
    speeds: VecDeque<f64>,
    /// (position, timestamp) of the previous sample; None until the first one
    last: Option<(f64, i64)>,
    container_height: f64,
    container_entered_ms: i64,
    snapshot: ScrollMetrics,
}

impl ScrollAggregator {
    pub fn new(window: usize, container_height_px: f64) -> Self {
        let window = window.max(1);
        Self {
            window,
            speeds: VecDeque::with_capacity(window),
            last: None,
            container_height: container_height_px.max(0.0),
            container_entered_ms: 0,
            snapshot: ScrollMetrics::default(),
        }
    }

    /// latest computed record
    pub fn snapshot(&self) -> &ScrollMetrics {
        &self.snapshot
    }

    /// fold one sample in and return the new record
    ///
    /// `received_ms` is used when the sample carries no client timestamp.
    pub fn update(&mut self, sample: &ScrollSample, received_ms: i64) -> ScrollMetrics {
        let ts = sample.timestamp_ms.unwrap_or(received_ms);
        let position = sample.scroll_position;

        if let Some(h) = sample.container_height.filter(|h| h.is_finite() && *h > 0.0) {
            self.container_height = h;
        }

        let mut metrics = self.snapshot.clone();

        match self.last {
            // first sample of the session: nothing to diff against
            None => {
                metrics.current_speed = 0.0;
                metrics.direction = Direction::None;
            }
            // a jump too large to represent: treat it like a fresh start
            Some((prev_position, _)) if !(position - prev_position).is_finite() => {
                metrics.current_speed = 0.0;
                metrics.direction = Direction::None;
            }
            Some((prev_position, prev_ts)) => {
                let delta = position - prev_position;
                let speed = instantaneous_speed(delta, ts - prev_ts);

                self.speeds.push_back(speed);
                while self.speeds.len() > self.window {
                    self.speeds.pop_front();
                }

                metrics.current_speed = speed;
                metrics.direction = Direction::from_delta(delta);
                metrics.total_distance = (metrics.total_distance + delta.abs()).min(f64::MAX);
            }
        }

        metrics.average_speed = if self.speeds.is_empty() {
            0.0
        } else {
            let n = self.speeds.len() as f64;
            self.speeds.iter().map(|s| s / n).sum()
        };

        let index = sample
            .container_index
            .unwrap_or_else(|| container_index(position, self.container_height));
        if self.last.is_none() || index != metrics.container_index {
            self.container_entered_ms = ts;
        }
        metrics.container_index = index;
        metrics.time_in_container_ms = (ts - self.container_entered_ms).max(0);

        if let Some(total) = sample
            .total_height
            .and_then(|t| total_containers(t, self.container_height))
        {
            metrics.total_containers = total;
        }

        metrics.scroll_position = position;
        metrics.sample_count += 1;

        self.last = Some((position, ts));
        self.snapshot = metrics.clone();
        metrics
    }
}

impl Default for ScrollAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, 0.0)
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sample(position: f64, ts: i64) -> ScrollSample {
        ScrollSample {
            scroll_position: position,
            timestamp_ms: Some(ts),
            ..Default::default()
        }
    }

    #[test]
    fn directions_and_speeds_over_a_short_scroll() {
        let mut agg = ScrollAggregator::default();

        let first = agg.update(&sample(0.0, 0), 0);
        assert_eq!(first.direction, Direction::None);
        assert_eq!(first.current_speed, 0.0);

        let second = agg.update(&sample(100.0, 1000), 0);
        assert_eq!(second.direction, Direction::Down);
        assert_eq!(second.current_speed, 100.0);

        let third = agg.update(&sample(50.0, 2000), 0);
        assert_eq!(third.direction, Direction::Up);
        assert_eq!(third.current_speed, 50.0);
        assert_eq!(third.average_speed, 75.0);
        assert_eq!(third.total_distance, 150.0);
        assert_eq!(third.sample_count, 3);
    }

    #[test]
    fn identical_timestamps_report_zero_speed() {
        let mut agg = ScrollAggregator::default();
        agg.update(&sample(0.0, 500), 0);
        let m = agg.update(&sample(300.0, 500), 0);
        assert_eq!(m.current_speed, 0.0);
        assert!(m.average_speed.is_finite());
        assert_eq!(m.direction, Direction::Down);
    }

    #[test]
    fn first_sample_never_reports_a_spurious_speed() {
        let mut agg = ScrollAggregator::default();
        let m = agg.update(&sample(90_000.0, 10), 0);
        assert_eq!(m.current_speed, 0.0);
        assert_eq!(m.average_speed, 0.0);
        assert_eq!(m.total_distance, 0.0);
    }

    #[test]
    fn average_is_a_moving_window() {
        let mut agg = ScrollAggregator::new(2, 0.0);
        agg.update(&sample(0.0, 0), 0);
        agg.update(&sample(100.0, 1000), 0); // 100
        agg.update(&sample(400.0, 2000), 0); // 300
        let m = agg.update(&sample(900.0, 3000), 0); // 500
        assert_eq!(m.average_speed, 400.0);
    }

    #[test]
    fn container_index_guards_unmeasured_height() {
        assert_eq!(container_index(1234.0, 0.0), 0);
        assert_eq!(container_index(1600.0, 800.0), 2);
        assert_eq!(container_index(-20.0, 800.0), 0);

        let mut agg = ScrollAggregator::default();
        let m = agg.update(&sample(5000.0, 0), 0);
        assert_eq!(m.container_index, 0);
    }

    #[test]
    fn container_metrics_follow_layout_from_the_sample() {
        let mut agg = ScrollAggregator::default();
        let mut s = sample(900.0, 1000);
        s.container_height = Some(800.0);
        s.total_height = Some(4000.0);
        let m = agg.update(&s, 0);
        assert_eq!(m.container_index, 1);
        assert_eq!(m.total_containers, 5);

        // stays in container 1, dwell time accumulates
        let m = agg.update(&sample(1000.0, 1600), 0);
        assert_eq!(m.container_index, 1);
        assert_eq!(m.time_in_container_ms, 600);
        assert_eq!(m.total_containers, 5);

        // moving into container 2 resets the dwell time
        let m = agg.update(&sample(1700.0, 2000), 0);
        assert_eq!(m.container_index, 2);
        assert_eq!(m.time_in_container_ms, 0);
    }

    #[test]
    fn server_clock_fills_missing_timestamps() {
        let mut agg = ScrollAggregator::default();
        let untimed = |p| ScrollSample {
            scroll_position: p,
            ..Default::default()
        };
        agg.update(&untimed(0.0), 10_000);
        let m = agg.update(&untimed(250.0), 10_500);
        assert_eq!(m.current_speed, 500.0);
    }

    #[test]
    fn extreme_positions_stay_finite_on_the_wire() {
        let mut agg = ScrollAggregator::default();
        agg.update(&sample(1.7e308, 0), 0);
        let m = agg.update(&sample(-1.7e308, 1000), 0);
        assert_eq!(m.current_speed, 0.0);
        assert_eq!(m.direction, Direction::None);
        assert_eq!(m.total_distance, 0.0);

        let m = agg.update(&sample(1.7e308, 1001), 0);
        assert!(m.current_speed.is_finite());
        assert!(m.average_speed.is_finite());
        assert!(m.total_distance.is_finite());

        let json = serde_json::to_value(&m).unwrap();
        assert!(json["totalDistance"].is_number());
        assert!(json["currentSpeed"].is_number());
        assert!(json["averageSpeed"].is_number());
    }
}

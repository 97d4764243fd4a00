//! ==============================================================================
//! tracker.rs - client-side scroll tracker
//! ==============================================================================
//!
//! purpose:
//!     the browser half of the pipeline: turns raw scroll events into
//!     ScrollSamples, keeps local metrics for display, and throttles what
//!     is posted to the server (at most one sample per throttle period, plus
//!     a trailing one so the server learns where scrolling stopped).
//!
//!     `scroll-relay simulate` drives it with a synthetic scroll through the
//!     feed against a running server.
//!
//! relationships:
//!     - uses: metrics.rs (local aggregation)
//!     - talks to: server.rs (POST /api/scroll-metrics) via reqwest
//!
//! ==============================================================================

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::domain::{ScrollMetrics, ScrollSample};
use crate::metrics::{container_index, now_ms, ScrollAggregator, DEFAULT_WINDOW};

/// browser default: one post per 100ms of scrolling
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(100);

pub struct ScrollTracker {
    throttle: Duration,
    container_height: f64,
    total_height: f64,
    last_sent: Option<Instant>,
    pending: Option<ScrollSample>,
    local: ScrollAggregator,
}

impl ScrollTracker {
    pub fn new(throttle: Duration, container_height: f64, total_height: f64) -> Self {
        Self {
            throttle,
            container_height,
            total_height,
            last_sent: None,
            pending: None,
            local: ScrollAggregator::new(DEFAULT_WINDOW, container_height),
        }
    }

    /// record a scroll event; returns the sample to post, if the throttle allows
    pub fn observe(&mut self, position: f64, timestamp_ms: i64, now: Instant) -> Option<ScrollSample> {
        let sample = ScrollSample {
            scroll_position: position,
            timestamp_ms: Some(timestamp_ms),
            container_index: Some(container_index(position, self.container_height)),
            container_height: Some(self.container_height).filter(|h| *h > 0.0),
            total_height: Some(self.total_height).filter(|t| *t > 0.0),
        };
        self.local.update(&sample, timestamp_ms);

        let due = self
            .last_sent
            .map_or(true, |sent| now.saturating_duration_since(sent) >= self.throttle);
        if due {
            self.last_sent = Some(now);
            self.pending = None;
            Some(sample)
        } else {
            self.pending = Some(sample);
            None
        }
    }

    /// the newest sample the throttle held back
    pub fn flush(&mut self) -> Option<ScrollSample> {
        self.pending.take()
    }

    pub fn local_metrics(&self) -> &ScrollMetrics {
        self.local.snapshot()
    }
}

// ==============================================================================
// simulate subcommand
// ==============================================================================

#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// server base url, e.g. http://localhost:3001
    pub url: String,
    pub videos: u32,
    pub container_height: f64,
    pub step_px: f64,
    pub step_ms: u64,
    pub throttle_ms: u64,
}

#[derive(Debug)]
pub struct SimulationSummary {
    pub events: u64,
    pub posted: u64,
    pub failed: u64,
    pub local: ScrollMetrics,
}

/// scroll from the first video to the last, posting throttled samples
pub async fn simulate(opts: &SimulateOptions) -> Result<SimulationSummary> {
    if opts.step_px <= 0.0 || opts.container_height <= 0.0 || opts.videos == 0 {
        bail!("step, container height and video count must be positive");
    }

    let endpoint = format!("{}/api/scroll-metrics", opts.url.trim_end_matches('/'));
    let client = reqwest::Client::new();
    let total_height = f64::from(opts.videos) * opts.container_height;
    let bottom = total_height - opts.container_height;
    let mut tracker = ScrollTracker::new(
        Duration::from_millis(opts.throttle_ms),
        opts.container_height,
        total_height,
    );

    info!(
        "[SIMULATE] scrolling {} videos ({}px each) against {}",
        opts.videos, opts.container_height, endpoint
    );

    let mut summary = SimulationSummary {
        events: 0,
        posted: 0,
        failed: 0,
        local: ScrollMetrics::default(),
    };
    let mut position = 0.0_f64;

    loop {
        summary.events += 1;
        if let Some(sample) = tracker.observe(position, now_ms(), Instant::now()) {
            post_sample(&client, &endpoint, &sample, &mut summary).await;
        }
        if position >= bottom {
            break;
        }
        position = (position + opts.step_px).min(bottom);
        tokio::time::sleep(Duration::from_millis(opts.step_ms)).await;
    }

    if let Some(sample) = tracker.flush() {
        post_sample(&client, &endpoint, &sample, &mut summary).await;
    }

    if summary.posted == 0 && summary.failed > 0 {
        bail!("server at {} rejected every sample", opts.url);
    }

    summary.local = tracker.local_metrics().clone();
    info!(
        "[SIMULATE] done: {} events, {} posted, {} failed, avg {:.0}px/s",
        summary.events, summary.posted, summary.failed, summary.local.average_speed
    );
    Ok(summary)
}

async fn post_sample(
    client: &reqwest::Client,
    endpoint: &str,
    sample: &ScrollSample,
    summary: &mut SimulationSummary,
) {
    let result = async {
        client
            .post(endpoint)
            .json(sample)
            .send()
            .await
            .context("request failed")?
            .error_for_status()
            .context("server error")?;
        anyhow::Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            summary.posted += 1;
            debug!("[SIMULATE] posted position {:.0}", sample.scroll_position);
        }
        Err(e) => {
            summary.failed += 1;
            warn!("[SIMULATE] post failed: {:#}", e);
        }
    }
}

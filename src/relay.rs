//! ==============================================================================
//! relay.rs - debounced metrics -> device relay
//! ==============================================================================
//!
//! purpose:
//!     the http handler hands every fresh ScrollMetrics snapshot to the relay
//!     and returns at once. a single worker task waits for a quiet window of
//!     `debounce` after the latest snapshot, then sends only that one.
//!
//!     submit ─┐   submit ─┐   submit ─┐
//!             v           v           v         (quiet for `debounce`)
//!     worker: [restart]   [restart]   [restart] ───────────> send(last)
//!
//!     send failures are counted and logged, never retried: the next scroll
//!     update supersedes them.
//!
//! relationships:
//!     - used by: server.rs (POST /api/scroll-metrics, GET /api/device-status)
//!     - uses: device.rs (DeviceChannel), command.rs (DeviceCommand::from_metrics)
//!
//! ==============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::device::{DeviceChannel, SendOutcome};
use crate::domain::{DeviceCommand, ScrollMetrics};
use crate::metrics::now_ms;

/// what happened to the most recent relay attempt
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayReport {
    pub command: DeviceCommand,
    pub outcome: Option<SendOutcome>,
    pub error: Option<String>,
    pub at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub attempts: u64,
    pub delivered: u64,
    pub failed: u64,
    pub last: Option<RelayReport>,
}

#[derive(Default)]
struct StatsInner {
    attempts: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    last: Mutex<Option<RelayReport>>,
}

/// handle to the relay worker
#[derive(Clone)]
pub struct Relay {
    tx: mpsc::UnboundedSender<ScrollMetrics>,
    debounce: Duration,
    stats: Arc<StatsInner>,
}

impl Relay {
    /// start the worker; it stops once every handle is dropped
    pub fn spawn(channel: DeviceChannel, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(StatsInner::default());

        tokio::spawn(run(rx, channel, debounce, stats.clone()));
        info!("[RELAY] worker started ({}ms debounce)", debounce.as_millis());

        Self { tx, debounce, stats }
    }

    /// never blocks; the newest snapshot wins
    pub fn submit(&self, metrics: ScrollMetrics) {
        if self.tx.send(metrics).is_err() {
            warn!("[RELAY] worker stopped, update dropped");
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            attempts: self.stats.attempts.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            last: self
                .stats
                .last
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<ScrollMetrics>,
    channel: DeviceChannel,
    debounce: Duration,
    stats: Arc<StatsInner>,
) {
    loop {
        let Some(mut latest) = rx.recv().await else {
            break;
        };

        let mut closed = false;
        loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(metrics) => latest = metrics,
                    None => {
                        closed = true;
                        break;
                    }
                },
                _ = tokio::time::sleep(debounce) => break,
            }
        }

        deliver(&channel, &stats, &latest).await;
        if closed {
            break;
        }
    }
    debug!("[RELAY] worker stopped");
}

async fn deliver(channel: &DeviceChannel, stats: &StatsInner, metrics: &ScrollMetrics) {
    let command = DeviceCommand::from_metrics(metrics);
    stats.attempts.fetch_add(1, Ordering::Relaxed);

    let report = match channel.send(&command).await {
        Ok(outcome) => {
            stats.delivered.fetch_add(1, Ordering::Relaxed);
            debug!(
                "[RELAY] -> angle {} dir {} speed {} interval {}ms ({:?})",
                command.angle_deg, command.direction, command.speed_byte, command.interval_ms, outcome
            );
            RelayReport {
                command,
                outcome: Some(outcome),
                error: None,
                at: now_ms(),
            }
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!("[RELAY] ⚠ send failed: {}", e);
            RelayReport {
                command,
                outcome: None,
                error: Some(e.to_string()),
                at: now_ms(),
            }
        }
    };

    *stats.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(report);
}

//! In-process telemetry taps: deploy lifecycle counters and a coarse
//! duration histogram. Hooks only; no external metrics backend.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Histogram bucket upper bounds, milliseconds.
const BUCKET_BOUNDS_MS: [u64; 5] = [100, 1_000, 10_000, 60_000, u64::MAX];

#[derive(Default)]
pub struct Telemetry {
    deploy_start: AtomicU64,
    deploy_stop: AtomicU64,
    deploy_error: AtomicU64,
    duration_buckets: [AtomicU64; 5],
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub deploy_start: u64,
    pub deploy_stop: u64,
    pub deploy_error: u64,
    pub duration_buckets_ms: Vec<(u64, u64)>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deploy_start(&self, service: &str) {
        self.deploy_start.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: "nopea::telemetry", service, event = "deploy.start");
    }

    pub fn deploy_stop(&self, service: &str, duration_ms: u64) {
        self.deploy_stop.fetch_add(1, Ordering::Relaxed);
        self.observe_duration(duration_ms);
        tracing::debug!(
            target: "nopea::telemetry",
            service,
            duration_ms,
            event = "deploy.stop"
        );
    }

    pub fn deploy_error(&self, service: &str, duration_ms: u64) {
        self.deploy_error.fetch_add(1, Ordering::Relaxed);
        self.observe_duration(duration_ms);
        tracing::debug!(
            target: "nopea::telemetry",
            service,
            duration_ms,
            event = "deploy.error"
        );
    }

    fn observe_duration(&self, duration_ms: u64) {
        for (i, bound) in BUCKET_BOUNDS_MS.iter().enumerate() {
            if duration_ms <= *bound {
                self.duration_buckets[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            deploy_start: self.deploy_start.load(Ordering::Relaxed),
            deploy_stop: self.deploy_stop.load(Ordering::Relaxed),
            deploy_error: self.deploy_error.load(Ordering::Relaxed),
            duration_buckets_ms: BUCKET_BOUNDS_MS
                .iter()
                .zip(&self.duration_buckets)
                .map(|(bound, count)| (*bound, count.load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

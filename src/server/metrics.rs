// src/server/metrics.rs
//! Cache server metrics
//!
//! Simple atomic counters for the hit/miss paths and served volume,
//! exposed through the status endpoint. The counter names match what a
//! scraper would export; a Prometheus client is deliberately not wired in
//! here.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Metrics collector shared by the request handlers
#[derive(Default)]
pub struct CacheMetrics {
    /// Requests served from the local disk cache
    disk_cache_hits: AtomicU64,
    /// Requests that missed the local disk cache
    disk_cache_misses: AtomicU64,
    /// Bytes streamed to clients
    bytes_served: AtomicU64,
    /// Server start time
    start_time: OnceLock<Instant>,
}

impl CacheMetrics {
    pub fn new() -> Self {
        let metrics = Self::default();
        let _ = metrics.start_time.set(Instant::now());
        metrics
    }

    /// Record a disk cache hit
    pub fn record_hit(&self) {
        self.disk_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a disk cache miss
    pub fn record_miss(&self) {
        self.disk_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes streamed to a client
    pub fn record_bytes_served(&self, bytes: u64) {
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get a point-in-time snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self
            .start_time
            .get()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);
        let hits = self.disk_cache_hits.load(Ordering::Relaxed);
        let misses = self.disk_cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        MetricsSnapshot {
            disk_cache_hits: hits,
            disk_cache_misses: misses,
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
            hit_rate,
            uptime_secs: uptime.as_secs(),
        }
    }
}

/// Serializable snapshot for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub disk_cache_hits: u64,
    pub disk_cache_misses: u64,
    pub bytes_served: u64,
    pub hit_rate: f64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_basic() {
        let metrics = CacheMetrics::new();

        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        metrics.record_bytes_served(1000);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.disk_cache_hits, 2);
        assert_eq!(snapshot.disk_cache_misses, 1);
        assert_eq!(snapshot.bytes_served, 1000);
        assert!((snapshot.hit_rate - 66.67).abs() < 1.0);
    }

    #[test]
    fn test_hit_rate_zero_requests() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.snapshot().hit_rate, 0.0);
    }
}

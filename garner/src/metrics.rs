use serde::{Deserialize, Serialize};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Upper bounds (ms) of the latency histogram buckets, plus an implicit overflow bucket.
const LATENCY_BUCKETS_MS: [u64; 10] = [1, 2, 5, 10, 25, 50, 100, 250, 1_000, 5_000];

/// Process-local metrics registry for the Garner core.
///
/// Counters and histograms are plain atomics - recording never locks, so the hot validation
/// path can stamp latency without contention. `snapshot` produces a serialisable copy for the
/// operational surface.
#[derive(Debug, Default)]
pub struct Metrics {
    pub events_processed: Counter,
    pub events_rejected: Counter,
    pub events_deferred: Counter,
    pub events_dead_lettered: Counter,
    pub validations_approved: Counter,
    pub validations_rejected: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub event_latency: Histogram,
    pub validation_latency: Histogram,
    pub lock_wait: Histogram,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_processed: self.events_processed.get(),
            events_rejected: self.events_rejected.get(),
            events_deferred: self.events_deferred.get(),
            events_dead_lettered: self.events_dead_lettered.get(),
            validations_approved: self.validations_approved.get(),
            validations_rejected: self.validations_rejected.get(),
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            event_latency: self.event_latency.snapshot(),
            validation_latency: self.validation_latency.snapshot(),
            lock_wait: self.lock_wait.snapshot(),
        }
    }
}

/// Monotonic atomic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket latency histogram.
#[derive(Debug, Default)]
pub struct Histogram {
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    count: AtomicU64,
    sum_ms: AtomicU64,
}

impl Histogram {
    pub fn record(&self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        let bucket = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let buckets = self
            .buckets
            .iter()
            .map(|bucket| bucket.load(Ordering::Relaxed))
            .collect::<Vec<_>>();

        HistogramSnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
            p99_upper_bound_ms: percentile_upper_bound(&buckets, 0.99),
            buckets,
        }
    }
}

/// Upper bound of the bucket containing the requested percentile, or `None` when empty.
fn percentile_upper_bound(buckets: &[u64], percentile: f64) -> Option<u64> {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return None;
    }

    let rank = (total as f64 * percentile).ceil() as u64;
    let mut cumulative = 0;
    for (index, count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= rank {
            return Some(
                LATENCY_BUCKETS_MS
                    .get(index)
                    .copied()
                    .unwrap_or(u64::MAX),
            );
        }
    }
    None
}

/// Serialisable point-in-time copy of the registry.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct MetricsSnapshot {
    pub events_processed: u64,
    pub events_rejected: u64,
    pub events_deferred: u64,
    pub events_dead_lettered: u64,
    pub validations_approved: u64,
    pub validations_rejected: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub event_latency: HistogramSnapshot,
    pub validation_latency: HistogramSnapshot,
    pub lock_wait: HistogramSnapshot,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_ms: u64,
    pub p99_upper_bound_ms: Option<u64>,
    pub buckets: Vec<u64>,
}

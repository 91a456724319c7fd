//! Hit/miss/eviction counters per named cache bucket
//! Observational only: nothing reads these counters to make decisions.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bucket used by the session registry
pub const SESSIONS_BUCKET: &str = "sessions";
/// Bucket used by the bridge decision cache
pub const BRIDGE_BUCKET: &str = "bridge_decisions";

#[derive(Debug, Default)]
struct BucketCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time view of one bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BucketStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

impl BucketStats {
    fn from_counters(counters: &BucketCounters) -> Self {
        let hits = counters.hits.load(Ordering::Relaxed);
        let misses = counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        Self {
            hits,
            misses,
            evictions: counters.evictions.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
        }
    }
}

#[derive(Debug, Default)]
pub struct CacheMetrics {
    buckets: DashMap<String, BucketCounters>,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_counters(&self, bucket: &str, f: impl FnOnce(&BucketCounters)) {
        if let Some(counters) = self.buckets.get(bucket) {
            f(counters.value());
            return;
        }
        let counters = self.buckets.entry(bucket.to_string()).or_default();
        f(counters.value());
    }

    pub fn record_hit(&self, bucket: &str) {
        self.with_counters(bucket, |c| {
            c.hits.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_miss(&self, bucket: &str) {
        self.with_counters(bucket, |c| {
            c.misses.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_eviction(&self, bucket: &str, count: usize) {
        if count == 0 {
            return;
        }
        self.with_counters(bucket, |c| {
            c.evictions.fetch_add(count as u64, Ordering::Relaxed);
        });
    }

    /// Stats for a single bucket (zeroed if it was never touched)
    pub fn bucket(&self, bucket: &str) -> BucketStats {
        self.buckets
            .get(bucket)
            .map(|c| BucketStats::from_counters(&c))
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, BucketStats> {
        self.buckets
            .iter()
            .map(|entry| (entry.key().clone(), BucketStats::from_counters(entry.value())))
            .collect()
    }

    pub fn reset(&self) {
        self.buckets.clear();
    }
}

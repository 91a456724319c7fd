//! Generic key/value cache with expiry-on-read
//! There is no background timer. `clean()` is the eager sweep and callers
//! run it opportunistically (startup, diagnostics requests).

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::metrics::CacheMetrics;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub data: T,
    pub timestamp: Instant,
    pub tag: Option<String>,
}

#[derive(Debug)]
pub struct TtlCache<T> {
    entries: DashMap<String, CacheEntry<T>>,
    ttl: Duration,
    metrics: Option<(Arc<CacheMetrics>, String)>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            metrics: None,
        }
    }

    /// Cache whose hits, misses and evictions are reported under `bucket`
    pub fn with_metrics(ttl: Duration, metrics: Arc<CacheMetrics>, bucket: impl Into<String>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            metrics: Some((metrics, bucket.into())),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry<T>> {
        self.get_at(key, Instant::now())
    }

    /// Look up `key` as of `now`. Entries older than the TTL are removed.
    pub fn get_at(&self, key: &str, now: Instant) -> Option<CacheEntry<T>> {
        let expired = match self.entries.get(key) {
            Some(entry) if !self.is_expired(&entry, now) => {
                let hit = entry.value().clone();
                drop(entry);
                self.report(|m, bucket| m.record_hit(bucket));
                return Some(hit);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            let removed = self
                .entries
                .remove_if(key, |_, entry| self.is_expired(entry, now))
                .is_some();
            if removed {
                self.report(|m, bucket| m.record_eviction(bucket, 1));
            }
        }
        self.report(|m, bucket| m.record_miss(bucket));
        None
    }

    pub fn set(&self, key: impl Into<String>, data: T) {
        self.set_at(key, data, None, Instant::now());
    }

    pub fn set_tagged(&self, key: impl Into<String>, data: T, tag: impl Into<String>) {
        self.set_at(key, data, Some(tag.into()), Instant::now());
    }

    pub fn set_at(&self, key: impl Into<String>, data: T, tag: Option<String>, now: Instant) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                data,
                timestamp: now,
                tag,
            },
        );
    }

    pub fn remove(&self, key: &str) -> Option<CacheEntry<T>> {
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop every expired entry, returning how many were removed
    pub fn clean(&self) -> usize {
        self.clean_at(Instant::now())
    }

    pub fn clean_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            if self.is_expired(entry, now) {
                removed += 1;
                false
            } else {
                true
            }
        });
        self.report(|m, bucket| m.record_eviction(bucket, removed));
        removed
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    fn is_expired(&self, entry: &CacheEntry<T>, now: Instant) -> bool {
        now.saturating_duration_since(entry.timestamp) > self.ttl
    }

    fn report(&self, f: impl FnOnce(&CacheMetrics, &str)) {
        if let Some((metrics, bucket)) = &self.metrics {
            f(metrics.as_ref(), bucket.as_str());
        }
    }
}

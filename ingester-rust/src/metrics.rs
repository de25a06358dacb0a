//! Pipeline counters. Every drop/accept path increments exactly one counter;
//! steady-state faults are observable here and in logs, never as process
//! exits.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct Metrics {
    // Ingest
    pub packets_received: AtomicU64,
    pub decrypt_failed: AtomicU64,
    pub decode_failed: AtomicU64,
    pub unsupported_packet: AtomicU64,
    // Policy drops
    pub deduped: AtomicU64,
    pub future_timestamp_rejected: AtomicU64,
    pub zero_integer_dropped: AtomicU64,
    // Correlation
    pub positions_cached: AtomicU64,
    pub nodeinfo_applied: AtomicU64,
    pub telemetry_buffered: AtomicU64,
    pub pending_drained: AtomicU64,
    pub pending_expired: AtomicU64,
    pub records_emitted: AtomicU64,
    // Geocoding
    pub geocode_cache_hits: AtomicU64,
    pub geocode_cache_misses: AtomicU64,
    pub geocode_resolved_offline: AtomicU64,
    pub geocode_resolved_online: AtomicU64,
    pub geocode_unresolved: AtomicU64,
    // Sink
    pub rows_written: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub batches_dropped: AtomicU64,
    pub republished: AtomicU64,
    pub republish_failed: AtomicU64,
    /// Messages received per region subscription
    pub per_region: HashMap<String, AtomicU64>,
}

impl Metrics {
    /// Counter slots are fixed at startup; regions never change afterwards.
    pub fn new(regions: &[String]) -> Arc<Self> {
        let per_region = regions
            .iter()
            .map(|r| (r.clone(), AtomicU64::new(0)))
            .collect();
        Arc::new(Self {
            per_region,
            ..Default::default()
        })
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn region_received(&self, region: &str) {
        if let Some(c) = self.per_region.get(region) {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            packets_received: load(&self.packets_received),
            decrypt_failed: load(&self.decrypt_failed),
            decode_failed: load(&self.decode_failed),
            unsupported_packet: load(&self.unsupported_packet),
            deduped: load(&self.deduped),
            future_timestamp_rejected: load(&self.future_timestamp_rejected),
            zero_integer_dropped: load(&self.zero_integer_dropped),
            positions_cached: load(&self.positions_cached),
            nodeinfo_applied: load(&self.nodeinfo_applied),
            telemetry_buffered: load(&self.telemetry_buffered),
            pending_drained: load(&self.pending_drained),
            pending_expired: load(&self.pending_expired),
            records_emitted: load(&self.records_emitted),
            geocode_cache_hits: load(&self.geocode_cache_hits),
            geocode_cache_misses: load(&self.geocode_cache_misses),
            geocode_resolved_offline: load(&self.geocode_resolved_offline),
            geocode_resolved_online: load(&self.geocode_resolved_online),
            geocode_unresolved: load(&self.geocode_unresolved),
            rows_written: load(&self.rows_written),
            batches_flushed: load(&self.batches_flushed),
            batches_dropped: load(&self.batches_dropped),
            republished: load(&self.republished),
            republish_failed: load(&self.republish_failed),
            per_region: self
                .per_region
                .iter()
                .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

/// Point-in-time view served on `/metrics` and logged in summaries.
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub packets_received: u64,
    pub decrypt_failed: u64,
    pub decode_failed: u64,
    pub unsupported_packet: u64,
    pub deduped: u64,
    pub future_timestamp_rejected: u64,
    pub zero_integer_dropped: u64,
    pub positions_cached: u64,
    pub nodeinfo_applied: u64,
    pub telemetry_buffered: u64,
    pub pending_drained: u64,
    pub pending_expired: u64,
    pub records_emitted: u64,
    pub geocode_cache_hits: u64,
    pub geocode_cache_misses: u64,
    pub geocode_resolved_offline: u64,
    pub geocode_resolved_online: u64,
    pub geocode_unresolved: u64,
    pub rows_written: u64,
    pub batches_flushed: u64,
    pub batches_dropped: u64,
    pub republished: u64,
    pub republish_failed: u64,
    pub per_region: std::collections::BTreeMap<String, u64>,
}

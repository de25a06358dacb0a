//! # pending
//!
//! Telemetry that arrives before any position beacon for its node. A node
//! often broadcasts readings for many minutes before its first position, so
//! drop-on-miss would lose the opening data of every newly joined sensor.
//! The buffer is bounded three ways: 50 readings per node (oldest dropped),
//! 10 000 nodes (oldest node evicted), and a 1-hour age limit regardless of
//! whether a position ever arrives.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

use crate::model::{NodeId, Reading, RegionTag};
use crate::persistence;

pub const PENDING_TTL_SECS: i64 = 3600;
pub const PER_NODE_CAP: usize = 50;
pub const NODE_CAP: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReading {
    pub reading: Reading,
    pub region: RegionTag,
    /// Unix seconds when the reading entered the buffer
    pub buffered_at: i64,
}

pub struct PendingBuffer {
    queues: HashMap<u32, VecDeque<PendingReading>>,
    /// Node ids in arrival order; approximate LRU for the global bound
    arrival: VecDeque<u32>,
    per_node_cap: usize,
    node_cap: usize,
    ttl_secs: i64,
    path: PathBuf,
    updates_since_snapshot: u32,
    last_snapshot: Instant,
}

impl PendingBuffer {
    pub fn new(path: PathBuf) -> Self {
        Self::with_bounds(path, PER_NODE_CAP, NODE_CAP, PENDING_TTL_SECS)
    }

    pub fn with_bounds(path: PathBuf, per_node_cap: usize, node_cap: usize, ttl_secs: i64) -> Self {
        Self {
            queues: HashMap::new(),
            arrival: VecDeque::new(),
            per_node_cap: per_node_cap.max(1),
            node_cap: node_cap.max(1),
            ttl_secs,
            path,
            updates_since_snapshot: 0,
            last_snapshot: Instant::now(),
        }
    }

    /// Restore from snapshot, re-applying the age limit and the
    /// future-timestamp guard: entries that expired or are future-dated
    /// relative to the new clock are discarded at load time.
    pub async fn load(path: PathBuf, now: i64, max_future_secs: i64) -> Self {
        let mut buffer = Self::new(path);
        if let Some(entries) = persistence::load_json::<Vec<PendingReading>>(&buffer.path).await {
            let total = entries.len();
            for entry in entries {
                if now - entry.buffered_at >= buffer.ttl_secs {
                    continue;
                }
                if entry.reading.sensor_time - now > max_future_secs {
                    continue;
                }
                buffer.push_entry(entry);
            }
            buffer.updates_since_snapshot = 0;
            info!(
                "pending buffer: restored {} of {} readings from {}",
                buffer.reading_count(),
                total,
                buffer.path.display()
            );
        }
        buffer
    }

    pub fn node_count(&self) -> usize {
        self.queues.len()
    }

    pub fn reading_count(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn push(&mut self, reading: Reading, region: RegionTag, now: i64) {
        self.push_entry(PendingReading {
            reading,
            region,
            buffered_at: now,
        });
    }

    fn push_entry(&mut self, entry: PendingReading) {
        let node = entry.reading.node_id.0;
        if !self.queues.contains_key(&node) {
            while self.queues.len() >= self.node_cap {
                match self.arrival.pop_front() {
                    Some(oldest) => {
                        self.queues.remove(&oldest);
                    }
                    None => break,
                }
            }
            self.arrival.push_back(node);
        }
        let queue = self.queues.entry(node).or_default();
        if queue.len() >= self.per_node_cap {
            queue.pop_front();
        }
        queue.push_back(entry);
        self.updates_since_snapshot += 1;
    }

    /// Remove and return everything buffered for a node, oldest first.
    /// Called when its position finally arrives.
    pub fn drain(&mut self, node_id: NodeId) -> Vec<PendingReading> {
        match self.queues.remove(&node_id.0) {
            Some(queue) => {
                self.updates_since_snapshot += 1;
                queue.into()
            }
            None => Vec::new(),
        }
    }

    /// Drop readings past the age limit; returns how many went.
    pub fn sweep(&mut self, now: i64) -> usize {
        let ttl = self.ttl_secs;
        let mut removed = 0;
        self.queues.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|e| now - e.buffered_at < ttl);
            removed += before - queue.len();
            !queue.is_empty()
        });
        if removed > 0 {
            self.updates_since_snapshot += 1;
        }
        removed
    }

    pub fn should_snapshot(&self) -> bool {
        self.updates_since_snapshot > 0
            && (self.updates_since_snapshot >= crate::position_cache::SNAPSHOT_UPDATES
                || self.last_snapshot.elapsed() >= crate::position_cache::SNAPSHOT_INTERVAL)
    }

    pub fn snapshot_json(&self) -> String {
        let entries: Vec<&PendingReading> = self.queues.values().flatten().collect();
        serde_json::to_string(&entries).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn mark_snapshotted(&mut self) {
        self.updates_since_snapshot = 0;
        self.last_snapshot = Instant::now();
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl PendingBuffer {
    // The arrival ring may hold ids whose queues were drained or swept;
    // eviction skips them because removing an absent key is a no-op.
    #[cfg(test)]
    fn contains(&self, node: u32) -> bool {
        self.queues.contains_key(&node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReadingType;

    fn reading(node: u32, sensor_time: i64) -> Reading {
        Reading {
            node_id: NodeId(node),
            reading_type: ReadingType::Humidity,
            value: 65.0,
            sensor_time,
        }
    }

    fn buffer() -> PendingBuffer {
        PendingBuffer::new(PathBuf::from("unused.json"))
    }

    #[test]
    fn push_then_drain_preserves_order() {
        let mut buf = buffer();
        buf.push(reading(0xdeadbeef, 1000), "EU_868".to_string(), 1000);
        buf.push(reading(0xdeadbeef, 1010), "EU_868".to_string(), 1010);
        let drained = buf.drain(NodeId(0xdeadbeef));
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].reading.sensor_time, 1000);
        assert_eq!(drained[1].reading.sensor_time, 1010);
        assert_eq!(buf.reading_count(), 0);
        // Draining again is empty, not an error
        assert!(buf.drain(NodeId(0xdeadbeef)).is_empty());
    }

    #[test]
    fn per_node_cap_drops_oldest() {
        let mut buf = PendingBuffer::with_bounds(PathBuf::from("u.json"), 50, 100, PENDING_TTL_SECS);
        for i in 0..51 {
            buf.push(reading(1, 1000 + i), "US".to_string(), 1000 + i);
        }
        let drained = buf.drain(NodeId(1));
        assert_eq!(drained.len(), 50);
        // Reading at t=1000 was evicted; t=1001 survives as the oldest
        assert_eq!(drained[0].reading.sensor_time, 1001);
        assert_eq!(drained[49].reading.sensor_time, 1050);
    }

    #[test]
    fn node_cap_evicts_oldest_node() {
        let mut buf = PendingBuffer::with_bounds(PathBuf::from("u.json"), 50, 3, PENDING_TTL_SECS);
        for node in 1..=3u32 {
            buf.push(reading(node, 1000), "US".to_string(), 1000);
        }
        buf.push(reading(4, 1001), "US".to_string(), 1001);
        assert_eq!(buf.node_count(), 3);
        assert!(!buf.contains(1));
        assert!(buf.contains(4));
    }

    #[test]
    fn sweep_applies_age_limit() {
        let mut buf = buffer();
        buf.push(reading(1, 1000), "US".to_string(), 1000);
        buf.push(reading(2, 4000), "US".to_string(), 4000);
        // At t=4600, the first entry is 3600s old → expired
        let removed = buf.sweep(1000 + PENDING_TTL_SECS);
        assert_eq!(removed, 1);
        assert!(!buf.contains(1));
        assert!(buf.contains(2));
    }

    #[tokio::test]
    async fn load_filters_expired_and_future_dated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending_telemetry.json");

        let mut buf = PendingBuffer::new(path.clone());
        buf.push(reading(1, 1000), "ANZ".to_string(), 1000); // will be expired
        buf.push(reading(2, 5000), "ANZ".to_string(), 5000); // fine
        buf.push(reading(3, 99_000), "ANZ".to_string(), 5000); // future-dated sensor clock
        persistence::write_atomic(&path, &buf.snapshot_json())
            .await
            .unwrap();

        let restored = PendingBuffer::load(path, 5200, 30).await;
        assert_eq!(restored.reading_count(), 1);
        assert!(restored.contains(2));
    }
}

//! # position_cache
//!
//! Per-node last-known position, the left side of the correlation join.
//!
//! Entries live 7 days: stationary sensors are the norm, so a week-old fix is
//! still a valid join partner. Expiry happens on access and on the periodic
//! sweep. Durability is snapshot-based — write-through would cost a disk
//! write per beacon — with a snapshot after every 100 updates or 300 seconds,
//! whichever comes first, plus one on graceful shutdown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::info;

use crate::model::{NodeId, NodePosition};
use crate::persistence;

pub const POSITION_TTL_SECS: i64 = 7 * 24 * 3600;
pub const SNAPSHOT_UPDATES: u32 = 100;
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(300);

pub struct PositionCache {
    entries: HashMap<u32, NodePosition>,
    ttl_secs: i64,
    path: PathBuf,
    updates_since_snapshot: u32,
    last_snapshot: Instant,
}

impl PositionCache {
    pub fn new(path: PathBuf, ttl_secs: i64) -> Self {
        Self {
            entries: HashMap::new(),
            ttl_secs,
            path,
            updates_since_snapshot: 0,
            last_snapshot: Instant::now(),
        }
    }

    /// Load the snapshot, dropping entries that expired while we were down.
    pub async fn load(path: PathBuf, ttl_secs: i64, now: i64) -> Self {
        let mut cache = Self::new(path, ttl_secs);
        if let Some(entries) = persistence::load_json::<Vec<NodePosition>>(&cache.path).await {
            let total = entries.len();
            for pos in entries {
                if now - pos.received_at < ttl_secs {
                    cache.entries.insert(pos.node_id.0, pos);
                }
            }
            info!(
                "position cache: restored {} of {} entries from {}",
                cache.entries.len(),
                total,
                cache.path.display()
            );
        }
        cache
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or overwrite; any newer POSITION wins. Name and board identity
    /// from an earlier NODEINFO are carried over so a bare position beacon
    /// does not erase them.
    pub fn put(&mut self, mut position: NodePosition) {
        if let Some(existing) = self.entries.get(&position.node_id.0) {
            if position.node_name.is_none() {
                position.node_name = existing.node_name.clone();
            }
            if position.hardware_model.is_none() {
                position.hardware_model = existing.hardware_model.clone();
            }
        }
        self.entries.insert(position.node_id.0, position);
        self.updates_since_snapshot += 1;
    }

    /// Fold NODEINFO identity fields into an existing entry. Never creates a
    /// position from nothing. Returns whether anything was updated.
    pub fn apply_node_info(
        &mut self,
        node_id: NodeId,
        node_name: Option<String>,
        hardware_model: Option<String>,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(&node_id.0) else {
            return false;
        };
        if let Some(name) = node_name.filter(|n| !n.is_empty()) {
            entry.node_name = Some(name);
        }
        if let Some(model) = hardware_model.filter(|m| !m.is_empty()) {
            entry.hardware_model = Some(model);
        }
        self.updates_since_snapshot += 1;
        true
    }

    /// Lookup with expiry-on-access: an entry at or past its TTL is removed
    /// and reported as a miss.
    pub fn get(&mut self, node_id: NodeId, now: i64) -> Option<&NodePosition> {
        let expired = match self.entries.get(&node_id.0) {
            Some(pos) => now - pos.received_at >= self.ttl_secs,
            None => return None,
        };
        if expired {
            self.entries.remove(&node_id.0);
            return None;
        }
        self.entries.get(&node_id.0)
    }

    /// Drop every expired entry; returns how many went.
    pub fn sweep(&mut self, now: i64) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl_secs;
        self.entries.retain(|_, pos| now - pos.received_at < ttl);
        before - self.entries.len()
    }

    pub fn should_snapshot(&self) -> bool {
        self.updates_since_snapshot > 0
            && (self.updates_since_snapshot >= SNAPSHOT_UPDATES
                || self.last_snapshot.elapsed() >= SNAPSHOT_INTERVAL)
    }

    /// Serialized snapshot content; pair with `mark_snapshotted` once the
    /// write has been handed off.
    pub fn snapshot_json(&self) -> String {
        let entries: Vec<&NodePosition> = self.entries.values().collect();
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

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(node: u32, received_at: i64) -> NodePosition {
        NodePosition {
            node_id: NodeId(node),
            latitude: -36.8485,
            longitude: 174.7633,
            altitude: None,
            hardware_model: None,
            node_name: None,
            received_at,
        }
    }

    #[test]
    fn put_get_overwrite() {
        let mut cache = PositionCache::new(PathBuf::from("unused.json"), POSITION_TTL_SECS);
        cache.put(pos(1, 1000));
        assert_eq!(cache.get(NodeId(1), 1500).unwrap().received_at, 1000);

        let mut newer = pos(1, 2000);
        newer.latitude = 51.5074;
        cache.put(newer);
        let got = cache.get(NodeId(1), 2500).unwrap();
        assert_eq!(got.received_at, 2000);
        assert_eq!(got.latitude, 51.5074);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn ttl_boundary_exact_seven_days() {
        let mut cache = PositionCache::new(PathBuf::from("unused.json"), POSITION_TTL_SECS);
        cache.put(pos(1, 0));
        // 6 days 23h 59m: live
        assert!(cache.get(NodeId(1), POSITION_TTL_SECS - 60).is_some());
        // exactly 7 days: expired (and removed on access)
        assert!(cache.get(NodeId(1), POSITION_TTL_SECS).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn sweep_removes_expired_only() {
        let mut cache = PositionCache::new(PathBuf::from("unused.json"), POSITION_TTL_SECS);
        cache.put(pos(1, 0));
        cache.put(pos(2, 500_000));
        let removed = cache.sweep(POSITION_TTL_SECS + 1);
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(NodeId(2), POSITION_TTL_SECS + 1).is_some());
    }

    #[test]
    fn nodeinfo_updates_existing_only() {
        let mut cache = PositionCache::new(PathBuf::from("unused.json"), POSITION_TTL_SECS);
        assert!(!cache.apply_node_info(
            NodeId(9),
            Some("Ghost".to_string()),
            Some("Heltec V3".to_string())
        ));
        assert_eq!(cache.len(), 0);

        cache.put(pos(1, 1000));
        assert!(cache.apply_node_info(
            NodeId(1),
            Some("Ponsonby Weather".to_string()),
            Some("LILYGO T-Beam".to_string())
        ));
        let got = cache.get(NodeId(1), 1001).unwrap();
        assert_eq!(got.node_name.as_deref(), Some("Ponsonby Weather"));
        assert_eq!(got.hardware_model.as_deref(), Some("LILYGO T-Beam"));
    }

    #[test]
    fn position_update_keeps_identity() {
        let mut cache = PositionCache::new(PathBuf::from("unused.json"), POSITION_TTL_SECS);
        cache.put(pos(1, 1000));
        cache.apply_node_info(NodeId(1), Some("Station".to_string()), None);
        cache.put(pos(1, 2000)); // fresh beacon without identity fields
        let got = cache.get(NodeId(1), 2001).unwrap();
        assert_eq!(got.node_name.as_deref(), Some("Station"));
        assert_eq!(got.received_at, 2000);
    }

    #[test]
    fn snapshot_cadence() {
        let mut cache = PositionCache::new(PathBuf::from("unused.json"), POSITION_TTL_SECS);
        assert!(!cache.should_snapshot());
        for i in 0..SNAPSHOT_UPDATES {
            cache.put(pos(i, 1000));
        }
        assert!(cache.should_snapshot());
        cache.mark_snapshotted();
        assert!(!cache.should_snapshot());
    }

    #[tokio::test]
    async fn snapshot_load_roundtrip_drops_expired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("position_cache.json");

        let mut cache = PositionCache::new(path.clone(), POSITION_TTL_SECS);
        cache.put(pos(1, 1000));
        cache.put(pos(2, 900_000));
        crate::persistence::write_atomic(&path, &cache.snapshot_json())
            .await
            .unwrap();

        // Restart at a time where node 1 is past TTL but node 2 is not
        let now = 1000 + POSITION_TTL_SECS;
        let mut restored = PositionCache::load(path, POSITION_TTL_SECS, now).await;
        assert_eq!(restored.len(), 1);
        let got = restored.get(NodeId(2), now).unwrap();
        assert_eq!(got.received_at, 900_000);
        assert!((got.latitude - -36.8485).abs() < 1e-9);
    }
}

//! # dedup
//!
//! Mesh floods deliver the same packet from several gateways within seconds.
//! This filter suppresses repeats of a `(source, packet_id)` fingerprint for
//! a short window. It is a bounded set, not a cryptographic uniqueness
//! guarantee — under overflow the oldest fingerprints are shed first and a
//! very late rebroadcast may slip through, which downstream dedup tolerates.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

pub const DEDUP_TTL: Duration = Duration::from_secs(60);
pub const DEDUP_CAPACITY: usize = 100_000;

pub struct DedupFilter {
    seen: HashMap<(u32, u32), Instant>,
    /// Insertion order; drives both TTL expiry and overflow eviction
    order: VecDeque<((u32, u32), Instant)>,
    ttl: Duration,
    capacity: usize,
}

impl DedupFilter {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEDUP_TTL, DEDUP_CAPACITY)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Returns true if this fingerprint has not been seen inside the window
    /// (and records it); false means drop the packet.
    pub fn accept(&mut self, fingerprint: (u32, u32), now: Instant) -> bool {
        self.expire(now);

        if let Some(&seen_at) = self.seen.get(&fingerprint) {
            if now.duration_since(seen_at) < self.ttl {
                return false;
            }
        }

        while self.seen.len() >= self.capacity {
            let Some((old_fp, old_at)) = self.order.pop_front() else {
                break;
            };
            // Only drop the map entry the queue slot still describes
            if self.seen.get(&old_fp) == Some(&old_at) {
                self.seen.remove(&old_fp);
            }
        }

        self.seen.insert(fingerprint, now);
        self.order.push_back((fingerprint, now));
        true
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(fp, at)) = self.order.front() {
            if now.duration_since(at) < self.ttl {
                break;
            }
            self.order.pop_front();
            if self.seen.get(&fp) == Some(&at) {
                self.seen.remove(&fp);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_within_window_is_dropped() {
        let mut filter = DedupFilter::with_defaults();
        let t0 = Instant::now();
        assert!(filter.accept((0xa1b2c3d4, 7), t0));
        assert!(!filter.accept((0xa1b2c3d4, 7), t0 + Duration::from_secs(2)));
        assert!(!filter.accept((0xa1b2c3d4, 7), t0 + Duration::from_secs(10)));
    }

    #[test]
    fn different_fingerprints_pass() {
        let mut filter = DedupFilter::with_defaults();
        let t0 = Instant::now();
        assert!(filter.accept((1, 7), t0));
        assert!(filter.accept((2, 7), t0)); // different source
        assert!(filter.accept((1, 8), t0)); // different packet id
    }

    #[test]
    fn fingerprint_readmitted_after_ttl() {
        let mut filter = DedupFilter::new(Duration::from_secs(60), 100);
        let t0 = Instant::now();
        assert!(filter.accept((1, 1), t0));
        assert!(!filter.accept((1, 1), t0 + Duration::from_secs(59)));
        assert!(filter.accept((1, 1), t0 + Duration::from_secs(61)));
        // Stale queue slot from the first accept must not evict the refresh
        assert!(!filter.accept((1, 1), t0 + Duration::from_secs(62)));
    }

    #[test]
    fn overflow_evicts_oldest_first() {
        let mut filter = DedupFilter::new(Duration::from_secs(60), 3);
        let t0 = Instant::now();
        for i in 0..3u32 {
            assert!(filter.accept((i, 0), t0 + Duration::from_millis(u64::from(i))));
        }
        assert_eq!(filter.len(), 3);
        // Fourth insert pushes out (0, 0)
        assert!(filter.accept((3, 0), t0 + Duration::from_millis(10)));
        assert_eq!(filter.len(), 3);
        assert!(filter.accept((0, 0), t0 + Duration::from_millis(11)));
    }

    #[test]
    fn expiry_trims_state() {
        let mut filter = DedupFilter::new(Duration::from_secs(60), 1000);
        let t0 = Instant::now();
        for i in 0..100u32 {
            filter.accept((i, 0), t0);
        }
        assert_eq!(filter.len(), 100);
        filter.accept((999, 0), t0 + Duration::from_secs(120));
        assert_eq!(filter.len(), 1);
    }
}

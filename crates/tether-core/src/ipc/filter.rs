//! Bounded duplicate filters.
//!
//! A [`BoundedFilter`] remembers keys with the timestamp they were seen at.
//! When full it keeps the most recent half and raises a low-water mark:
//! anything older than the newest evicted entry is rejected from then on,
//! so eviction never reopens a replay window.

use crate::error::{Result, TetherError};
use std::collections::HashMap;
use std::hash::Hash;
use tracing::debug;

pub struct BoundedFilter<K> {
    seen: HashMap<K, u64>,
    capacity: usize,
    low_water: u64,
}

impl<K: Eq + Hash + Clone> BoundedFilter<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashMap::new(),
            capacity: capacity.max(2),
            low_water: 0,
        }
    }

    /// Record `key` seen at `timestamp`. Returns false for duplicates and
    /// for timestamps below the low-water mark.
    pub fn insert(&mut self, key: K, timestamp: u64) -> bool {
        if timestamp < self.low_water {
            debug!(
                "Filter refused timestamp {} below low water {}",
                timestamp, self.low_water
            );
            return false;
        }
        if self.seen.contains_key(&key) {
            return false;
        }
        if self.seen.len() >= self.capacity {
            self.compact();
        }
        self.seen.insert(key, timestamp);
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.seen.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> bool {
        self.seen.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn low_water(&self) -> u64 {
        self.low_water
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.low_water = 0;
    }

    fn compact(&mut self) {
        let mut entries: Vec<(K, u64)> = self.seen.drain().collect();
        entries.sort_by_key(|(_, ts)| *ts);
        let evict = entries.len() - self.capacity / 2;
        if let Some((_, newest_evicted)) = entries.get(evict.saturating_sub(1)) {
            self.low_water = self.low_water.max(newest_evicted + 1);
        }
        self.seen = entries.into_iter().skip(evict).collect();
        debug!(
            "Filter compacted to {} entries (low water {})",
            self.seen.len(),
            self.low_water
        );
    }
}

/// Rejects cluster messages outside the time window or seen before.
///
/// Once the filter has compacted, a message older than the newest evicted
/// entry is refused as a replay even if it is inside the window and was
/// never seen. Under heavy traffic the low-water mark climbs quickly, so
/// messages that arrive a little late are lost. A larger `capacity` keeps
/// the mark further behind `now`. These refusals are logged at debug level.
pub struct ReplayFilter {
    filter: BoundedFilter<(u64, u64)>,
    window_ms: u64,
}

impl ReplayFilter {
    pub fn new(capacity: usize, window_ms: u64) -> Self {
        Self {
            filter: BoundedFilter::new(capacity),
            window_ms,
        }
    }

    /// Accept `(timestamp, id)` once if `timestamp` is within the window
    /// around `now`.
    pub fn check(&mut self, timestamp: u64, id: u64, now: u64) -> Result<()> {
        check_window(timestamp, now, self.window_ms)?;
        if !self.filter.insert((timestamp, id), timestamp) {
            return Err(TetherError::Replay { timestamp, id });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.filter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filter.is_empty()
    }

    pub fn clear(&mut self) {
        self.filter.clear();
    }
}

/// Reject timestamps more than `window_ms` away from `now` in either
/// direction.
pub(crate) fn check_window(timestamp: u64, now: u64, window_ms: u64) -> Result<()> {
    if timestamp.abs_diff(now) > window_ms {
        return Err(TetherError::StaleTimestamp { timestamp, now });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_rejected() {
        let mut filter = BoundedFilter::new(8);
        assert!(filter.insert("a", 1));
        assert!(!filter.insert("a", 2));
        assert!(filter.insert("b", 2));
        assert_eq!(filter.len(), 2);
    }

    #[test]
    fn test_compaction_bounds_size_and_blocks_evicted() {
        let mut filter = BoundedFilter::new(10);
        for ts in 0..100u64 {
            assert!(filter.insert(ts, ts));
            assert!(filter.len() <= 10);
        }
        // Evicted keys stay rejected through the low-water mark.
        assert!(filter.low_water() > 0);
        assert!(!filter.insert(3, 3));
        assert!(filter.insert(1000, 1000));
    }

    #[test]
    fn test_late_message_below_low_water_is_refused() {
        let mut replay = ReplayFilter::new(4, 30_000);
        let now = 1_000_000;
        for id in 0..5u64 {
            replay.check(now + id * 10, id, now).unwrap();
        }
        // Inside the window and never seen, but older than what compaction
        // evicted.
        assert!(matches!(
            replay.check(now - 1_000, 99, now),
            Err(TetherError::Replay { id: 99, .. })
        ));
        replay.check(now + 100, 100, now).unwrap();
    }

    #[test]
    fn test_replay_window_and_duplicates() {
        let mut replay = ReplayFilter::new(64, 30_000);
        let now = 1_000_000;
        replay.check(now - 1_000, 1, now).unwrap();
        assert!(matches!(
            replay.check(now - 1_000, 1, now),
            Err(TetherError::Replay { .. })
        ));
        assert!(matches!(
            replay.check(now - 40_000, 2, now),
            Err(TetherError::StaleTimestamp { .. })
        ));
        assert!(matches!(
            replay.check(now + 40_000, 3, now),
            Err(TetherError::StaleTimestamp { .. })
        ));
        replay.check(now + 29_000, 4, now).unwrap();
        assert_eq!(replay.len(), 2);
    }
}

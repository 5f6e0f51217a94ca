//! `store` is the bounded per-device sample history.
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::sample::Sample;

/// Default number of samples retained per device.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Per-device bounded FIFO of samples; the source of truth for aggregation.
///
/// One ring per device keeps eviction O(1): when a ring is full the oldest
/// sample is dropped. Reads hand out copies; callers never hold references
/// into the store.
pub struct HistoryStore {
    capacity: usize,
    rings: RwLock<HashMap<String, VecDeque<Sample>>>,
}

impl Default for HistoryStore {
    fn default() -> Self {
        HistoryStore::new(DEFAULT_CAPACITY)
    }
}

impl HistoryStore {
    pub fn new(capacity: usize) -> Self {
        HistoryStore {
            capacity: capacity.max(1),
            rings: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a sample to its device's ring, evicting the oldest entry on
    /// overflow. Appends must arrive in timestamp order per device; a sample
    /// older than the newest retained one is dropped to keep history
    /// monotonic.
    pub fn append(&self, sample: Sample) -> bool {
        let mut rings = self.rings.write().unwrap();
        let ring = rings.entry(sample.device_id.clone()).or_default();

        if let Some(last) = ring.back() {
            if sample.timestamp < last.timestamp {
                warn!(
                    device_id = %sample.device_id,
                    "dropping out-of-order sample"
                );
                return false;
            }
        }

        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(sample);
        true
    }

    /// Copies of a device's samples newer than `since` (all of them when
    /// `since` is `None`), oldest first.
    pub fn history(&self, device_id: &str, since: Option<DateTime<Utc>>) -> Vec<Sample> {
        let rings = self.rings.read().unwrap();
        let ring = match rings.get(device_id) {
            Some(r) => r,
            None => return Vec::new(),
        };
        match since {
            Some(cutoff) => ring
                .iter()
                .filter(|s| s.timestamp > cutoff)
                .cloned()
                .collect(),
            None => ring.iter().cloned().collect(),
        }
    }

    /// The newest sample for a device, if any.
    pub fn latest(&self, device_id: &str) -> Option<Sample> {
        let rings = self.rings.read().unwrap();
        rings.get(device_id).and_then(|r| r.back().cloned())
    }

    /// The newest sample for every device.
    pub fn latest_per_device(&self) -> HashMap<String, Sample> {
        let rings = self.rings.read().unwrap();
        rings
            .iter()
            .filter_map(|(id, ring)| ring.back().map(|s| (id.clone(), s.clone())))
            .collect()
    }

    /// Ids of every device with at least one retained sample, sorted.
    pub fn device_ids(&self) -> Vec<String> {
        let rings = self.rings.read().unwrap();
        let mut ids: Vec<String> = rings
            .iter()
            .filter(|(_, ring)| !ring.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of samples retained for a device.
    pub fn len(&self, device_id: &str) -> usize {
        let rings = self.rings.read().unwrap();
        rings.get(device_id).map(|r| r.len()).unwrap_or(0)
    }

    /// Drop a device's history entirely (node deregistration).
    pub fn remove_device(&self, device_id: &str) {
        let mut rings = self.rings.write().unwrap();
        rings.remove(device_id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Duration;

    fn sample_at(device: &str, offset_secs: i64, util: f64) -> Sample {
        let mut s = Sample::empty(device);
        s.utilization_pct = util;
        s.timestamp = Utc::now() + Duration::seconds(offset_secs);
        s
    }

    #[test]
    fn test_append_and_read_back() {
        let store = HistoryStore::new(10);
        for i in 0..5 {
            assert!(store.append(sample_at("gpu-0", i, i as f64)));
        }
        let history = store.history("gpu-0", None);
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].utilization_pct, 0.0);
        assert_eq!(history[4].utilization_pct, 4.0);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let store = HistoryStore::new(3);
        for i in 0..10 {
            store.append(sample_at("gpu-0", i, i as f64));
        }
        let history = store.history("gpu-0", None);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].utilization_pct, 7.0);
        assert_eq!(store.len("gpu-0"), 3);
    }

    #[test]
    fn test_since_filter_is_exclusive() {
        let store = HistoryStore::new(10);
        let samples: Vec<Sample> = (0..5).map(|i| sample_at("gpu-0", i * 10, i as f64)).collect();
        let cutoff = samples[2].timestamp;
        for s in samples {
            store.append(s);
        }
        let recent = store.history("gpu-0", Some(cutoff));
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|s| s.timestamp > cutoff));
    }

    #[test]
    fn test_out_of_order_sample_is_dropped() {
        let store = HistoryStore::new(10);
        store.append(sample_at("gpu-0", 100, 1.0));
        assert!(!store.append(sample_at("gpu-0", 50, 2.0)));
        assert_eq!(store.len("gpu-0"), 1);
    }

    #[test]
    fn test_equal_timestamps_are_accepted() {
        let store = HistoryStore::new(10);
        let s = sample_at("gpu-0", 0, 1.0);
        let mut dup = s.clone();
        dup.utilization_pct = 2.0;
        store.append(s);
        assert!(store.append(dup));
        assert_eq!(store.len("gpu-0"), 2);
    }

    #[test]
    fn test_timestamps_monotonic_after_churn() {
        let store = HistoryStore::new(5);
        for i in 0..50 {
            store.append(sample_at("gpu-0", i, 0.0));
        }
        let history = store.history("gpu-0", None);
        for pair in history.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn test_devices_are_independent() {
        let store = HistoryStore::new(2);
        store.append(sample_at("a", 0, 1.0));
        store.append(sample_at("b", 0, 2.0));
        assert_eq!(store.len("a"), 1);
        assert_eq!(store.len("b"), 1);
        assert_eq!(store.device_ids(), vec!["a".to_string(), "b".to_string()]);
        store.remove_device("a");
        assert_eq!(store.len("a"), 0);
        assert!(store.latest("b").is_some());
    }
}

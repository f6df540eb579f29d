use crate::pipeline::{TagSnapshot, TagValues};
use crate::tags::{DeviceNo, TagId};
use crate::value::DecodedValue;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Latest published snapshot per device.
///
/// Snapshots are immutable once published; readers clone the `Arc` and never
/// see a partially updated map. A write patch publishes a copy of the current
/// snapshot with one entry replaced, and the next poll supersedes it.
#[derive(Default)]
pub struct SnapshotCache {
    devices: RwLock<HashMap<DeviceNo, Arc<TagSnapshot>>>,
    latest: RwLock<Option<Arc<TagSnapshot>>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the poll path once per cycle (replaces the whole snapshot).
    pub fn publish(&self, snapshot: TagSnapshot) -> Arc<TagSnapshot> {
        let snapshot = Arc::new(snapshot);
        let mut devices = self.devices.write();
        devices.insert(snapshot.device_no, Arc::clone(&snapshot));
        // Lock order: devices, then latest.
        *self.latest.write() = Some(Arc::clone(&snapshot));
        snapshot
    }

    pub fn device(&self, device_no: DeviceNo) -> Option<Arc<TagSnapshot>> {
        self.devices.read().get(&device_no).cloned()
    }

    /// Most recently published snapshot of any device.
    pub fn latest(&self) -> Option<Arc<TagSnapshot>> {
        self.latest.read().clone()
    }

    /// Snapshot of `device_no`, or the most recent one if that device has none yet.
    pub fn device_or_latest(&self, device_no: DeviceNo) -> Option<Arc<TagSnapshot>> {
        self.device(device_no).or_else(|| self.latest())
    }

    /// Replace one cached entry after a client write.
    pub fn update_entry(&self, device_no: DeviceNo, tag_id: TagId, value: DecodedValue) {
        let mut devices = self.devices.write();
        let mut next = match devices.get(&device_no) {
            Some(current) => TagSnapshot::clone(current),
            None => TagSnapshot {
                device_no,
                sequence: 0,
                values: TagValues::new(),
            },
        };
        next.values.insert(tag_id, value);
        let next = Arc::new(next);
        devices.insert(device_no, Arc::clone(&next));

        let mut latest = self.latest.write();
        let replace = match latest.as_ref() {
            Some(current) => current.device_no == device_no,
            None => true,
        };
        if replace {
            *latest = Some(next);
        }
    }

    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(device_no: DeviceNo, sequence: u64, entries: &[(TagId, i16)]) -> TagSnapshot {
        TagSnapshot {
            device_no,
            sequence,
            values: entries
                .iter()
                .map(|(id, v)| (*id, DecodedValue::Int16(*v)))
                .collect(),
        }
    }

    #[test]
    fn publish_replaces_whole_snapshot() {
        let cache = SnapshotCache::new();
        cache.publish(snapshot(1, 1, &[(10, 1), (11, 2)]));
        cache.publish(snapshot(1, 2, &[(10, 3)]));
        let s = cache.device(1).unwrap();
        assert_eq!(s.sequence, 2);
        assert!(!s.values.contains_key(&11));
    }

    #[test]
    fn falls_back_to_latest_device() {
        let cache = SnapshotCache::new();
        assert!(cache.device_or_latest(1).is_none());
        cache.publish(snapshot(2, 1, &[(20, 7)]));
        assert_eq!(cache.device_or_latest(1).unwrap().device_no, 2);
        cache.publish(snapshot(1, 1, &[(10, 1)]));
        assert_eq!(cache.device_or_latest(1).unwrap().device_no, 1);
    }

    #[test]
    fn write_patch_is_visible_until_next_poll() {
        let cache = SnapshotCache::new();
        cache.publish(snapshot(1, 1, &[(10, 1), (11, 2)]));
        let before = cache.device(1).unwrap();

        cache.update_entry(1, 10, DecodedValue::Bool(true));
        let patched = cache.device(1).unwrap();
        assert_eq!(patched.values.get(&10), Some(&DecodedValue::Bool(true)));
        assert_eq!(patched.values.get(&11), Some(&DecodedValue::Int16(2)));
        // Readers holding the old snapshot are unaffected.
        assert_eq!(before.values.get(&10), Some(&DecodedValue::Int16(1)));
        assert_eq!(cache.latest().unwrap().values.get(&10), Some(&DecodedValue::Bool(true)));

        cache.publish(snapshot(1, 2, &[(10, 5)]));
        assert_eq!(
            cache.device(1).unwrap().values.get(&10),
            Some(&DecodedValue::Int16(5))
        );
    }

    #[test]
    fn write_patch_without_cache_creates_entry() {
        let cache = SnapshotCache::new();
        cache.update_entry(3, 30, DecodedValue::Int16(4));
        assert_eq!(cache.device_count(), 1);
        assert_eq!(cache.latest().unwrap().device_no, 3);
    }
}

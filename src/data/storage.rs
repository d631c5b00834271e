//! Per-slot datum partitions owned by one data node.
//!
//! Partitions appear and disappear with slot assignment; every mutation
//! that changes visible state bumps the datum's version through the
//! monotone generator and reports the new version so callers can notify.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use tracing::info;

use crate::core::{DataInfoId, Datum, DatumEntry, RegisterId, next_version, now_ms};
use crate::data::{SlotChangeListener, SlotRole};

pub struct LocalDatumStorage {
    data_center: String,
    slots: RwLock<HashMap<u32, HashMap<DataInfoId, Datum>>>,
}

impl LocalDatumStorage {
    pub fn new(data_center: &str) -> Self {
        Self {
            data_center: data_center.to_string(),
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn data_center(&self) -> &str {
        &self.data_center
    }

    /// Write one publisher entry. Returns the datum's new version when the
    /// entry changed visible state.
    pub fn put_publisher(
        &self,
        slot_id: u32,
        data_info_id: &DataInfoId,
        entry: DatumEntry,
    ) -> Option<u64> {
        let mut slots = self.slots.write().expect("datum slots");
        let partition = slots.get_mut(&slot_id)?;
        let datum = partition
            .entry(data_info_id.clone())
            .or_insert_with(|| Datum::new(self.data_center.clone(), data_info_id.clone()));
        if datum.merge_entry(entry) {
            datum.version = next_version(datum.version, now_ms());
            Some(datum.version)
        } else {
            None
        }
    }

    /// Remove one publisher entry unless a newer one replaced it. An emptied
    /// datum is deleted; the returned version is still fresh so the removal
    /// can be announced.
    pub fn remove_publisher(
        &self,
        slot_id: u32,
        data_info_id: &DataInfoId,
        register_id: &RegisterId,
        version: u64,
    ) -> Option<u64> {
        let mut slots = self.slots.write().expect("datum slots");
        let partition = slots.get_mut(&slot_id)?;
        let datum = partition.get_mut(data_info_id)?;
        if !datum.remove_entry(register_id, version) {
            return None;
        }
        datum.version = next_version(datum.version, now_ms());
        let new_version = datum.version;
        if datum.is_empty() {
            partition.remove(data_info_id);
        }
        Some(new_version)
    }

    /// Merge a datum assembled from a session's publishers (migration or
    /// steady leader<-session sync). Idempotent; per-entry versions decide.
    pub fn merge_datum(&self, slot_id: u32, incoming: Datum) -> Option<u64> {
        let mut slots = self.slots.write().expect("datum slots");
        let partition = slots.get_mut(&slot_id)?;
        let datum = partition
            .entry(incoming.data_info_id.clone())
            .or_insert_with(|| {
                Datum::new(self.data_center.clone(), incoming.data_info_id.clone())
            });
        let mut changed = false;
        for entry in incoming.publishers.into_values() {
            changed |= datum.merge_entry(entry);
        }
        if changed {
            datum.version = next_version(datum.version, now_ms());
            Some(datum.version)
        } else {
            None
        }
    }

    /// Adopt a datum from the slot leader verbatim if it is newer
    /// (follower->leader tailing keeps the leader's version numbering).
    pub fn replace_datum_if_newer(&self, slot_id: u32, incoming: Datum) -> bool {
        let mut slots = self.slots.write().expect("datum slots");
        let Some(partition) = slots.get_mut(&slot_id) else {
            return false;
        };
        match partition.get(&incoming.data_info_id) {
            Some(existing) if existing.version >= incoming.version => false,
            _ => {
                partition.insert(incoming.data_info_id.clone(), incoming);
                true
            }
        }
    }

    /// Drop a datum. The returned version is past every version the datum
    /// ever had, for announcing the removal.
    pub fn remove_datum(&self, slot_id: u32, data_info_id: &DataInfoId) -> Option<u64> {
        let mut slots = self.slots.write().expect("datum slots");
        let partition = slots.get_mut(&slot_id)?;
        let datum = partition.remove(data_info_id)?;
        Some(next_version(datum.version, now_ms()))
    }

    pub fn get(&self, slot_id: u32, data_info_id: &DataInfoId) -> Option<Datum> {
        let slots = self.slots.read().expect("datum slots");
        slots.get(&slot_id)?.get(data_info_id).cloned()
    }

    /// Datum versions of one slot, the `known_versions` side of a diff sync.
    pub fn versions(&self, slot_id: u32) -> BTreeMap<DataInfoId, u64> {
        let slots = self.slots.read().expect("datum slots");
        slots
            .get(&slot_id)
            .map(|partition| {
                partition
                    .iter()
                    .map(|(id, datum)| (id.clone(), datum.version))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Bump every datum version in a slot. Run once when migration
    /// finishes so this leader's versions sort after the old leader's.
    pub fn update_version(&self, slot_id: u32) -> usize {
        let mut slots = self.slots.write().expect("datum slots");
        let Some(partition) = slots.get_mut(&slot_id) else {
            return 0;
        };
        let now = now_ms();
        for datum in partition.values_mut() {
            datum.version = next_version(datum.version, now);
        }
        partition.len()
    }

    pub fn datum_count(&self, slot_id: u32) -> usize {
        let slots = self.slots.read().expect("datum slots");
        slots.get(&slot_id).map_or(0, HashMap::len)
    }

    pub fn has_slot(&self, slot_id: u32) -> bool {
        self.slots.read().expect("datum slots").contains_key(&slot_id)
    }
}

impl SlotChangeListener for LocalDatumStorage {
    fn on_slot_add(&self, slot_id: u32, _role: SlotRole) {
        let mut slots = self.slots.write().expect("datum slots");
        slots.entry(slot_id).or_insert_with(|| {
            info!(slot_id, "allocate slot partition");
            HashMap::new()
        });
    }

    fn on_slot_remove(&self, slot_id: u32, _role: SlotRole) {
        let mut slots = self.slots.write().expect("datum slots");
        if let Some(partition) = slots.remove(&slot_id) {
            info!(slot_id, datums = partition.len(), "drop slot partition");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataEntry;

    fn data_info_id(name: &str) -> DataInfoId {
        DataInfoId::new(name, "instance2", "rpc").unwrap()
    }

    fn entry(register_id: &str, version: u64) -> DatumEntry {
        DatumEntry {
            register_id: RegisterId::new(register_id).unwrap(),
            version,
            register_timestamp: version,
            source_address: "10.0.0.1:7000".parse().unwrap(),
            data_list: vec![DataEntry::new(&b"payload"[..])],
        }
    }

    #[test]
    fn writes_require_an_assigned_slot() {
        let storage = LocalDatumStorage::new("dc1");
        assert!(storage.put_publisher(3, &data_info_id("d"), entry("p", 1)).is_none());
        storage.on_slot_add(3, SlotRole::Leader);
        assert!(storage.put_publisher(3, &data_info_id("d"), entry("p", 1)).is_some());
        storage.on_slot_remove(3, SlotRole::Leader);
        assert!(storage.get(3, &data_info_id("d")).is_none());
    }

    #[test]
    fn datum_version_is_strictly_monotone_across_writes() {
        let storage = LocalDatumStorage::new("dc1");
        storage.on_slot_add(1, SlotRole::Leader);
        let id = data_info_id("d");
        let v1 = storage.put_publisher(1, &id, entry("p", 1)).unwrap();
        let v2 = storage.put_publisher(1, &id, entry("p", 2)).unwrap();
        assert!(v2 > v1);
        // Re-putting the same entry is a no-op.
        assert!(storage.put_publisher(1, &id, entry("p", 2)).is_none());
    }

    #[test]
    fn emptied_datum_is_deleted_with_fresh_version() {
        let storage = LocalDatumStorage::new("dc1");
        storage.on_slot_add(1, SlotRole::Leader);
        let id = data_info_id("d");
        let put = storage.put_publisher(1, &id, entry("p", 1)).unwrap();
        let removed = storage
            .remove_publisher(1, &id, &RegisterId::new("p").unwrap(), 1)
            .unwrap();
        assert!(removed > put);
        assert!(storage.get(1, &id).is_none());
        assert_eq!(storage.datum_count(1), 0);
    }

    #[test]
    fn update_version_bumps_every_datum() {
        let storage = LocalDatumStorage::new("dc1");
        storage.on_slot_add(1, SlotRole::Leader);
        storage.put_publisher(1, &data_info_id("a"), entry("p", 1));
        storage.put_publisher(1, &data_info_id("b"), entry("p", 1));
        let before = storage.versions(1);
        assert_eq!(storage.update_version(1), 2);
        let after = storage.versions(1);
        for (id, version) in after {
            assert!(version > before[&id]);
        }
    }

    #[test]
    fn replace_if_newer_keeps_newer_local() {
        let storage = LocalDatumStorage::new("dc1");
        storage.on_slot_add(1, SlotRole::Follower);
        let id = data_info_id("d");
        let mut incoming = Datum::new("dc1", id.clone());
        incoming.merge_entry(entry("p", 1));
        incoming.version = 100;
        assert!(storage.replace_datum_if_newer(1, incoming.clone()));
        // Same version again: no change.
        assert!(!storage.replace_datum_if_newer(1, incoming.clone()));
        incoming.version = 101;
        assert!(storage.replace_datum_if_newer(1, incoming));
        assert_eq!(storage.get(1, &id).unwrap().version, 101);
    }
}

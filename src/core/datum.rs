//! Datum: the aggregated publication state for `(dataCenter, dataInfoId)`.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::identity::{DataInfoId, RegisterId};
use super::registration::{DataEntry, Publisher};

/// One publisher's contribution to a datum.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatumEntry {
    pub register_id: RegisterId,
    pub version: u64,
    pub register_timestamp: u64,
    pub source_address: SocketAddr,
    pub data_list: Vec<DataEntry>,
}

impl DatumEntry {
    pub fn from_publisher(publisher: &Publisher) -> Self {
        Self {
            register_id: publisher.registration.register_id.clone(),
            version: publisher.registration.version,
            register_timestamp: publisher.registration.register_timestamp,
            source_address: publisher.registration.source_address,
            data_list: publisher.data_list.clone(),
        }
    }
}

/// Aggregated publications for one dataInfoId in one data center.
///
/// `version` is strictly monotone per `(dataCenter, dataInfoId)`; entry
/// merges are idempotent so migration and steady-state sync may overlap.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datum {
    pub data_center: String,
    pub data_info_id: DataInfoId,
    pub publishers: BTreeMap<RegisterId, DatumEntry>,
    pub version: u64,
}

impl Datum {
    pub fn new(data_center: impl Into<String>, data_info_id: DataInfoId) -> Self {
        Self {
            data_center: data_center.into(),
            data_info_id,
            publishers: BTreeMap::new(),
            version: 0,
        }
    }

    /// Merge a publisher entry; an entry with an older version than the one
    /// already present is ignored. Returns whether the datum changed.
    pub fn merge_entry(&mut self, entry: DatumEntry) -> bool {
        match self.publishers.get(&entry.register_id) {
            Some(existing) if entry.version < existing.version => false,
            Some(existing) if *existing == entry => false,
            _ => {
                self.publishers.insert(entry.register_id.clone(), entry);
                true
            }
        }
    }

    /// Remove a publisher entry unless the stored one is newer than
    /// `version`. Returns whether the datum changed.
    pub fn remove_entry(&mut self, register_id: &RegisterId, version: u64) -> bool {
        match self.publishers.get(register_id) {
            Some(existing) if existing.version <= version => {
                self.publishers.remove(register_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }
}

/// Next strictly-monotone datum version.
///
/// Wall-clock based so a new leader's versions sort after an old leader's,
/// with a `prev + 1` floor against clock skew.
pub fn next_version(prev: u64, now_ms: u64) -> u64 {
    (prev + 1).max(now_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(register_id: &str, version: u64) -> DatumEntry {
        DatumEntry {
            register_id: RegisterId::new(register_id).unwrap(),
            version,
            register_timestamp: version,
            source_address: "10.0.0.1:7000".parse().unwrap(),
            data_list: vec![DataEntry::new(&b"payload"[..])],
        }
    }

    fn datum() -> Datum {
        Datum::new("dc1", DataInfoId::new("d", "i", "g").unwrap())
    }

    #[test]
    fn merge_is_idempotent_and_version_ordered() {
        let mut datum = datum();
        assert!(datum.merge_entry(entry("p1", 2)));
        assert!(!datum.merge_entry(entry("p1", 2)));
        assert!(!datum.merge_entry(entry("p1", 1)));
        assert!(datum.merge_entry(entry("p1", 3)));
        assert_eq!(datum.publishers.len(), 1);
    }

    #[test]
    fn remove_respects_newer_entry() {
        let mut datum = datum();
        datum.merge_entry(entry("p1", 5));
        assert!(!datum.remove_entry(&RegisterId::new("p1").unwrap(), 4));
        assert!(datum.remove_entry(&RegisterId::new("p1").unwrap(), 5));
        assert!(datum.is_empty());
    }

    #[test]
    fn next_version_is_strictly_monotone() {
        assert_eq!(next_version(0, 1000), 1000);
        assert_eq!(next_version(1000, 1000), 1001);
        assert_eq!(next_version(5000, 1000), 5001);
    }
}

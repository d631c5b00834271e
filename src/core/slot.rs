//! Slot model: fixed-count hash partitions assigned by the meta tier.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::identity::DataInfoId;

pub const DEFAULT_SLOT_COUNT: u32 = 256;

/// Deterministic dataInfoId -> slot mapping.
///
/// Sessions and data nodes must agree on this function; it is part of the
/// wire contract, not a tunable.
pub fn slot_of(data_info_id: &DataInfoId, slot_count: u32) -> u32 {
    let digest = Sha256::digest(data_info_id.to_string().as_bytes());
    let hash = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    hash % slot_count.max(1)
}

/// One slot assignment: a leader data node plus follower replicas.
///
/// `leader_epoch` tags the leader generation independently of the table
/// epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: u32,
    pub leader: String,
    pub followers: BTreeSet<String>,
    pub leader_epoch: u64,
}

impl Slot {
    pub fn new(
        id: u32,
        leader: impl Into<String>,
        followers: impl IntoIterator<Item = String>,
        leader_epoch: u64,
    ) -> Self {
        Self {
            id,
            leader: leader.into(),
            followers: followers.into_iter().collect(),
            leader_epoch,
        }
    }

    pub fn is_leader(&self, node: &str) -> bool {
        self.leader == node
    }

    pub fn is_follower(&self, node: &str) -> bool {
        self.followers.contains(node)
    }
}

/// The full slot assignment at one epoch, as disseminated by meta.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotTable {
    pub epoch: u64,
    pub slots: BTreeMap<u32, Slot>,
}

impl SlotTable {
    /// The pre-assignment table every node starts from.
    pub fn empty() -> Self {
        Self {
            epoch: 0,
            slots: BTreeMap::new(),
        }
    }

    pub fn new(epoch: u64, slots: impl IntoIterator<Item = Slot>) -> Self {
        Self {
            epoch,
            slots: slots.into_iter().map(|s| (s.id, s)).collect(),
        }
    }

    pub fn get(&self, slot_id: u32) -> Option<&Slot> {
        self.slots.get(&slot_id)
    }

    /// Restrict to the slots where `node` is leader or follower. Applied
    /// after the epoch check, never before.
    pub fn filter(&self, node: &str) -> SlotTable {
        SlotTable {
            epoch: self.epoch,
            slots: self
                .slots
                .iter()
                .filter(|(_, s)| s.is_leader(node) || s.is_follower(node))
                .map(|(id, s)| (*id, s.clone()))
                .collect(),
        }
    }

    pub fn leader_count(&self, node: &str) -> usize {
        self.slots.values().filter(|s| s.is_leader(node)).count()
    }

    pub fn follower_count(&self, node: &str) -> usize {
        self.slots.values().filter(|s| s.is_follower(node)).count()
    }

    /// True when no slot's leader epoch regresses going from `self` to
    /// `next`. A violation indicates a meta-tier bug.
    pub fn leader_epochs_not_regressed(&self, next: &SlotTable) -> bool {
        self.slots.values().all(|cur| {
            next.get(cur.id)
                .is_none_or(|n| n.leader_epoch >= cur.leader_epoch)
        })
    }
}

/// Verdict of the epoch guard run on every incoming data RPC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotAccessStatus {
    Accept,
    Moved,
    Migrating,
    MisMatch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotAccess {
    pub slot_id: u32,
    pub slot_table_epoch: u64,
    pub status: SlotAccessStatus,
    pub leader_epoch: Option<u64>,
}

impl SlotAccess {
    pub fn new(
        slot_id: u32,
        slot_table_epoch: u64,
        status: SlotAccessStatus,
        leader_epoch: Option<u64>,
    ) -> Self {
        Self {
            slot_id,
            slot_table_epoch,
            status,
            leader_epoch,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == SlotAccessStatus::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_of_is_stable_and_in_range() {
        let id = DataInfoId::new("com.example.Echo", "instance2", "rpc").unwrap();
        let slot = slot_of(&id, DEFAULT_SLOT_COUNT);
        assert_eq!(slot, slot_of(&id, DEFAULT_SLOT_COUNT));
        assert!(slot < DEFAULT_SLOT_COUNT);

        let other = DataInfoId::new("com.example.Other", "instance2", "rpc").unwrap();
        // Not a guarantee in general, just a sanity check on the hash input.
        assert!(slot_of(&other, 1 << 20) != slot_of(&id, 1 << 20));
    }

    #[test]
    fn filter_keeps_only_local_slots() {
        let table = SlotTable::new(
            5,
            [
                Slot::new(1, "n1", ["n2".to_string()], 1),
                Slot::new(2, "n2", ["n3".to_string()], 1),
                Slot::new(3, "n3", ["n1".to_string()], 1),
            ],
        );
        let local = table.filter("n1");
        assert_eq!(local.epoch, 5);
        assert_eq!(
            local.slots.keys().copied().collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(local.leader_count("n1"), 1);
        assert_eq!(local.follower_count("n1"), 1);
    }

    #[test]
    fn leader_epoch_regression_is_detected() {
        let cur = SlotTable::new(5, [Slot::new(1, "n1", [], 4)]);
        let ok = SlotTable::new(6, [Slot::new(1, "n2", [], 5)]);
        let bad = SlotTable::new(6, [Slot::new(1, "n2", [], 3)]);
        assert!(cur.leader_epochs_not_regressed(&ok));
        assert!(!cur.leader_epochs_not_regressed(&bad));
    }
}

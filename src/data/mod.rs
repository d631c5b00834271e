//! Data tier: the authoritative, slot-partitioned datum store and the slot
//! manager that keeps it in sync.

mod lease;
mod recorder;
mod slot_manager;
mod storage;
mod sync;

pub use lease::SessionLeaseManager;
pub use recorder::{DiskSlotTableRecorder, SlotTableRecorder};
pub use slot_manager::{SlotManager, SlotManagerContext, SlotStatus, SlotWatchdog};
pub use storage::LocalDatumStorage;
pub use sync::{SlotDiffSyncer, SyncError};

use serde::{Deserialize, Serialize};

/// This node's role for one slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotRole {
    Leader,
    Follower,
}

/// Storage hooks fired when a slot is assigned to or leaves this node.
pub trait SlotChangeListener: Send + Sync {
    fn on_slot_add(&self, slot_id: u32, role: SlotRole);
    fn on_slot_remove(&self, slot_id: u32, role: SlotRole);
}

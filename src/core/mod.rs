//! Core data model shared by the session and data tiers.

mod datum;
mod identity;
mod registration;
mod slot;

pub use datum::{Datum, DatumEntry, next_version};
pub use identity::{ConnectId, DataInfoId, InvalidId, RegisterId};
pub use registration::{
    DataEntry, Publisher, Registration, Scope, StoreRecord, Subscriber, Watcher,
};
pub use slot::{
    DEFAULT_SLOT_COUNT, Slot, SlotAccess, SlotAccessStatus, SlotTable, slot_of,
};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall time in milliseconds since Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod data;
pub mod error;
pub mod remoting;
pub mod session;
pub mod task;
pub mod telemetry;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{
    ConnectId, DataEntry, DataInfoId, Datum, DatumEntry, Publisher, RegisterId, Registration,
    Scope, Slot, SlotAccess, SlotAccessStatus, SlotTable, StoreRecord, Subscriber, Watcher,
    slot_of,
};

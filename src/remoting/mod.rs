//! Transport seams and wire shapes.
//!
//! The actual RPC layer lives outside this crate; components talk through
//! these narrow traits so tests and shims can stand in for the network.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::{DataInfoId, Datum, Publisher, RegisterId};
use crate::data::SyncError;
use crate::session::PushError;

/// Epoch pair carried on every data-tier RPC for the slot access check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochPair {
    pub slot_table_epoch: u64,
    pub leader_epoch: u64,
}

/// One page of a diff pull: "send me what I don't have for this slot".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiffSyncRequest {
    pub slot_id: u32,
    /// Header for the receiver's slot access check.
    pub epochs: EpochPair,
    /// Datum versions the caller already holds.
    pub known_versions: BTreeMap<DataInfoId, u64>,
    /// Resume cursor; pages are ordered by dataInfoId.
    pub start_after: Option<DataInfoId>,
    pub page_size: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiffSyncResponse {
    pub datums: Vec<Datum>,
    pub removed: Vec<DataInfoId>,
    pub has_more: bool,
    pub next: Option<DataInfoId>,
}

/// A peer that serves slot diff pages (a session node for leader refills, a
/// data leader for follower tailing).
pub trait SyncRemote: Send + Sync {
    fn sync_slot(&self, peer: &str, request: DiffSyncRequest)
    -> Result<DiffSyncResponse, SyncError>;
}

/// The wire object delivered to a subscribing client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PushPayload {
    pub data_info_id: DataInfoId,
    pub version: u64,
    /// Register ids of the subscribers this push targets.
    pub subscribers: Vec<RegisterId>,
    /// Merged payload entries, keyed by publisher register id.
    pub entries: BTreeMap<RegisterId, Vec<Bytes>>,
}

pub type PushCompletion = Box<dyn FnOnce(Result<(), PushError>) + Send>;

/// Asynchronous push transport to clients; completion arrives via callback.
pub trait PushClient: Send + Sync {
    fn push(&self, addr: SocketAddr, payload: PushPayload, done: PushCompletion);
}

/// Session-side reads of datum state from the data tier.
pub trait DatumReader: Send + Sync {
    fn fetch(
        &self,
        data_center: &str,
        data_info_id: &DataInfoId,
    ) -> Result<Option<Datum>, SyncError>;
}

/// Session-side writes of publisher state to the slot leader. The transport
/// attaches the epoch pair from its own slot table view.
pub trait PublisherWriter: Send + Sync {
    fn publish(&self, publisher: &Publisher) -> Result<(), SyncError>;

    fn unpublish(
        &self,
        data_info_id: &DataInfoId,
        register_id: &RegisterId,
        version: u64,
    ) -> Result<(), SyncError>;
}

/// Live session nodes as known to the meta tier.
pub trait SessionNodeProvider: Send + Sync {
    fn session_nodes(&self) -> Vec<String>;
}

/// Downstream notification that a datum version advanced.
pub trait DataChangeNotifier: Send + Sync {
    fn on_change(&self, data_center: &str, data_info_id: &DataInfoId, version: u64);
}

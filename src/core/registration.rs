//! Client registrations: publishers, subscribers, watchers.
//!
//! All three kinds share a `Registration` base and are kept behind `Arc` so
//! the session stores and in-flight push tasks observe the same object, in
//! particular the subscriber's per-dataCenter push bookkeeping.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::identity::{ConnectId, DataInfoId, RegisterId};

/// One payload entry published by a client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEntry {
    pub data: Bytes,
}

impl DataEntry {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

/// Common registration record.
///
/// Identity within a dataInfoId is `(connect_id, register_id)`; `version`
/// and `register_timestamp` order replacements across reconnections.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Registration {
    pub data_info_id: DataInfoId,
    pub register_id: RegisterId,
    pub version: u64,
    pub register_timestamp: u64,
    pub source_address: SocketAddr,
    pub target_address: SocketAddr,
    pub app_name: Option<String>,
    pub client_id: Option<String>,
}

impl Registration {
    pub fn connect_id(&self) -> ConnectId {
        ConnectId::new(self.source_address, self.target_address)
    }
}

/// Accessor seam the registration stores are generic over.
pub trait StoreRecord: Send + Sync + 'static {
    fn registration(&self) -> &Registration;

    fn data_info_id(&self) -> &DataInfoId {
        &self.registration().data_info_id
    }

    fn register_id(&self) -> &RegisterId {
        &self.registration().register_id
    }

    fn connect_id(&self) -> ConnectId {
        self.registration().connect_id()
    }
}

/// Publisher: a registration carrying payload entries, emitted to the data
/// tier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Publisher {
    pub registration: Registration,
    pub data_list: Vec<DataEntry>,
}

impl StoreRecord for Publisher {
    fn registration(&self) -> &Registration {
        &self.registration
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Scope {
    Zone,
    DataCenter,
    Global,
}

/// Per-dataCenter push bookkeeping for one subscriber.
#[derive(Clone, Debug, Default)]
struct PushContext {
    /// Highest accepted push version.
    accepted_version: u64,
    /// Highest datum version this subscriber has been pushed.
    pushed_datum_version: u64,
    last_fetch_seq_start: u64,
    last_fetch_seq_end: u64,
}

/// Subscriber: receives pushes; tracks what it has already acknowledged so
/// stale or overlapping pushes are refused.
#[derive(Debug)]
pub struct Subscriber {
    pub registration: Registration,
    pub scope: Scope,
    push_state: Mutex<HashMap<String, PushContext>>,
}

impl Subscriber {
    pub fn new(registration: Registration, scope: Scope) -> Self {
        Self {
            registration,
            scope,
            push_state: Mutex::new(HashMap::new()),
        }
    }

    /// Whether this subscriber still consents to a push whose reads began at
    /// `fetch_seq_start`. Refuses once it has acknowledged a later fetch.
    pub fn check_version(&self, data_center: &str, fetch_seq_start: u64) -> bool {
        let state = self.push_state.lock().expect("subscriber push state");
        match state.get(data_center) {
            Some(ctx) => ctx.last_fetch_seq_end <= fetch_seq_start,
            None => true,
        }
    }

    /// Record a successful push. Accepts only forward progress: the push
    /// version must not regress and the fetch range must not overlap what
    /// was already acknowledged.
    pub fn check_and_update_version(
        &self,
        data_center: &str,
        push_version: u64,
        datum_versions: &HashMap<String, u64>,
        fetch_seq_start: u64,
        fetch_seq_end: u64,
    ) -> bool {
        let mut state = self.push_state.lock().expect("subscriber push state");
        let ctx = state.entry(data_center.to_string()).or_default();
        if push_version < ctx.accepted_version || ctx.last_fetch_seq_end > fetch_seq_start {
            return false;
        }
        ctx.accepted_version = push_version;
        ctx.last_fetch_seq_start = fetch_seq_start;
        ctx.last_fetch_seq_end = fetch_seq_end;
        for (dc, version) in datum_versions {
            let ctx = state.entry(dc.clone()).or_default();
            ctx.pushed_datum_version = ctx.pushed_datum_version.max(*version);
        }
        true
    }

    /// Whether a datum at `version` is news to this subscriber.
    pub fn needs_push(&self, data_center: &str, version: u64) -> bool {
        let state = self.push_state.lock().expect("subscriber push state");
        match state.get(data_center) {
            Some(ctx) => version > ctx.pushed_datum_version,
            None => true,
        }
    }

    /// Highest accepted push version for a data center, for introspection.
    pub fn accepted_version(&self, data_center: &str) -> u64 {
        let state = self.push_state.lock().expect("subscriber push state");
        state.get(data_center).map_or(0, |ctx| ctx.accepted_version)
    }
}

impl StoreRecord for Subscriber {
    fn registration(&self) -> &Registration {
        &self.registration
    }
}

/// Watcher: a minimal registration triggering a one-shot fetch-and-push.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Watcher {
    pub registration: Registration,
}

impl StoreRecord for Watcher {
    fn registration(&self) -> &Registration {
        &self.registration
    }
}

//! Session registration stores: the two-index in-memory maps.
//!
//! Three structurally identical stores index subscribers, publishers, and
//! watchers by dataInfoId and by connection identity at the same time. The
//! store is sharded by dataInfoId hash; each shard guards BOTH of its
//! indices with one lock, so they can never be observed out of step and
//! writers on different dataInfoIds run in parallel.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::core::{ConnectId, DataInfoId, RegisterId, StoreRecord};
use crate::core::{Publisher, Subscriber, Watcher};

const SHARD_COUNT: usize = 32;

pub type SessionInterests = RegistrationStore<Subscriber>;
pub type SessionDataStore = RegistrationStore<Publisher>;
pub type SessionWatchers = RegistrationStore<Watcher>;

struct Shard<R> {
    by_data_info: HashMap<DataInfoId, HashMap<RegisterId, Arc<R>>>,
    by_connect: HashMap<ConnectId, HashMap<DataInfoId, HashMap<RegisterId, Arc<R>>>>,
}

impl<R> Default for Shard<R> {
    fn default() -> Self {
        Self {
            by_data_info: HashMap::new(),
            by_connect: HashMap::new(),
        }
    }
}

pub struct RegistrationStore<R> {
    shards: Box<[RwLock<Shard<R>>]>,
}

impl<R: StoreRecord> Default for RegistrationStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: StoreRecord> RegistrationStore<R> {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(Shard::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { shards }
    }

    fn shard_for(&self, data_info_id: &DataInfoId) -> &RwLock<Shard<R>> {
        let mut hasher = DefaultHasher::new();
        data_info_id.hash(&mut hasher);
        &self.shards[(hasher.finish() % SHARD_COUNT as u64) as usize]
    }

    /// Insert-or-replace by `(dataInfoId, registerId)`.
    ///
    /// A record from a different connection replaces the resident one only
    /// when its registerTimestamp is not older AND its version is not
    /// smaller; this is what stops a stale reconnection from resurrecting a
    /// dead registration. A record from the same connection replaces unless
    /// its version is smaller. Returns whether the store changed.
    pub fn add(&self, record: impl Into<Arc<R>>) -> bool {
        let record = record.into();
        let data_info_id = record.data_info_id().clone();
        let register_id = record.register_id().clone();
        let connect_id = record.connect_id();

        let mut shard = self.shard_for(&data_info_id).write().expect("store shard");
        let mut displaced_connect = None;
        if let Some(existing) = shard
            .by_data_info
            .get(&data_info_id)
            .and_then(|slot| slot.get(&register_id))
        {
            let existing_reg = existing.registration();
            let new_reg = record.registration();
            let existing_connect = existing.connect_id();
            if existing_connect != connect_id {
                if new_reg.register_timestamp < existing_reg.register_timestamp
                    || new_reg.version < existing_reg.version
                {
                    debug!(
                        data_info_id = %data_info_id,
                        register_id = %register_id,
                        existing = %existing_connect,
                        incoming = %connect_id,
                        "stale registration ignored"
                    );
                    return false;
                }
                displaced_connect = Some(existing_connect);
            } else if new_reg.version < existing_reg.version {
                debug!(
                    data_info_id = %data_info_id,
                    register_id = %register_id,
                    "stale re-registration ignored"
                );
                return false;
            }
        }
        // The resident record moved to a new connection; drop it from the
        // old connection's index.
        if let Some(old_connect) = displaced_connect {
            remove_connect_entry(&mut shard, &old_connect, &data_info_id, &register_id);
        }

        shard
            .by_data_info
            .entry(data_info_id.clone())
            .or_default()
            .insert(register_id.clone(), Arc::clone(&record));
        shard
            .by_connect
            .entry(connect_id)
            .or_default()
            .entry(data_info_id)
            .or_default()
            .insert(register_id, record);
        true
    }

    /// Remove the single record matching `(registerId, dataInfoId)`.
    pub fn delete_by_id(&self, register_id: &RegisterId, data_info_id: &DataInfoId) -> bool {
        let mut shard = self.shard_for(data_info_id).write().expect("store shard");
        let (removed, emptied) = match shard.by_data_info.get_mut(data_info_id) {
            Some(slot) => match slot.remove(register_id) {
                Some(removed) => {
                    let emptied = slot.is_empty();
                    (removed, emptied)
                }
                None => return false,
            },
            None => return false,
        };
        if emptied {
            shard.by_data_info.remove(data_info_id);
        }
        remove_connect_entry(&mut shard, &removed.connect_id(), data_info_id, register_id);
        true
    }

    /// Remove every record registered through `connect_id`. Idempotent.
    ///
    /// A record is removed from the dataInfoId index only if the resident
    /// record still belongs to this connection; a replacement that arrived
    /// through a newer connection survives a delayed delete of the old one.
    pub fn delete_by_connect_id(&self, connect_id: &ConnectId) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.write().expect("store shard");
            let Some(stale) = shard.by_connect.remove(connect_id) else {
                continue;
            };
            for (data_info_id, registers) in stale {
                for register_id in registers.into_keys() {
                    let mut emptied = false;
                    if let Some(slot) = shard.by_data_info.get_mut(&data_info_id) {
                        let still_ours = slot
                            .get(&register_id)
                            .is_some_and(|current| current.connect_id() == *connect_id);
                        if still_ours {
                            slot.remove(&register_id);
                            removed += 1;
                            emptied = slot.is_empty();
                        }
                    }
                    if emptied {
                        shard.by_data_info.remove(&data_info_id);
                    }
                }
            }
        }
        removed
    }

    /// All records registered through `connect_id`, flattened by registerId.
    pub fn query_by_connect_id(&self, connect_id: &ConnectId) -> HashMap<RegisterId, Arc<R>> {
        let mut result = HashMap::new();
        for shard in &self.shards {
            let shard = shard.read().expect("store shard");
            if let Some(registers) = shard.by_connect.get(connect_id) {
                for by_register in registers.values() {
                    for (register_id, record) in by_register {
                        result.insert(register_id.clone(), Arc::clone(record));
                    }
                }
            }
        }
        result
    }

    /// All records on one dataInfoId.
    pub fn get_datas(&self, data_info_id: &DataInfoId) -> Vec<Arc<R>> {
        let shard = self.shard_for(data_info_id).read().expect("store shard");
        shard
            .by_data_info
            .get(data_info_id)
            .map(|slot| slot.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, data_info_id: &DataInfoId, register_id: &RegisterId) -> Option<Arc<R>> {
        let shard = self.shard_for(data_info_id).read().expect("store shard");
        shard
            .by_data_info
            .get(data_info_id)
            .and_then(|slot| slot.get(register_id))
            .cloned()
    }

    pub fn data_info_ids(&self) -> Vec<DataInfoId> {
        let mut ids = Vec::new();
        for shard in &self.shards {
            let shard = shard.read().expect("store shard");
            ids.extend(shard.by_data_info.keys().cloned());
        }
        ids
    }

    pub fn count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                let shard = shard.read().expect("store shard");
                shard.by_data_info.values().map(HashMap::len).sum::<usize>()
            })
            .sum()
    }

    /// Index-coherence check: every connect-index entry must point at the
    /// record resident in the dataInfoId index, and vice versa.
    #[cfg(test)]
    pub(crate) fn indices_consistent(&self) -> bool {
        for shard in &self.shards {
            let shard = shard.read().expect("store shard");
            for (connect_id, by_data_info) in &shard.by_connect {
                for (data_info_id, registers) in by_data_info {
                    for register_id in registers.keys() {
                        let resident = shard
                            .by_data_info
                            .get(data_info_id)
                            .and_then(|slot| slot.get(register_id));
                        match resident {
                            Some(record) if record.connect_id() == *connect_id => {}
                            _ => return false,
                        }
                    }
                }
            }
            for (data_info_id, slot) in &shard.by_data_info {
                for (register_id, record) in slot {
                    let indexed = shard
                        .by_connect
                        .get(&record.connect_id())
                        .and_then(|m| m.get(data_info_id))
                        .and_then(|m| m.get(register_id));
                    if indexed.is_none() {
                        return false;
                    }
                }
            }
        }
        true
    }
}

fn remove_connect_entry<R>(
    shard: &mut Shard<R>,
    connect_id: &ConnectId,
    data_info_id: &DataInfoId,
    register_id: &RegisterId,
) {
    let Some(by_data_info) = shard.by_connect.get_mut(connect_id) else {
        return;
    };
    if let Some(registers) = by_data_info.get_mut(data_info_id) {
        registers.remove(register_id);
        if registers.is_empty() {
            by_data_info.remove(data_info_id);
        }
    }
    if by_data_info.is_empty() {
        shard.by_connect.remove(connect_id);
    }
}

//! Paged diff pull between a local datum store and a peer.
//!
//! One syncer instance serves one direction: leader<-session carries a
//! change notifier (subscribers must hear about merged state), follower<-
//! leader does not. The `continues` predicate is consulted before every
//! page; an abort leaves already-applied pages committed and lets the next
//! run reconcile.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::Transience;
use crate::config::DataConfig;
use crate::data::{LocalDatumStorage, SessionLeaseManager};
use crate::remoting::{
    DataChangeNotifier, DiffSyncRequest, DiffSyncResponse, EpochPair, SyncRemote,
};

#[derive(Debug, Error)]
pub enum SyncError {
    /// Transient peer failure: timeout, reset, overload. Retried by the
    /// owning loop on its next tick.
    #[error("sync with {peer} failed: {reason}")]
    Peer { peer: String, reason: String },
}

impl SyncError {
    pub fn peer(peer: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::Peer {
            peer: peer.into(),
            reason: reason.into(),
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            SyncError::Peer { .. } => Transience::Retryable,
        }
    }
}

#[derive(Clone)]
pub struct SlotDiffSyncer {
    storage: Arc<LocalDatumStorage>,
    notifier: Option<Arc<dyn DataChangeNotifier>>,
    leases: Arc<SessionLeaseManager>,
    page_size: usize,
}

impl SlotDiffSyncer {
    pub fn new(
        config: &DataConfig,
        storage: Arc<LocalDatumStorage>,
        notifier: Option<Arc<dyn DataChangeNotifier>>,
        leases: Arc<SessionLeaseManager>,
    ) -> Self {
        Self {
            storage,
            notifier,
            leases,
            page_size: config.sync_page_size,
        }
    }

    /// Pull a session's publishers for a slot and merge them. Returns
    /// `Ok(false)` when `continues` aborted the run.
    pub fn sync_session(
        &self,
        slot_id: u32,
        session_ip: &str,
        remote: &dyn SyncRemote,
        epochs: EpochPair,
        continues: &(dyn Fn() -> bool + Sync),
    ) -> Result<bool, SyncError> {
        let finished = self.pull(
            slot_id,
            session_ip,
            remote,
            epochs,
            continues,
            |storage, response| {
                let mut changed = 0;
                for datum in response.datums {
                    let data_info_id = datum.data_info_id.clone();
                    if let Some(version) = storage.merge_datum(slot_id, datum) {
                        changed += 1;
                        self.notify(&data_info_id, version);
                    }
                }
                for data_info_id in &response.removed {
                    if let Some(version) = storage.remove_datum(slot_id, data_info_id) {
                        changed += 1;
                        self.notify(data_info_id, version);
                    }
                }
                changed
            },
        )?;
        if finished {
            self.leases.renew(session_ip);
        }
        Ok(finished)
    }

    /// Tail the slot leader, adopting its datums verbatim.
    pub fn sync_leader(
        &self,
        slot_id: u32,
        leader: &str,
        remote: &dyn SyncRemote,
        epochs: EpochPair,
        continues: &(dyn Fn() -> bool + Sync),
    ) -> Result<bool, SyncError> {
        self.pull(
            slot_id,
            leader,
            remote,
            epochs,
            continues,
            |storage, response| {
                let mut changed = 0;
                for datum in response.datums {
                    if storage.replace_datum_if_newer(slot_id, datum) {
                        changed += 1;
                    }
                }
                for data_info_id in &response.removed {
                    if storage.remove_datum(slot_id, data_info_id).is_some() {
                        changed += 1;
                    }
                }
                changed
            },
        )
    }

    fn pull(
        &self,
        slot_id: u32,
        peer: &str,
        remote: &dyn SyncRemote,
        epochs: EpochPair,
        continues: &(dyn Fn() -> bool + Sync),
        mut apply: impl FnMut(&LocalDatumStorage, DiffSyncResponse) -> usize,
    ) -> Result<bool, SyncError> {
        let mut cursor = None;
        let mut pages = 0usize;
        let mut changed = 0usize;
        loop {
            if !continues() {
                debug!(slot_id, peer, pages, "sync aborted, role changed");
                return Ok(false);
            }
            let request = DiffSyncRequest {
                slot_id,
                epochs,
                known_versions: self.storage.versions(slot_id),
                start_after: cursor,
                page_size: self.page_size,
            };
            let response = remote.sync_slot(peer, request)?;
            let has_more = response.has_more;
            let next = response.next.clone();
            changed += apply(&self.storage, response);
            pages += 1;
            if !has_more || next.is_none() {
                if changed > 0 {
                    info!(slot_id, peer, pages, changed, "slot diff applied");
                }
                return Ok(true);
            }
            cursor = next;
        }
    }

    fn notify(&self, data_info_id: &crate::core::DataInfoId, version: u64) {
        if let Some(notifier) = &self.notifier {
            notifier.on_change(self.storage.data_center(), data_info_id, version);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataEntry, DataInfoId, Datum, DatumEntry, RegisterId};
    use crate::data::SlotRole;
    use crate::data::SlotChangeListener;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    fn data_info_id(name: &str) -> DataInfoId {
        DataInfoId::new(name, "instance2", "rpc").unwrap()
    }

    fn epochs() -> EpochPair {
        EpochPair {
            slot_table_epoch: 3,
            leader_epoch: 1,
        }
    }

    fn datum(name: &str, entry_version: u64) -> Datum {
        let mut datum = Datum::new("dc1", data_info_id(name));
        datum.merge_entry(DatumEntry {
            register_id: RegisterId::new("p1").unwrap(),
            version: entry_version,
            register_timestamp: entry_version,
            source_address: "10.0.0.1:7000".parse().unwrap(),
            data_list: vec![DataEntry::new(&b"payload"[..])],
        });
        datum
    }

    /// Serves a scripted sequence of pages.
    struct PagedRemote {
        pages: Mutex<Vec<DiffSyncResponse>>,
    }

    impl SyncRemote for PagedRemote {
        fn sync_slot(
            &self,
            _peer: &str,
            _request: DiffSyncRequest,
        ) -> Result<DiffSyncResponse, SyncError> {
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                Ok(DiffSyncResponse::default())
            } else {
                Ok(pages.remove(0))
            }
        }
    }

    struct Recorder {
        changes: Mutex<Vec<(DataInfoId, u64)>>,
    }

    impl DataChangeNotifier for Recorder {
        fn on_change(&self, _data_center: &str, data_info_id: &DataInfoId, version: u64) {
            self.changes
                .lock()
                .unwrap()
                .push((data_info_id.clone(), version));
        }
    }

    fn fixture(
        pages: Vec<DiffSyncResponse>,
    ) -> (SlotDiffSyncer, Arc<LocalDatumStorage>, Arc<Recorder>, PagedRemote) {
        let storage = Arc::new(LocalDatumStorage::new("dc1"));
        storage.on_slot_add(7, SlotRole::Leader);
        let recorder = Arc::new(Recorder {
            changes: Mutex::new(Vec::new()),
        });
        let leases = Arc::new(SessionLeaseManager::new(Duration::from_secs(30)));
        let syncer = SlotDiffSyncer::new(
            &DataConfig::default(),
            Arc::clone(&storage),
            Some(Arc::clone(&recorder) as Arc<dyn DataChangeNotifier>),
            leases,
        );
        let remote = PagedRemote {
            pages: Mutex::new(pages),
        };
        (syncer, storage, recorder, remote)
    }

    #[test]
    fn session_sync_applies_pages_and_notifies() {
        let page1 = DiffSyncResponse {
            datums: vec![datum("a", 1)],
            removed: vec![],
            has_more: true,
            next: Some(data_info_id("a")),
        };
        let page2 = DiffSyncResponse {
            datums: vec![datum("b", 1)],
            removed: vec![],
            has_more: false,
            next: None,
        };
        let (syncer, storage, recorder, remote) = fixture(vec![page1, page2]);

        let done = syncer
            .sync_session(7, "10.1.0.1", &remote, epochs(), &|| true)
            .unwrap();
        assert!(done);
        assert_eq!(storage.datum_count(7), 2);
        assert_eq!(recorder.changes.lock().unwrap().len(), 2);
    }

    #[test]
    fn abort_between_pages_keeps_applied_state() {
        let page1 = DiffSyncResponse {
            datums: vec![datum("a", 1)],
            removed: vec![],
            has_more: true,
            next: Some(data_info_id("a")),
        };
        let page2 = DiffSyncResponse {
            datums: vec![datum("b", 1)],
            removed: vec![],
            has_more: false,
            next: None,
        };
        let (syncer, storage, _recorder, remote) = fixture(vec![page1, page2]);

        // Allow exactly one continues() pass.
        let allowed = std::sync::atomic::AtomicU32::new(1);
        let continues = || {
            allowed
                .fetch_update(
                    std::sync::atomic::Ordering::SeqCst,
                    std::sync::atomic::Ordering::SeqCst,
                    |v| v.checked_sub(1),
                )
                .is_ok()
        };
        let done = syncer
            .sync_session(7, "10.1.0.1", &remote, epochs(), &continues)
            .unwrap();
        assert!(!done);
        // First page committed, second never requested.
        assert_eq!(storage.datum_count(7), 1);
        assert!(remote.pages.lock().unwrap().len() == 1);
    }

    #[test]
    fn session_sync_removal_drops_datum_and_notifies() {
        let page = DiffSyncResponse {
            datums: vec![],
            removed: vec![data_info_id("a")],
            has_more: false,
            next: None,
        };
        let (syncer, storage, recorder, remote) = fixture(vec![page]);
        let seeded = storage.merge_datum(7, datum("a", 1)).unwrap();

        syncer
            .sync_session(7, "10.1.0.1", &remote, epochs(), &|| true)
            .unwrap();
        assert_eq!(storage.datum_count(7), 0);
        let changes = recorder.changes.lock().unwrap();
        let removal = changes.last().unwrap();
        assert!(removal.1 > seeded);
    }

    #[test]
    fn leader_sync_adopts_versions_without_notifying() {
        let mut incoming = datum("a", 1);
        incoming.version = 12345;
        let page = DiffSyncResponse {
            datums: vec![incoming],
            removed: vec![],
            has_more: false,
            next: None,
        };
        let (syncer, storage, recorder, remote) = fixture(vec![page]);
        // Leader-tailing syncer carries no notifier.
        let syncer = SlotDiffSyncer {
            notifier: None,
            ..syncer
        };
        let done = syncer.sync_leader(7, "10.2.0.1", &remote, epochs(), &|| true).unwrap();
        assert!(done);
        assert_eq!(storage.get(7, &data_info_id("a")).unwrap().version, 12345);
        assert!(recorder.changes.lock().unwrap().is_empty());
    }

    #[test]
    fn known_versions_reflect_local_state() {
        let (syncer, storage, _recorder, _remote) = fixture(vec![]);
        storage.merge_datum(7, datum("a", 1));

        struct Capture {
            known: Mutex<Option<BTreeMap<DataInfoId, u64>>>,
        }
        impl SyncRemote for Capture {
            fn sync_slot(
                &self,
                _peer: &str,
                request: DiffSyncRequest,
            ) -> Result<DiffSyncResponse, SyncError> {
                *self.known.lock().unwrap() = Some(request.known_versions);
                Ok(DiffSyncResponse::default())
            }
        }
        let capture = Capture {
            known: Mutex::new(None),
        };
        syncer
            .sync_session(7, "10.1.0.1", &capture, epochs(), &|| true)
            .unwrap();
        let known = capture.known.lock().unwrap().clone().unwrap();
        assert_eq!(known.len(), 1);
        assert!(known.contains_key(&data_info_id("a")));
    }
}

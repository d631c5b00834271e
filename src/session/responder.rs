//! Session-side responder for leader-driven slot syncs.
//!
//! A data leader refilling (or steadily re-checking) a slot pulls the
//! session's publishers for that slot in pages; the session answers from its
//! publisher store only, assembling datum-shaped groups the leader can merge
//! idempotently.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::core::{DataInfoId, Datum, DatumEntry, slot_of};
use crate::remoting::{DiffSyncRequest, DiffSyncResponse};
use crate::session::store::SessionDataStore;

pub struct SessionSyncResponder {
    publishers: Arc<SessionDataStore>,
    data_center: String,
    slot_count: u32,
}

impl SessionSyncResponder {
    pub fn new(publishers: Arc<SessionDataStore>, data_center: &str, slot_count: u32) -> Self {
        Self {
            publishers,
            data_center: data_center.to_string(),
            slot_count,
        }
    }

    pub fn respond(&self, request: &DiffSyncRequest) -> DiffSyncResponse {
        let mut slot_ids: BTreeSet<DataInfoId> = self
            .publishers
            .data_info_ids()
            .into_iter()
            .filter(|id| slot_of(id, self.slot_count) == request.slot_id)
            .collect();

        // Ids the caller knows but this session no longer publishes;
        // reported once, on the first page.
        let removed: Vec<DataInfoId> = if request.start_after.is_none() {
            request
                .known_versions
                .keys()
                .filter(|id| {
                    slot_of(id, self.slot_count) == request.slot_id && !slot_ids.contains(*id)
                })
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        if let Some(cursor) = &request.start_after {
            slot_ids = slot_ids.into_iter().filter(|id| id > cursor).collect();
        }

        let page_size = request.page_size.max(1);
        let page: Vec<DataInfoId> = slot_ids.iter().take(page_size).cloned().collect();
        let has_more = slot_ids.len() > page.len();
        let next = if has_more { page.last().cloned() } else { None };

        let datums = page
            .into_iter()
            .filter_map(|data_info_id| {
                let publishers = self.publishers.get_datas(&data_info_id);
                if publishers.is_empty() {
                    return None;
                }
                let mut datum = Datum::new(self.data_center.clone(), data_info_id);
                for publisher in &publishers {
                    datum.merge_entry(DatumEntry::from_publisher(publisher));
                }
                // Informative only; the leader assigns authoritative datum
                // versions from its own generator.
                datum.version = datum
                    .publishers
                    .values()
                    .map(|e| e.version)
                    .max()
                    .unwrap_or(0);
                Some(datum)
            })
            .collect();

        DiffSyncResponse {
            datums,
            removed,
            has_more,
            next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataEntry, Publisher, RegisterId, Registration};
    use crate::remoting::EpochPair;
    use std::collections::BTreeMap;

    fn publisher(data_id: &str, register_id: &str) -> Publisher {
        Publisher {
            registration: Registration {
                data_info_id: DataInfoId::new(data_id, "instance2", "rpc").unwrap(),
                register_id: RegisterId::new(register_id).unwrap(),
                version: 1,
                register_timestamp: 1,
                source_address: "192.168.1.1:12345".parse().unwrap(),
                target_address: "192.168.1.2:9600".parse().unwrap(),
                app_name: None,
                client_id: None,
            },
            data_list: vec![DataEntry::new(&b"payload"[..])],
        }
    }

    #[test]
    fn pages_cover_slot_and_report_removed() {
        let store = Arc::new(SessionDataStore::new());
        // Single-slot space keeps every id in the requested slot.
        let slot_count = 1;
        for i in 0..5 {
            store.add(publisher(&format!("data-{i}"), &format!("reg-{i}")));
        }
        let responder = SessionSyncResponder::new(Arc::clone(&store), "dc1", slot_count);

        let gone = DataInfoId::new("data-gone", "instance2", "rpc").unwrap();
        let mut request = DiffSyncRequest {
            slot_id: 0,
            epochs: EpochPair {
                slot_table_epoch: 1,
                leader_epoch: 1,
            },
            known_versions: BTreeMap::from([(gone.clone(), 7)]),
            start_after: None,
            page_size: 2,
        };

        let mut seen = Vec::new();
        let mut first = true;
        loop {
            let response = responder.respond(&request);
            if first {
                assert_eq!(response.removed, vec![gone.clone()]);
                first = false;
            }
            seen.extend(response.datums.iter().map(|d| d.data_info_id.clone()));
            if !response.has_more {
                break;
            }
            request.start_after = response.next.clone();
        }
        assert_eq!(seen.len(), 5);
        let unique: BTreeSet<_> = seen.into_iter().collect();
        assert_eq!(unique.len(), 5);
    }
}

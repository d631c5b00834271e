//! Decides when pushes happen: subscriber registration, datum version
//! change, watcher one-shot fetch.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::core::{DataInfoId, Datum, RegisterId, StoreRecord, Subscriber, Watcher};
use crate::remoting::{DataChangeNotifier, DatumReader, PushClient, PushPayload};
use crate::session::push::PushProcessor;
use crate::session::store::SessionInterests;

pub struct FirePushService {
    config: Arc<SessionConfig>,
    interests: Arc<SessionInterests>,
    reader: Arc<dyn DatumReader>,
    processor: Arc<PushProcessor>,
    client: Arc<dyn PushClient>,
    /// Session-local fetch cursor; a push carries the seq range spanning the
    /// datum reads that produced it, so later pushes order even when the
    /// datum version itself did not change.
    fetch_seq: AtomicU64,
}

impl FirePushService {
    pub fn new(
        config: Arc<SessionConfig>,
        interests: Arc<SessionInterests>,
        reader: Arc<dyn DatumReader>,
        processor: Arc<PushProcessor>,
        client: Arc<dyn PushClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            interests,
            reader,
            processor,
            client,
            fetch_seq: AtomicU64::new(0),
        })
    }

    fn next_seq(&self) -> u64 {
        self.fetch_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Initial push for a freshly registered subscriber.
    pub fn fire_on_register(&self, subscriber: Arc<Subscriber>) {
        let data_center = self.config.data_center.clone();
        let seq_start = self.next_seq();
        let datum = match self.fetch(&data_center, subscriber.data_info_id()) {
            Ok(datum) => datum,
            Err(()) => return,
        };
        let seq_end = self.next_seq();
        let addr = subscriber.registration().source_address;
        let version = datum.version;
        self.processor.fire_push(
            true,
            version,
            &data_center,
            addr,
            HashMap::from([(subscriber.register_id().clone(), subscriber)]),
            HashMap::from([(data_center.clone(), datum)]),
            seq_start,
            seq_end,
        );
    }

    /// Push to every interested subscriber after a datum version advance.
    pub fn fire_on_change(&self, data_center: &str, data_info_id: &DataInfoId, version: u64) {
        let interested: Vec<Arc<Subscriber>> = self
            .interests
            .get_datas(data_info_id)
            .into_iter()
            .filter(|s| s.needs_push(data_center, version))
            .collect();
        if interested.is_empty() {
            return;
        }

        let seq_start = self.next_seq();
        let datum = match self.fetch(data_center, data_info_id) {
            Ok(datum) => datum,
            Err(()) => return,
        };
        let seq_end = self.next_seq();

        let mut by_addr: HashMap<SocketAddr, HashMap<RegisterId, Arc<Subscriber>>> =
            HashMap::new();
        for subscriber in interested {
            by_addr
                .entry(subscriber.registration().source_address)
                .or_default()
                .insert(subscriber.register_id().clone(), subscriber);
        }
        for (addr, subscribers) in by_addr {
            self.processor.fire_push(
                false,
                datum.version,
                data_center,
                addr,
                subscribers,
                HashMap::from([(data_center.to_string(), datum.clone())]),
                seq_start,
                seq_end,
            );
        }
    }

    /// One-shot fetch-and-push for a watcher, outside the subscriber version
    /// bookkeeping.
    pub fn fire_watcher_fetch(&self, watcher: &Watcher) {
        let data_center = self.config.data_center.clone();
        let Ok(datum) = self.fetch(&data_center, watcher.data_info_id()) else {
            return;
        };
        let addr = watcher.registration.source_address;
        let payload = PushPayload {
            data_info_id: datum.data_info_id.clone(),
            version: datum.version,
            subscribers: vec![watcher.register_id().clone()],
            entries: datum
                .publishers
                .values()
                .map(|e| {
                    (
                        e.register_id.clone(),
                        e.data_list.iter().map(|d| d.data.clone()).collect(),
                    )
                })
                .collect(),
        };
        info!(data_info_id = %payload.data_info_id, %addr, "watcher fetch push");
        self.client.push(
            addr,
            payload,
            Box::new(move |result| {
                if let Err(err) = result {
                    warn!(%addr, %err, "watcher push failed");
                }
            }),
        );
    }

    /// Fetch the current datum, falling back to an empty one so absent data
    /// still pushes an empty list.
    fn fetch(&self, data_center: &str, data_info_id: &DataInfoId) -> Result<Datum, ()> {
        match self.reader.fetch(data_center, data_info_id) {
            Ok(Some(datum)) => Ok(datum),
            Ok(None) => Ok(Datum::new(data_center, data_info_id.clone())),
            Err(err) => {
                warn!(%data_info_id, %err, "datum fetch failed, push skipped");
                Err(())
            }
        }
    }
}

/// The data tier's version-change notifications feed straight back into the
/// push pipeline.
impl DataChangeNotifier for FirePushService {
    fn on_change(&self, data_center: &str, data_info_id: &DataInfoId, version: u64) {
        self.fire_on_change(data_center, data_info_id, version);
    }
}

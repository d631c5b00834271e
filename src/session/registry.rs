//! Session registry facade: the entry point registration RPCs call into.
//!
//! Stores the record, then triggers the side effect the record kind implies:
//! publishers sync to the data tier, subscribers get an initial push,
//! watchers get a one-shot fetch.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::core::{ConnectId, DataInfoId, Publisher, RegisterId, StoreRecord, Subscriber, Watcher};
use crate::data::SyncError;
use crate::remoting::PublisherWriter;
use crate::session::fire::FirePushService;
use crate::session::push::PushSwitch;
use crate::session::store::{SessionDataStore, SessionInterests, SessionWatchers};

pub struct SessionRegistry {
    publishers: Arc<SessionDataStore>,
    interests: Arc<SessionInterests>,
    watchers: Arc<SessionWatchers>,
    writer: Arc<dyn PublisherWriter>,
    fire: Arc<FirePushService>,
    switch: PushSwitch,
}

impl SessionRegistry {
    pub fn new(
        publishers: Arc<SessionDataStore>,
        interests: Arc<SessionInterests>,
        watchers: Arc<SessionWatchers>,
        writer: Arc<dyn PublisherWriter>,
        fire: Arc<FirePushService>,
        switch: PushSwitch,
    ) -> Self {
        Self {
            publishers,
            interests,
            watchers,
            writer,
            fire,
            switch,
        }
    }

    /// Store a publisher and sync it to the slot leader. The sync fires only
    /// when the store accepted the record: a record the store refused as a
    /// stale reconnection must not reach the data tier either, where the
    /// version-only merge would resurrect it over the live entry.
    pub fn register_publisher(&self, publisher: Publisher) -> Result<(), SyncError> {
        let publisher = Arc::new(publisher);
        let changed = self.publishers.add(Arc::clone(&publisher));
        debug!(
            data_info_id = %publisher.data_info_id(),
            register_id = %publisher.register_id(),
            changed,
            "publisher register"
        );
        if !changed {
            return Ok(());
        }
        self.writer.publish(&publisher)
    }

    pub fn register_subscriber(&self, subscriber: Subscriber) {
        let subscriber = Arc::new(subscriber);
        self.interests.add(Arc::clone(&subscriber));
        if !self.switch.is_stopped() {
            self.fire.fire_on_register(subscriber);
        }
    }

    pub fn register_watcher(&self, watcher: Watcher) {
        let watcher = Arc::new(watcher);
        self.watchers.add(Arc::clone(&watcher));
        self.fire.fire_watcher_fetch(&watcher);
    }

    pub fn deregister_publisher(
        &self,
        data_info_id: &DataInfoId,
        register_id: &RegisterId,
    ) -> Result<(), SyncError> {
        let Some(publisher) = self.publishers.get(data_info_id, register_id) else {
            return Ok(());
        };
        self.publishers.delete_by_id(register_id, data_info_id);
        self.writer
            .unpublish(data_info_id, register_id, publisher.registration().version)
    }

    pub fn deregister_subscriber(&self, data_info_id: &DataInfoId, register_id: &RegisterId) {
        self.interests.delete_by_id(register_id, data_info_id);
    }

    pub fn deregister_watcher(&self, data_info_id: &DataInfoId, register_id: &RegisterId) {
        self.watchers.delete_by_id(register_id, data_info_id);
    }

    /// Connection loss: drop every registration tied to the connection and
    /// propagate publisher removals to the data tier.
    pub fn client_off(&self, connect_id: &ConnectId) {
        let publishers = self.publishers.query_by_connect_id(connect_id);
        let removed_pubs = self.publishers.delete_by_connect_id(connect_id);
        for (register_id, publisher) in publishers {
            if let Err(err) = self.writer.unpublish(
                publisher.data_info_id(),
                &register_id,
                publisher.registration().version,
            ) {
                // Next leader<-session sync reconciles; the record is gone
                // from the store the sync serves.
                warn!(%register_id, %err, "unpublish on client off failed");
            }
        }
        let removed_subs = self.interests.delete_by_connect_id(connect_id);
        let removed_watchers = self.watchers.delete_by_connect_id(connect_id);
        info!(
            connect_id = %connect_id,
            removed_pubs,
            removed_subs,
            removed_watchers,
            "client off"
        );
    }
}

//! Per-data-node slot state machine.
//!
//! Reacts to slot-table epoch updates from meta, drives migration when this
//! node gains slot leadership, and runs the steady-state sync loops
//! (leader->sessions, follower->leader) from a single wakeable watchdog.
//!
//! Lock discipline: one RwLock guards `(table, slot states)`; it is read on
//! every access check and written only when a strictly newer table applies.
//! Per-slot task bookkeeping is owned by the watchdog alone; the shared view
//! exposes just atomics (migrated flag, sync timestamps) to other threads.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crossbeam::channel::Sender;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::DataConfig;
use crate::core::{
    DataInfoId, Slot, SlotAccess, SlotAccessStatus, SlotTable, now_ms, slot_of,
};
use crate::data::recorder::SlotTableRecorder;
use crate::data::storage::LocalDatumStorage;
use crate::data::sync::SlotDiffSyncer;
use crate::data::{SessionLeaseManager, SlotChangeListener, SlotRole};
use crate::remoting::{DataChangeNotifier, EpochPair, SessionNodeProvider, SyncRemote};
use crate::task::{
    KeyedExecutor, LoopRunner, TaskHandle, WakeReceiver, Wakeup, spawn_loop, wakeup_channel,
};

/// How many sync-session shards one session node is spread over; bounds the
/// number of concurrent syncs hitting the same session.
const SYNC_SESSION_GROUPS: u32 = 8;

/// A follower sync still running after this long gets a progress warning.
const SYNC_LEADER_SLOW_MS: u64 = 5_000;

/// Everything a slot manager needs from the outside.
pub struct SlotManagerContext {
    pub local_ip: String,
    pub config: Arc<DataConfig>,
    pub storage: Arc<LocalDatumStorage>,
    pub sessions: Arc<dyn SessionNodeProvider>,
    /// Transport to session nodes (migration and steady session sync).
    pub session_remote: Arc<dyn SyncRemote>,
    /// Transport to other data nodes (follower->leader tailing).
    pub data_remote: Arc<dyn SyncRemote>,
    /// Receives datum version changes from session-origin merges.
    pub change_notifier: Option<Arc<dyn DataChangeNotifier>>,
    pub recorders: Vec<Box<dyn SlotTableRecorder>>,
    /// Out-of-band requests to refresh the slot table from meta, sent when a
    /// caller presents a newer epoch than ours.
    pub epoch_requests: Sender<u64>,
}

#[derive(Clone)]
struct SlotState {
    slot: Slot,
    migrated: Arc<AtomicBool>,
    last_leader_sync_success_ms: Arc<AtomicI64>,
    leader_sync_start_ms: Arc<AtomicI64>,
}

impl SlotState {
    fn new(slot: Slot) -> Self {
        Self {
            slot,
            migrated: Arc::new(AtomicBool::new(false)),
            last_leader_sync_success_ms: Arc::new(AtomicI64::new(-1)),
            leader_sync_start_ms: Arc::new(AtomicI64::new(-1)),
        }
    }
}

struct SlotTableStates {
    table: SlotTable,
    slots: HashMap<u32, SlotState>,
}

/// Heartbeat-surface view of one local slot.
#[derive(Clone, Debug, Serialize)]
pub enum SlotStatus {
    Leader {
        slot_id: u32,
        leader_epoch: u64,
        healthy: bool,
    },
    Follower {
        slot_id: u32,
        leader_epoch: u64,
        last_sync_start_ms: i64,
        last_success_sync_ms: i64,
    },
}

pub struct SlotManager {
    local_ip: String,
    config: Arc<DataConfig>,
    storage: Arc<LocalDatumStorage>,
    sessions: Arc<dyn SessionNodeProvider>,
    session_remote: Arc<dyn SyncRemote>,
    data_remote: Arc<dyn SyncRemote>,
    session_syncer: SlotDiffSyncer,
    leader_syncer: SlotDiffSyncer,
    leases: Arc<SessionLeaseManager>,
    recorders: Vec<Box<dyn SlotTableRecorder>>,
    listeners: Vec<Arc<dyn SlotChangeListener>>,
    states: RwLock<SlotTableStates>,
    updating: Mutex<Option<SlotTable>>,
    epoch_requests: Sender<u64>,
    wake: Wakeup,
    wake_rx: Mutex<Option<WakeReceiver>>,
    migrate_executor: KeyedExecutor,
    sync_session_executor: KeyedExecutor,
    sync_leader_executor: KeyedExecutor,
}

impl SlotManager {
    pub fn new(ctx: SlotManagerContext) -> Arc<Self> {
        let leases = Arc::new(SessionLeaseManager::new(Duration::from_secs(
            ctx.config.session_lease_secs,
        )));
        let session_syncer = SlotDiffSyncer::new(
            &ctx.config,
            Arc::clone(&ctx.storage),
            ctx.change_notifier.clone(),
            Arc::clone(&leases),
        );
        // Follower tailing adopts leader state silently; no notifier.
        let leader_syncer = SlotDiffSyncer::new(
            &ctx.config,
            Arc::clone(&ctx.storage),
            None,
            Arc::clone(&leases),
        );
        let migrate_executor = KeyedExecutor::new(
            "migrate-session",
            ctx.config.migrate_session_executor_threads,
            ctx.config.migrate_session_executor_queue,
        );
        let sync_session_executor = KeyedExecutor::new(
            "sync-session",
            ctx.config.sync_session_executor_threads,
            ctx.config.sync_session_executor_queue,
        );
        let sync_leader_executor = KeyedExecutor::new(
            "sync-leader",
            ctx.config.sync_leader_executor_threads,
            ctx.config.sync_leader_executor_queue,
        );
        let (wake, wake_rx) = wakeup_channel();
        Arc::new(Self {
            local_ip: ctx.local_ip,
            config: ctx.config,
            listeners: vec![Arc::clone(&ctx.storage) as Arc<dyn SlotChangeListener>],
            storage: ctx.storage,
            sessions: ctx.sessions,
            session_remote: ctx.session_remote,
            data_remote: ctx.data_remote,
            session_syncer,
            leader_syncer,
            leases,
            recorders: ctx.recorders,
            states: RwLock::new(SlotTableStates {
                table: SlotTable::empty(),
                slots: HashMap::new(),
            }),
            updating: Mutex::new(None),
            epoch_requests: ctx.epoch_requests,
            wake,
            wake_rx: Mutex::new(Some(wake_rx)),
            migrate_executor,
            sync_session_executor,
            sync_leader_executor,
        })
    }

    pub fn slot_of(&self, data_info_id: &DataInfoId) -> u32 {
        slot_of(data_info_id, self.config.slot_count)
    }

    pub fn get_slot(&self, slot_id: u32) -> Option<Slot> {
        let states = self.states.read().expect("slot states");
        states.slots.get(&slot_id).map(|s| s.slot.clone())
    }

    pub fn is_leader(&self, slot_id: u32) -> bool {
        let states = self.states.read().expect("slot states");
        states
            .slots
            .get(&slot_id)
            .is_some_and(|s| s.slot.is_leader(&self.local_ip))
    }

    pub fn is_follower(&self, slot_id: u32) -> bool {
        let states = self.states.read().expect("slot states");
        states
            .slots
            .get(&slot_id)
            .is_some_and(|s| s.slot.is_follower(&self.local_ip))
    }

    pub fn slot_table_epoch(&self) -> u64 {
        self.states.read().expect("slot states").table.epoch
    }

    pub fn leases(&self) -> &Arc<SessionLeaseManager> {
        &self.leases
    }

    /// The epoch guard run on every incoming data RPC. When the caller
    /// presents a newer slot-table epoch, an out-of-band refresh is
    /// requested before answering from current state.
    pub fn check_slot_access(
        &self,
        slot_id: u32,
        src_slot_epoch: u64,
        src_leader_epoch: u64,
    ) -> SlotAccess {
        let (current_epoch, state) = {
            let states = self.states.read().expect("slot states");
            (states.table.epoch, states.slots.get(&slot_id).cloned())
        };
        if current_epoch < src_slot_epoch {
            let _ = self.epoch_requests.try_send(src_slot_epoch);
        }
        self.access_of(slot_id, current_epoch, state.as_ref(), src_leader_epoch)
    }

    fn access_of(
        &self,
        slot_id: u32,
        current_epoch: u64,
        state: Option<&SlotState>,
        src_leader_epoch: u64,
    ) -> SlotAccess {
        let Some(state) = state else {
            return SlotAccess::new(slot_id, current_epoch, SlotAccessStatus::Moved, None);
        };
        let leader_epoch = state.slot.leader_epoch;
        if !state.slot.is_leader(&self.local_ip) {
            return SlotAccess::new(
                slot_id,
                current_epoch,
                SlotAccessStatus::Moved,
                Some(leader_epoch),
            );
        }
        if !state.migrated.load(Ordering::Acquire) {
            return SlotAccess::new(
                slot_id,
                current_epoch,
                SlotAccessStatus::Migrating,
                Some(leader_epoch),
            );
        }
        if leader_epoch != src_leader_epoch {
            return SlotAccess::new(
                slot_id,
                current_epoch,
                SlotAccessStatus::MisMatch,
                Some(leader_epoch),
            );
        }
        SlotAccess::new(
            slot_id,
            current_epoch,
            SlotAccessStatus::Accept,
            Some(leader_epoch),
        )
    }

    /// Accept a slot table from meta. Only strictly newer epochs are taken;
    /// the update is staged and applied on the watchdog thread so the
    /// heartbeat path never blocks on the state lock.
    pub fn update_slot_table(&self, update: SlotTable) -> bool {
        let current_epoch = self.slot_table_epoch();
        if current_epoch >= update.epoch {
            return false;
        }
        let mut updating = self.updating.lock().expect("updating slot table");
        if let Some(pending) = &*updating
            && pending.epoch >= update.epoch
        {
            return false;
        }
        for recorder in &self.recorders {
            recorder.record(&update);
        }
        let filtered = update.filter(&self.local_ip);
        {
            let states = self.states.read().expect("slot states");
            let ok = states.table.leader_epochs_not_regressed(&filtered);
            debug_assert!(ok, "leader epoch regressed in newer slot table");
            if !ok {
                error!(
                    new_epoch = filtered.epoch,
                    "leader epoch regressed in newer slot table"
                );
            }
        }
        info!(
            new_epoch = filtered.epoch,
            current_epoch, "updating slot table"
        );
        *updating = Some(filtered);
        drop(updating);
        self.wake.wakeup();
        true
    }

    pub fn slot_statuses(&self) -> Vec<SlotStatus> {
        let states = self.states.read().expect("slot states");
        states
            .slots
            .values()
            .map(|state| {
                if state.slot.is_leader(&self.local_ip) {
                    SlotStatus::Leader {
                        slot_id: state.slot.id,
                        leader_epoch: state.slot.leader_epoch,
                        healthy: state.migrated.load(Ordering::Acquire),
                    }
                } else {
                    SlotStatus::Follower {
                        slot_id: state.slot.id,
                        leader_epoch: state.slot.leader_epoch,
                        last_sync_start_ms: state.leader_sync_start_ms.load(Ordering::Acquire),
                        last_success_sync_ms: state
                            .last_leader_sync_success_ms
                            .load(Ordering::Acquire),
                    }
                }
            })
            .collect()
    }

    /// Spawn the syncing watchdog. Call once.
    pub fn start(self: &Arc<Self>) -> LoopRunner {
        let rx = self
            .wake_rx
            .lock()
            .expect("slot watchdog receiver")
            .take()
            .expect("slot watchdog already started");
        let mut watchdog = SlotWatchdog::new(Arc::clone(self));
        spawn_loop(
            "slot-watchdog",
            Duration::from_millis(self.config.slot_watchdog_interval_ms),
            rx,
            move || watchdog.tick(),
        )
    }

    fn listen_add(&self, slot: &Slot) {
        let role = self.role_of(slot);
        for listener in &self.listeners {
            listener.on_slot_add(slot.id, role);
        }
    }

    fn listen_remove(&self, slot: &Slot) {
        let role = self.role_of(slot);
        for listener in &self.listeners {
            listener.on_slot_remove(slot.id, role);
        }
    }

    fn role_of(&self, slot: &Slot) -> SlotRole {
        if slot.is_leader(&self.local_ip) {
            SlotRole::Leader
        } else {
            SlotRole::Follower
        }
    }

    fn commit_sync_session(
        self: &Arc<Self>,
        slot: &Slot,
        slot_table_epoch: u64,
        session_ip: &str,
        migrate: bool,
    ) -> Result<TaskHandle, crate::task::ExecutorError> {
        let slot_id = slot.id;
        let epochs = EpochPair {
            slot_table_epoch,
            leader_epoch: slot.leader_epoch,
        };
        let manager = Arc::downgrade(self);
        let continues = move || {
            // A leader that lost the slot mid-sync must stop cleanly.
            manager.upgrade().is_some_and(|m| m.is_leader(slot_id))
        };
        let syncer = self.session_syncer.clone();
        let remote = Arc::clone(&self.session_remote);
        let ip = session_ip.to_string();
        let job = move || {
            match syncer.sync_session(slot_id, &ip, remote.as_ref(), epochs, &continues) {
                Ok(finished) => finished,
                Err(err) => {
                    error!(session = %ip, slot_id, %err, "sync session failed");
                    false
                }
            }
        };
        if migrate {
            self.migrate_executor
                .execute((slot_id, session_ip.to_string()), job)
        } else {
            // Coalesce so at most a few concurrent syncs hit one session.
            self.sync_session_executor
                .execute((slot_id % SYNC_SESSION_GROUPS, session_ip.to_string()), job)
        }
    }

    fn commit_sync_leader(
        self: &Arc<Self>,
        slot: &Slot,
        slot_table_epoch: u64,
    ) -> Result<TaskHandle, crate::task::ExecutorError> {
        let slot_id = slot.id;
        let epochs = EpochPair {
            slot_table_epoch,
            leader_epoch: slot.leader_epoch,
        };
        let manager = Arc::downgrade(self);
        let continues = move || manager.upgrade().is_some_and(|m| m.is_follower(slot_id));
        let syncer = self.leader_syncer.clone();
        let remote = Arc::clone(&self.data_remote);
        let leader = slot.leader.clone();
        let job = move || {
            match syncer.sync_leader(slot_id, &leader, remote.as_ref(), epochs, &continues) {
                Ok(finished) => finished,
                Err(err) => {
                    error!(%leader, slot_id, %err, "sync leader failed");
                    false
                }
            }
        };
        self.sync_leader_executor.execute(slot_id, job)
    }
}

#[derive(Default)]
struct SlotWork {
    migrating_start_ms: u64,
    migrating: BTreeMap<String, MigratingTask>,
    sync_sessions: BTreeMap<String, TaskHandle>,
    sync_leader: Option<TaskHandle>,
}

impl SlotWork {
    /// A new leader generation starts migration from scratch.
    fn reset(&mut self) {
        self.migrating_start_ms = 0;
        self.migrating.clear();
        self.sync_sessions.clear();
    }
}

struct MigratingTask {
    created_ms: u64,
    task: TaskHandle,
    tries: u32,
}

/// The watchdog owns all per-slot task bookkeeping; nothing else touches it.
pub struct SlotWatchdog {
    manager: Arc<SlotManager>,
    work: HashMap<u32, SlotWork>,
}

impl SlotWatchdog {
    pub fn new(manager: Arc<SlotManager>) -> Self {
        Self {
            manager,
            work: HashMap::new(),
        }
    }

    /// One watchdog pass: apply any staged table, then advance every slot.
    pub fn tick(&mut self) {
        self.process_updating();

        let manager = Arc::clone(&self.manager);
        let (table_epoch, states): (u64, Vec<SlotState>) = {
            let states = manager.states.read().expect("slot states");
            (
                states.table.epoch,
                states.slots.values().cloned().collect(),
            )
        };
        let session_interval_ms =
            manager.config.slot_leader_sync_session_interval_secs * 1000;
        let leader_interval_ms =
            manager.config.slot_follower_sync_leader_interval_secs * 1000;
        for state in states {
            let work = self.work.entry(state.slot.id).or_default();
            if state.slot.is_leader(&manager.local_ip) {
                Self::sync_as_leader(&manager, &state, work, table_epoch, session_interval_ms);
            } else {
                Self::sync_as_follower(&manager, &state, work, table_epoch, leader_interval_ms);
            }
        }
    }

    fn process_updating(&mut self) {
        let manager = Arc::clone(&self.manager);
        let Some(update) = manager.updating.lock().expect("updating slot table").take() else {
            return;
        };
        let mut states = manager.states.write().expect("slot states");
        if update.epoch <= states.table.epoch {
            warn!(
                skipped = update.epoch,
                current = states.table.epoch,
                "skip stale staged slot table"
            );
            return;
        }
        for slot in update.slots.values() {
            match states.slots.get_mut(&slot.id) {
                Some(state) => {
                    if state.slot.leader_epoch != slot.leader_epoch {
                        // New leader generation: migration starts over.
                        state.migrated.store(false, Ordering::Release);
                        self.work.entry(slot.id).or_default().reset();
                        info!(
                            slot_id = slot.id,
                            prev_epoch = state.slot.leader_epoch,
                            new_epoch = slot.leader_epoch,
                            "slot leader epoch changed"
                        );
                    }
                    state.slot = slot.clone();
                    manager.listen_add(slot);
                }
                None => {
                    states.slots.insert(slot.id, SlotState::new(slot.clone()));
                    manager.listen_add(slot);
                    info!(slot_id = slot.id, leader = %slot.leader, "add slot");
                }
            }
        }
        let gone: Vec<u32> = states
            .slots
            .keys()
            .filter(|id| !update.slots.contains_key(id))
            .copied()
            .collect();
        for slot_id in gone {
            // Remove the state first so access checks answer Moved, then
            // let listeners drop the data.
            let state = states.slots.remove(&slot_id).expect("slot state present");
            self.work.remove(&slot_id);
            manager.listen_remove(&state.slot);
            info!(slot_id, "remove slot");
        }
        states.table = update;
        debug!(
            epoch = states.table.epoch,
            leaders = states.table.leader_count(&manager.local_ip),
            followers = states.table.follower_count(&manager.local_ip),
            "slot table applied"
        );
    }

    fn sync_as_leader(
        manager: &Arc<SlotManager>,
        state: &SlotState,
        work: &mut SlotWork,
        table_epoch: u64,
        session_interval_ms: u64,
    ) {
        // A leftover follower sync must finish before session syncs start;
        // the datum merge is idempotent but the migration-finish version
        // bump needs a quiescent store.
        if let Some(task) = &work.sync_leader {
            if !task.is_finished() {
                warn!(slot_id = state.slot.id, "wait for sync-leader to finish");
                return;
            }
            work.sync_leader = None;
        }
        let sessions = manager.sessions.session_nodes();
        if state.migrated.load(Ordering::Acquire) {
            Self::sync_sessions_steady(manager, state, work, &sessions, table_epoch, session_interval_ms);
        } else {
            Self::sync_migrating(manager, state, work, &sessions, table_epoch);
            Self::check_migrating(manager, state, work, &sessions);
        }
    }

    fn sync_sessions_steady(
        manager: &Arc<SlotManager>,
        state: &SlotState,
        work: &mut SlotWork,
        sessions: &[String],
        table_epoch: u64,
        interval_ms: u64,
    ) {
        for session_ip in sessions {
            let due = work
                .sync_sessions
                .get(session_ip)
                .is_none_or(|task| task.is_over_after(interval_ms));
            if !due {
                continue;
            }
            match manager.commit_sync_session(&state.slot, table_epoch, session_ip, false) {
                Ok(task) => {
                    work.sync_sessions.insert(session_ip.clone(), task);
                }
                Err(err) => {
                    warn!(slot_id = state.slot.id, session = %session_ip, %err, "sync session not scheduled");
                }
            }
        }
        work.sync_sessions
            .retain(|session_ip, _| sessions.contains(session_ip));
    }

    fn sync_migrating(
        manager: &Arc<SlotManager>,
        state: &SlotState,
        work: &mut SlotWork,
        sessions: &[String],
        table_epoch: u64,
    ) {
        let slot = &state.slot;
        if work.migrating_start_ms == 0 {
            work.migrating_start_ms = now_ms();
            work.migrating.clear();
            info!(
                slot_id = slot.id,
                sessions = sessions.len(),
                ?sessions,
                "start migrating"
            );
        }
        for session_ip in sessions {
            let failed = match work.migrating.get(session_ip) {
                None => false,
                Some(m) if m.task.is_failed() => true,
                _ => continue,
            };
            match manager.commit_sync_session(slot, table_epoch, session_ip, true) {
                Ok(task) => match work.migrating.get_mut(session_ip) {
                    Some(m) => {
                        if failed {
                            warn!(slot_id = slot.id, session = %session_ip, tries = m.tries, "migrating sync retry");
                        }
                        m.task = task;
                        m.tries += 1;
                    }
                    None => {
                        work.migrating.insert(
                            session_ip.clone(),
                            MigratingTask {
                                created_ms: now_ms(),
                                task,
                                tries: 1,
                            },
                        );
                    }
                },
                Err(err) => {
                    warn!(slot_id = slot.id, session = %session_ip, %err, "migrating sync not scheduled");
                }
            }
        }
    }

    fn check_migrating(
        manager: &Arc<SlotManager>,
        state: &SlotState,
        work: &mut SlotWork,
        sessions: &[String],
    ) -> bool {
        let slot = &state.slot;
        let now = now_ms();
        let remains: BTreeMap<&String, u64> = work
            .migrating
            .iter()
            .filter(|(_, m)| !m.task.is_success())
            .map(|(ip, m)| (ip, now.saturating_sub(m.created_ms)))
            .collect();
        info!(
            slot_id = slot.id,
            span_ms = now.saturating_sub(work.migrating_start_ms),
            tasks = work.migrating.len(),
            sessions = sessions.len(),
            ?remains,
            "[migrating] status"
        );
        if work.migrating.is_empty() || sessions.is_empty() {
            warn!(slot_id = slot.id, "no live sessions or no migrating tasks");
            return false;
        }
        let finished = sessions.iter().all(|session_ip| {
            work.migrating
                .get(session_ip)
                .is_some_and(|m| m.task.is_success())
        });
        if !finished {
            return false;
        }
        // Force every local datum version past the old leader's before
        // accepting writes.
        let bumped = manager.storage.update_version(slot.id);
        state.migrated.store(true, Ordering::Release);
        let span_ms = now.saturating_sub(work.migrating_start_ms);
        info!(
            slot_id = slot.id,
            span_ms,
            bumped,
            sessions = sessions.len(),
            "migrating finish"
        );
        work.migrating.clear();
        true
    }

    fn sync_as_follower(
        manager: &Arc<SlotManager>,
        state: &SlotState,
        work: &mut SlotWork,
        table_epoch: u64,
        interval_ms: u64,
    ) {
        if let Some(task) = &work.sync_leader {
            if !task.is_finished() {
                if now_ms().saturating_sub(task.create_ms()) > SYNC_LEADER_SLOW_MS {
                    warn!(
                        slot_id = state.slot.id,
                        since_ms = now_ms().saturating_sub(task.create_ms()),
                        "sync-leader still running"
                    );
                }
                return;
            }
            if task.is_success() {
                state
                    .last_leader_sync_success_ms
                    .store(task.end_ms() as i64, Ordering::Release);
            }
        }
        let due = work
            .sync_leader
            .as_ref()
            .is_none_or(|task| task.is_over_after(interval_ms));
        if !due {
            return;
        }
        match manager.commit_sync_leader(&state.slot, table_epoch) {
            Ok(task) => {
                state
                    .leader_sync_start_ms
                    .store(now_ms() as i64, Ordering::Release);
                work.sync_leader = Some(task);
            }
            Err(err) => {
                warn!(slot_id = state.slot.id, %err, "sync leader not scheduled");
            }
        }
    }
}

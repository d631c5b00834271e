//! Per-subscriber push pipeline: dedup, conflict merging, one in-flight push
//! per client address, bounded retries, monotonic version bookkeeping.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::Transience;
use crate::config::SessionConfig;
use crate::core::{DataInfoId, Datum, RegisterId, Scope, StoreRecord, Subscriber, now_ms};
use crate::remoting::{PushClient, PushPayload};
use crate::task::{KeyedExecutor, LoopRunner, Wakeup, spawn_loop, wakeup_channel};

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push to {addr} failed: {reason}")]
    Client { addr: SocketAddr, reason: String },

    #[error("push to {addr} timed out")]
    Timeout { addr: SocketAddr },
}

impl PushError {
    pub fn transience(&self) -> Transience {
        match self {
            PushError::Client { .. } | PushError::Timeout { .. } => Transience::Retryable,
        }
    }
}

/// Global kill switch for outbound pushes.
#[derive(Clone)]
pub struct PushSwitch(Arc<AtomicBool>);

impl PushSwitch {
    pub fn new(stopped: bool) -> Self {
        Self(Arc::new(AtomicBool::new(stopped)))
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Merge point identity for pending pushes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    data_center: String,
    addr: SocketAddr,
    subscriber_ids: BTreeSet<RegisterId>,
}

impl fmt::Debug for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TaskKey{{{}, {}, subs={}}}",
            self.data_center,
            self.addr,
            self.subscriber_ids.len()
        )
    }
}

pub struct PushTask {
    id: u64,
    no_delay: bool,
    fetch_seq_start: u64,
    fetch_seq_end: u64,
    data_center: String,
    push_version: u64,
    datum_map: HashMap<String, Datum>,
    addr: SocketAddr,
    subscribers: HashMap<RegisterId, Arc<Subscriber>>,
    create_ms: u64,
    expire_ms: AtomicU64,
    retry_count: AtomicU32,
}

impl PushTask {
    fn key(&self) -> TaskKey {
        TaskKey {
            data_center: self.data_center.clone(),
            addr: self.addr,
            subscriber_ids: self.subscribers.keys().cloned().collect(),
        }
    }

    /// Strictly after: this task's reads began after `other`'s reads ended.
    fn after_than(&self, other: &PushTask) -> bool {
        self.fetch_seq_start > other.fetch_seq_end
    }

    fn expire_after(&self, interval_ms: u64) {
        self.expire_ms.store(now_ms() + interval_ms, Ordering::Release);
    }

    fn expire_at(&self) -> u64 {
        self.expire_ms.load(Ordering::Acquire)
    }

    fn build_payload(&self) -> PushPayload {
        // Merge the per-registerId entries; global-scope subscribers see
        // every data center, the rest only their own. The highest publisher
        // version wins on collisions.
        let global = self
            .subscribers
            .values()
            .any(|s| s.scope == Scope::Global);
        let mut merged: BTreeMap<RegisterId, (u64, Vec<bytes::Bytes>)> = BTreeMap::new();
        let mut data_info_id: Option<DataInfoId> = None;
        for (data_center, datum) in &self.datum_map {
            if !global && *data_center != self.data_center {
                continue;
            }
            data_info_id.get_or_insert_with(|| datum.data_info_id.clone());
            for entry in datum.publishers.values() {
                let candidate = (
                    entry.version,
                    entry.data_list.iter().map(|e| e.data.clone()).collect(),
                );
                match merged.get(&entry.register_id) {
                    Some((version, _)) if *version >= entry.version => {}
                    _ => {
                        merged.insert(entry.register_id.clone(), candidate);
                    }
                }
            }
        }
        let data_info_id = data_info_id.unwrap_or_else(|| {
            self.subscribers
                .values()
                .next()
                .expect("push task has at least one subscriber")
                .data_info_id()
                .clone()
        });
        PushPayload {
            data_info_id,
            version: self.push_version,
            subscribers: self.subscribers.keys().cloned().collect(),
            entries: merged.into_iter().map(|(k, (_, v))| (k, v)).collect(),
        }
    }
}

impl fmt::Debug for PushTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PushTask{{id={}, addr={}, seq=[{},{}], version={}, created={}, retries={}}}",
            self.id,
            self.addr,
            self.fetch_seq_start,
            self.fetch_seq_end,
            self.push_version,
            self.create_ms,
            self.retry_count.load(Ordering::Relaxed)
        )
    }
}

pub struct PushProcessor {
    config: Arc<SessionConfig>,
    switch: PushSwitch,
    client: Arc<dyn PushClient>,
    pending: Mutex<HashMap<TaskKey, Arc<PushTask>>>,
    pushing: Mutex<HashMap<SocketAddr, Arc<PushTask>>>,
    executor: KeyedExecutor,
    wake: Wakeup,
    wake_rx: Mutex<Option<crate::task::WakeReceiver>>,
    next_task_id: AtomicU64,
}

impl PushProcessor {
    pub fn new(
        config: Arc<SessionConfig>,
        switch: PushSwitch,
        client: Arc<dyn PushClient>,
    ) -> Arc<Self> {
        let executor = KeyedExecutor::new(
            "push",
            config.push_executor_threads,
            config.push_executor_queue,
        );
        let (wake, wake_rx) = wakeup_channel();
        Arc::new(Self {
            config,
            switch,
            client,
            pending: Mutex::new(HashMap::new()),
            pushing: Mutex::new(HashMap::new()),
            executor,
            wake,
            wake_rx: Mutex::new(Some(wake_rx)),
            next_task_id: AtomicU64::new(1),
        })
    }

    /// Spawn the pending-task watchdog. Call once.
    pub fn start(self: &Arc<Self>) -> LoopRunner {
        let rx = self
            .wake_rx
            .lock()
            .expect("push watchdog receiver")
            .take()
            .expect("push watchdog already started");
        let processor = Arc::clone(self);
        spawn_loop(
            "push-watchdog",
            Duration::from_millis(self.config.push_watchdog_interval_ms),
            rx,
            move || processor.process_pending(),
        )
    }

    /// Enqueue a push reflecting datum state read over
    /// `[fetch_seq_start, fetch_seq_end]`.
    #[allow(clippy::too_many_arguments)]
    pub fn fire_push(
        self: &Arc<Self>,
        no_delay: bool,
        push_version: u64,
        data_center: &str,
        addr: SocketAddr,
        subscribers: HashMap<RegisterId, Arc<Subscriber>>,
        datum_map: HashMap<String, Datum>,
        fetch_seq_start: u64,
        fetch_seq_end: u64,
    ) {
        if subscribers.is_empty() {
            return;
        }
        let task = Arc::new(PushTask {
            id: self.next_task_id.fetch_add(1, Ordering::Relaxed),
            no_delay,
            fetch_seq_start,
            fetch_seq_end,
            data_center: data_center.to_string(),
            push_version,
            datum_map,
            addr,
            subscribers,
            create_ms: now_ms(),
            expire_ms: AtomicU64::new(0),
            retry_count: AtomicU32::new(0),
        });
        task.expire_after(self.config.push_task_expire_ms);
        self.fire_task(task);
    }

    fn fire_task(self: &Arc<Self>, task: Arc<PushTask>) {
        let key = task.key();
        let accepted = {
            let mut pending = self.pending.lock().expect("pending tasks");
            let accepted = match pending.get(&key) {
                None => true,
                Some(prev) if task.after_than(prev) => {
                    // Inherit the previous deadline so a stream of fast
                    // replacements cannot defer delivery forever.
                    task.expire_ms.store(prev.expire_at(), Ordering::Release);
                    true
                }
                Some(prev) => {
                    info!(
                        "[ConflictMerge] {:?}, prev {} >= {}",
                        key, prev.fetch_seq_end, task.fetch_seq_start
                    );
                    false
                }
            };
            if accepted {
                pending.insert(key, Arc::clone(&task));
            }
            accepted
        };
        if accepted && task.no_delay {
            self.wake.wakeup();
        }
    }

    /// One watchdog pass: drain committable tasks into the per-address
    /// executor. Public so tests can drive it deterministically.
    pub fn process_pending(self: &Arc<Self>) {
        let due = self.drain_due();
        if self.switch.is_stopped() {
            return;
        }
        if due.is_empty() {
            return;
        }
        debug!(count = due.len(), "process push tasks");
        for task in due {
            self.commit_task(task);
        }
    }

    fn drain_due(&self) -> Vec<Arc<PushTask>> {
        let now = now_ms();
        let mut pending = self.pending.lock().expect("pending tasks");
        let due: Vec<TaskKey> = pending
            .iter()
            .filter(|(_, task)| task.no_delay || task.expire_at() <= now)
            .map(|(key, _)| key.clone())
            .collect();
        due.into_iter()
            .filter_map(|key| pending.remove(&key))
            .collect()
    }

    fn commit_task(self: &Arc<Self>, task: Arc<PushTask>) {
        let processor = Arc::clone(self);
        let addr = task.addr;
        let run = Arc::clone(&task);
        if let Err(err) = self.executor.execute(addr, move || {
            processor.run_task(run);
            true
        }) {
            error!(?task, %err, "failed to submit push task");
        }
    }

    fn run_task(self: &Arc<Self>, task: Arc<PushTask>) {
        if self.switch.is_stopped() {
            return;
        }
        if !self.check_pushing(&task) {
            return;
        }
        let payload = task.build_payload();
        self.pushing
            .lock()
            .expect("pushing tasks")
            .insert(task.addr, Arc::clone(&task));

        let processor = Arc::clone(self);
        let callback_task = Arc::clone(&task);
        info!(
            data_info_id = %payload.data_info_id,
            subscribers = payload.subscribers.len(),
            addr = %task.addr,
            "pushing"
        );
        self.client.push(
            task.addr,
            payload,
            Box::new(move |result| match result {
                Ok(()) => processor.on_push_success(callback_task),
                Err(err) => processor.on_push_error(callback_task, err),
            }),
        );
    }

    /// Gate before the wire call: nothing may be in flight to this address,
    /// and every subscriber must still consent to the fetch range.
    fn check_pushing(self: &Arc<Self>, task: &Arc<PushTask>) -> bool {
        let prev = self
            .pushing
            .lock()
            .expect("pushing tasks")
            .get(&task.addr)
            .cloned();
        match prev {
            None => {
                for subscriber in task.subscribers.values() {
                    if !subscriber.check_version(&task.data_center, task.fetch_seq_start) {
                        warn!(
                            register_id = %subscriber.register_id(),
                            ?task,
                            "conflict push, subscriber advanced past"
                        );
                        return false;
                    }
                }
                true
            }
            Some(prev) => {
                if !task.after_than(&prev) {
                    warn!(prev = ?prev, now = ?task, "prev push is newer, drop");
                    return false;
                }
                // Strictly-after task while one is in flight: requeue and
                // let the watchdog pick it up once the callback lands.
                self.retry(Arc::clone(task), "waiting");
                false
            }
        }
    }

    fn retry(self: &Arc<Self>, task: Arc<PushTask>, reason: &str) -> bool {
        let attempts = task.retry_count.fetch_add(1, Ordering::AcqRel) + 1;
        if attempts <= self.config.push_retry_max {
            task.expire_after(self.config.push_task_expire_ms);
            info!(?task, reason, "add retry");
            self.fire_task(task);
            true
        } else {
            info!(?task, reason, "skip retry, attempts exhausted");
            false
        }
    }

    fn on_push_success(self: &Arc<Self>, task: Arc<PushTask>) {
        let datum_versions: HashMap<String, u64> = task
            .datum_map
            .iter()
            .map(|(dc, datum)| (dc.clone(), datum.version))
            .collect();
        for subscriber in task.subscribers.values() {
            let updated = subscriber.check_and_update_version(
                &task.data_center,
                task.push_version,
                &datum_versions,
                task.fetch_seq_start,
                task.fetch_seq_end,
            );
            if !updated {
                warn!(
                    register_id = %subscriber.register_id(),
                    ?task,
                    "push success, but version not updated"
                );
            }
        }
        let cleaned = self.remove_pushing_if_current(&task);
        info!(cleaned, ?task, "push success");
    }

    fn on_push_error(self: &Arc<Self>, task: Arc<PushTask>, err: PushError) {
        let cleaned = self.remove_pushing_if_current(&task);
        error!(cleaned, ?task, %err, "push error");
        self.retry(task, "callbackErr");
    }

    /// Compare-and-remove: the callback must never evict a successor task.
    fn remove_pushing_if_current(&self, task: &Arc<PushTask>) -> bool {
        let mut pushing = self.pushing.lock().expect("pushing tasks");
        match pushing.get(&task.addr) {
            Some(current) if current.id == task.id => {
                pushing.remove(&task.addr);
                true
            }
            _ => false,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending tasks").len()
    }

    pub fn pushing_len(&self) -> usize {
        self.pushing.lock().expect("pushing tasks").len()
    }
}

//! Push pipeline wired end to end inside the session tier: stores, fire
//! service, processor, and a fake client transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use registrar::config::SessionConfig;
use registrar::core::{DataEntry, DataInfoId, Datum, DatumEntry, RegisterId, Registration, Scope};
use registrar::data::SyncError;
use registrar::remoting::{DatumReader, PushClient, PushCompletion, PushPayload};
use registrar::session::{FirePushService, PushProcessor, PushSwitch, SessionInterests};
use registrar::Subscriber;

/// Completes every push successfully, recording payloads per address.
#[derive(Default)]
struct AckingClient {
    pushes: Mutex<Vec<(SocketAddr, PushPayload)>>,
}

impl PushClient for AckingClient {
    fn push(&self, addr: SocketAddr, payload: PushPayload, done: PushCompletion) {
        self.pushes.lock().unwrap().push((addr, payload));
        done(Ok(()));
    }
}

#[derive(Default)]
struct MapReader {
    datums: Mutex<HashMap<DataInfoId, Datum>>,
}

impl DatumReader for MapReader {
    fn fetch(
        &self,
        _data_center: &str,
        data_info_id: &DataInfoId,
    ) -> Result<Option<Datum>, SyncError> {
        Ok(self.datums.lock().unwrap().get(data_info_id).cloned())
    }
}

fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn data_info_id() -> DataInfoId {
    DataInfoId::new("com.example.Echo", "instance2", "rpc").unwrap()
}

fn subscriber(register_id: &str, source: &str) -> Subscriber {
    Subscriber::new(
        Registration {
            data_info_id: data_info_id(),
            register_id: RegisterId::new(register_id).unwrap(),
            version: 1,
            register_timestamp: 1,
            source_address: source.parse().unwrap(),
            target_address: "2.2.2.2:9600".parse().unwrap(),
            app_name: None,
            client_id: None,
        },
        Scope::DataCenter,
    )
}

fn datum(version: u64) -> Datum {
    let mut datum = Datum::new("DefaultDataCenter", data_info_id());
    datum.merge_entry(DatumEntry {
        register_id: RegisterId::new("pub-1").unwrap(),
        version: 1,
        register_timestamp: 1,
        source_address: "10.0.0.1:7000".parse().unwrap(),
        data_list: vec![DataEntry::new(&b"service-url"[..])],
    });
    datum.version = version;
    datum
}

struct Pipeline {
    interests: Arc<SessionInterests>,
    reader: Arc<MapReader>,
    client: Arc<AckingClient>,
    processor: Arc<PushProcessor>,
    fire: Arc<FirePushService>,
}

fn pipeline() -> Pipeline {
    let config = Arc::new(SessionConfig::default());
    let interests = Arc::new(SessionInterests::new());
    let reader = Arc::new(MapReader::default());
    let client = Arc::new(AckingClient::default());
    let processor = PushProcessor::new(
        Arc::clone(&config),
        PushSwitch::new(false),
        Arc::clone(&client) as Arc<dyn PushClient>,
    );
    let fire = FirePushService::new(
        config,
        Arc::clone(&interests),
        Arc::clone(&reader) as Arc<dyn DatumReader>,
        Arc::clone(&processor),
        Arc::clone(&client) as Arc<dyn PushClient>,
    );
    Pipeline {
        interests,
        reader,
        client,
        processor,
        fire,
    }
}

#[test]
fn register_triggers_initial_push_and_version_bookkeeping() {
    let p = pipeline();
    p.reader
        .datums
        .lock()
        .unwrap()
        .insert(data_info_id(), datum(100));

    let subscriber = Arc::new(subscriber("S1", "1.1.1.1:12345"));
    p.interests.add(Arc::clone(&subscriber));
    p.fire.fire_on_register(Arc::clone(&subscriber));

    p.processor.process_pending();
    wait_until(|| p.client.pushes.lock().unwrap().len() == 1);
    wait_until(|| p.processor.pushing_len() == 0);

    let pushes = p.client.pushes.lock().unwrap();
    let (addr, payload) = &pushes[0];
    assert_eq!(*addr, "1.1.1.1:12345".parse().unwrap());
    assert_eq!(payload.version, 100);
    assert_eq!(payload.entries.len(), 1);
    drop(pushes);

    assert_eq!(subscriber.accepted_version("DefaultDataCenter"), 100);
    assert!(!subscriber.needs_push("DefaultDataCenter", 100));
    assert!(subscriber.needs_push("DefaultDataCenter", 101));
}

#[test]
fn change_fans_out_per_client_address() {
    let p = pipeline();
    p.reader
        .datums
        .lock()
        .unwrap()
        .insert(data_info_id(), datum(50));

    let near = Arc::new(subscriber("S1", "1.1.1.1:12345"));
    let also_near = Arc::new(subscriber("S2", "1.1.1.1:12345"));
    let far = Arc::new(subscriber("S3", "1.1.1.2:12345"));
    for s in [&near, &also_near, &far] {
        p.interests.add(Arc::clone(s));
    }

    p.fire
        .fire_on_change("DefaultDataCenter", &data_info_id(), 50);
    // Change pushes are delayed; force the deadline past.
    std::thread::sleep(Duration::from_millis(
        SessionConfig::default().push_task_expire_ms + 50,
    ));
    p.processor.process_pending();
    wait_until(|| p.client.pushes.lock().unwrap().len() == 2);
    wait_until(|| p.processor.pushing_len() == 0);

    let pushes = p.client.pushes.lock().unwrap();
    let mut addrs: Vec<SocketAddr> = pushes.iter().map(|(addr, _)| *addr).collect();
    addrs.sort();
    assert_eq!(
        addrs,
        vec![
            "1.1.1.1:12345".parse().unwrap(),
            "1.1.1.2:12345".parse().unwrap()
        ]
    );
    // The two same-address subscribers ride one push.
    let grouped = pushes
        .iter()
        .find(|(addr, _)| *addr == "1.1.1.1:12345".parse().unwrap())
        .unwrap();
    assert_eq!(grouped.1.subscribers.len(), 2);
    drop(pushes);

    for s in [&near, &also_near, &far] {
        assert_eq!(s.accepted_version("DefaultDataCenter"), 50);
    }

    // Re-announcing the same version finds nobody to push to.
    p.fire
        .fire_on_change("DefaultDataCenter", &data_info_id(), 50);
    assert_eq!(p.processor.pending_len(), 0);
}

#[test]
fn absent_datum_pushes_empty_list() {
    let p = pipeline();
    let subscriber = Arc::new(subscriber("S1", "1.1.1.1:12345"));
    p.interests.add(Arc::clone(&subscriber));
    p.fire.fire_on_register(Arc::clone(&subscriber));

    p.processor.process_pending();
    wait_until(|| p.client.pushes.lock().unwrap().len() == 1);

    let pushes = p.client.pushes.lock().unwrap();
    assert_eq!(pushes[0].1.version, 0);
    assert!(pushes[0].1.entries.is_empty());
}

#[test]
fn stopped_switch_suppresses_register_push() {
    let config = Arc::new(SessionConfig::default());
    let interests = Arc::new(SessionInterests::new());
    let reader = Arc::new(MapReader::default());
    let client = Arc::new(AckingClient::default());
    let switch = PushSwitch::new(true);
    let processor = PushProcessor::new(
        Arc::clone(&config),
        switch.clone(),
        Arc::clone(&client) as Arc<dyn PushClient>,
    );
    let fire = FirePushService::new(
        config,
        Arc::clone(&interests),
        Arc::clone(&reader) as Arc<dyn DatumReader>,
        Arc::clone(&processor),
        Arc::clone(&client) as Arc<dyn PushClient>,
    );

    let subscriber = Arc::new(subscriber("S1", "1.1.1.1:12345"));
    interests.add(Arc::clone(&subscriber));
    fire.fire_on_register(Arc::clone(&subscriber));
    processor.process_pending();
    std::thread::sleep(Duration::from_millis(20));
    assert!(client.pushes.lock().unwrap().is_empty());

    // After resuming, the next register-time push flows.
    switch.resume();
    fire.fire_on_register(Arc::clone(&subscriber));
    processor.process_pending();
    wait_until(|| client.pushes.lock().unwrap().len() == 1);
}

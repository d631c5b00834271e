//! Registration store scenarios spanning reconnects and delayed deletes.

use std::sync::Arc;

use registrar::core::{ConnectId, DataInfoId, RegisterId, Registration, Scope, StoreRecord};
use registrar::session::{SessionDataStore, SessionInterests};
use registrar::{Publisher, Subscriber};

fn registration(
    data_info_id: &str,
    register_id: &str,
    source: &str,
    version: u64,
    timestamp: u64,
) -> Registration {
    Registration {
        data_info_id: DataInfoId::new(data_info_id, "instance2", "rpc").unwrap(),
        register_id: RegisterId::new(register_id).unwrap(),
        version,
        register_timestamp: timestamp,
        source_address: source.parse().unwrap(),
        target_address: "2.2.2.2:9600".parse().unwrap(),
        app_name: Some("app".to_string()),
        client_id: None,
    }
}

fn connect(s: &str) -> ConnectId {
    ConnectId::parse(s).unwrap()
}

/// Cross-check the two indexes through the public API: every record found
/// by connection must be the resident record on its dataInfoId, and every
/// resident record must be reachable through its connection.
fn assert_indices_agree(store: &SessionInterests, connects: &[ConnectId], ids: &[DataInfoId]) {
    for connect_id in connects {
        for (register_id, record) in store.query_by_connect_id(connect_id) {
            assert_eq!(record.connect_id(), *connect_id);
            let resident = store
                .get(record.data_info_id(), &register_id)
                .expect("connect-index entry must be resident");
            assert_eq!(resident.connect_id(), *connect_id);
        }
    }
    for data_info_id in ids {
        for record in store.get_datas(data_info_id) {
            let by_connect = store.query_by_connect_id(&record.connect_id());
            assert!(by_connect.contains_key(record.register_id()));
        }
    }
}

#[test]
fn overwrite_via_reconnect() {
    let store = SessionDataStore::new();
    let publisher = |source: &str, version, timestamp| Publisher {
        registration: registration("dataId1", "P1", source, version, timestamp),
        data_list: vec![],
    };
    store.add(publisher("1.1.1.1:12345", 1, 1000));
    store.add(publisher("1.1.1.1:12346", 2, 2000));

    assert!(
        store
            .query_by_connect_id(&connect("1.1.1.1:12345_2.2.2.2:9600"))
            .is_empty()
    );
    assert_eq!(
        store
            .query_by_connect_id(&connect("1.1.1.1:12346_2.2.2.2:9600"))
            .len(),
        1
    );
}

#[test]
fn delayed_delete_keeps_replacement() {
    let store = SessionInterests::new();
    let subscriber = |source: &str, version, timestamp| {
        Subscriber::new(
            registration("dataId1", "S1", source, version, timestamp),
            Scope::DataCenter,
        )
    };
    let c1 = connect("1.1.1.1:12345_2.2.2.2:9600");
    let c2 = connect("1.1.1.1:12346_2.2.2.2:9600");

    store.add(subscriber("1.1.1.1:12345", 1, 1000));
    store.add(subscriber("1.1.1.1:12346", 2, 2000));
    // The disconnect of C1 lands after C2 already took over the register id.
    store.delete_by_connect_id(&c1);

    assert!(store.query_by_connect_id(&c1).is_empty());
    assert_eq!(store.query_by_connect_id(&c2).len(), 1);

    let data_info_id = DataInfoId::new("dataId1", "instance2", "rpc").unwrap();
    let datas = store.get_datas(&data_info_id);
    assert_eq!(datas.len(), 1);
    assert_eq!(datas[0].connect_id(), c2);
}

#[test]
fn mixed_workload_keeps_indices_agreeing() {
    let store = SessionInterests::new();
    let sources = ["1.1.1.1:12345", "1.1.1.1:12346", "1.1.1.1:12347"];
    let data_ids = ["alpha", "beta", "gamma"];

    let connects: Vec<ConnectId> = sources
        .iter()
        .map(|s| connect(&format!("{s}_2.2.2.2:9600")))
        .collect();
    let ids: Vec<DataInfoId> = data_ids
        .iter()
        .map(|d| DataInfoId::new(*d, "instance2", "rpc").unwrap())
        .collect();

    // Interleave adds, replacements across connections, targeted deletes
    // and whole-connection sweeps; the two indexes must agree throughout.
    for round in 0u64..6 {
        for (i, data_id) in data_ids.iter().enumerate() {
            for r in 0..4 {
                let source = sources[(round as usize + r + i) % sources.len()];
                store.add(Subscriber::new(
                    registration(
                        data_id,
                        &format!("reg-{i}-{r}"),
                        source,
                        round + 1,
                        1000 + round,
                    ),
                    Scope::Zone,
                ));
            }
        }
        assert_indices_agree(&store, &connects, &ids);

        let victim = &connects[round as usize % connects.len()];
        store.delete_by_connect_id(victim);
        // Idempotent: a second sweep changes nothing.
        assert_eq!(store.delete_by_connect_id(victim), 0);
        assert!(store.query_by_connect_id(victim).is_empty());
        assert_indices_agree(&store, &connects, &ids);

        store.delete_by_id(&RegisterId::new("reg-0-0").unwrap(), &ids[0]);
        assert_indices_agree(&store, &connects, &ids);
    }
}

#[test]
fn stale_add_never_resurrects() {
    let store = SessionInterests::new();
    store.add(Subscriber::new(
        registration("dataId1", "S1", "1.1.1.1:12346", 5, 2000),
        Scope::Global,
    ));

    // Both orderings of staleness are refused from a different connection.
    assert!(!store.add(Subscriber::new(
        registration("dataId1", "S1", "1.1.1.1:12345", 9, 1999),
        Scope::Global,
    )));
    assert!(!store.add(Subscriber::new(
        registration("dataId1", "S1", "1.1.1.1:12345", 4, 2001),
        Scope::Global,
    )));
    // Not-older timestamp and not-smaller version wins.
    assert!(store.add(Subscriber::new(
        registration("dataId1", "S1", "1.1.1.1:12345", 5, 2000),
        Scope::Global,
    )));

    let survivors = store.query_by_connect_id(&connect("1.1.1.1:12345_2.2.2.2:9600"));
    assert_eq!(survivors.len(), 1);
}

#[test]
fn shared_subscriber_state_survives_store_replacement_reads() {
    // The store and a push task share the same subscriber object.
    let store = SessionInterests::new();
    let subscriber = Arc::new(Subscriber::new(
        registration("dataId1", "S1", "1.1.1.1:12345", 1, 1000),
        Scope::DataCenter,
    ));
    store.add(Arc::clone(&subscriber));

    let held = store
        .get_datas(&DataInfoId::new("dataId1", "instance2", "rpc").unwrap())
        .pop()
        .unwrap();
    assert!(Arc::ptr_eq(&held, &subscriber));
}

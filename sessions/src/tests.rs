// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;
use std::time::Duration;

use bus::{EventBus, EventData};
use cache::SnapshotCache;
use history::HistoryStore;
use identity::{InstanceId, SessionId};
use lease::{LeaseConfig, LeaseManager};
use options::Config;
use poller::{Poller, PollerDeps};
use store::Store;
use task_executor::Executor;
use testutil::{MemStore, MockUpstream};
use upstream::{SessionInfo, UpstreamClient};

use crate::{Session, SessionManager, SessionManagerDeps, SessionRegistry, Stage, UpstreamClientFactory};

struct MockFactory {
    mock: MockUpstream,
}

impl UpstreamClientFactory for MockFactory {
    fn client_for(&self, _session: &Session) -> Arc<dyn UpstreamClient> {
        Arc::new(self.mock.clone())
    }
}

struct Fixture {
    mock: MockUpstream,
    manager: SessionManager,
    lease: LeaseManager,
    bus: EventBus,
    cache: SnapshotCache,
    history: HistoryStore,
}

fn fixture(mem: &MemStore, instance: &str) -> Fixture {
    let store = Store::new(Arc::new(mem.clone()), Duration::from_secs(2));
    let config = Arc::new(Config::default());
    let registry = SessionRegistry::new(store.clone());
    let bus = EventBus::new(store.clone(), InstanceId::new(instance), config.subscriber_queue_size);
    let cache = SnapshotCache::new();
    let history = HistoryStore::new(store.clone(), config.history_chunk_size, config.history_max_chunks);
    let lease = LeaseManager::new(
        store,
        InstanceId::new(instance),
        LeaseConfig {
            lease_ttl: config.lease_ttl,
            renewal_interval: config.lease_renewal_interval,
            heartbeat_ttl: config.heartbeat_ttl,
            heartbeat_interval: config.heartbeat_interval,
            node_discovery_interval: config.node_discovery_interval,
        },
        Arc::new(registry.clone()),
    );
    let mock = MockUpstream::new();
    let manager = SessionManager::new(
        Executor::new(),
        SessionManagerDeps {
            registry,
            lease: lease.clone(),
            bus: bus.clone(),
            cache: cache.clone(),
            history: history.clone(),
            clients: Arc::new(MockFactory { mock: mock.clone() }),
            config,
        },
    );
    Fixture {
        mock,
        manager,
        lease,
        bus,
        cache,
        history,
    }
}

async fn bootstrap_membership(fixtures: &[&Fixture]) {
    for f in fixtures {
        f.lease.heartbeat_once().await.unwrap();
    }
    for f in fixtures {
        f.lease.discover_once().await.unwrap();
    }
}

fn s1() -> SessionId {
    SessionId::new("s1")
}

#[tokio::test]
async fn sessions_persist_across_restarts() {
    let mem = MemStore::new();
    let fixture = fixture(&mem, "x");
    fixture
        .manager
        .create_session(s1(), "factory one", Some("10.0.0.1:8080".to_owned()))
        .await
        .unwrap();

    // A fresh registry over the same store sees the session after load.
    let registry = SessionRegistry::new(Store::new(Arc::new(mem.clone()), Duration::from_secs(2)));
    registry.load().await.unwrap();
    let loaded = registry.get(&s1()).unwrap();
    assert_eq!(loaded.name, "factory one");
    assert_eq!(loaded.stage, Stage::Created);
    assert!(!loaded.synthetic);
}

#[tokio::test]
async fn reconciliation_acquires_and_spawns_a_poller() {
    let mem = MemStore::new();
    let fixture = fixture(&mem, "x");
    bootstrap_membership(&[&fixture]).await;
    fixture.manager.create_session(s1(), "one", None).await.unwrap();

    fixture.manager.reconcile_once().await;

    assert!(fixture.lease.is_owned(&s1()));
    assert!(fixture.manager.has_poller(&s1()));

    // A second pass is a no-op, not a second poller.
    fixture.manager.reconcile_once().await;
    assert!(fixture.manager.has_poller(&s1()));
}

#[tokio::test]
async fn empty_live_set_means_no_acquisitions() {
    let mem = MemStore::new();
    let fixture = fixture(&mem, "x");
    // No membership bootstrap: nothing is known to be alive.
    fixture.manager.create_session(s1(), "one", None).await.unwrap();

    fixture.manager.reconcile_once().await;

    assert!(!fixture.lease.is_owned(&s1()));
    assert!(!fixture.manager.has_poller(&s1()));
    assert!(mem.keys().iter().all(|k| !k.starts_with("lease:")));
}

#[tokio::test]
async fn pause_stops_the_poller_and_releases_the_lease() {
    let mem = MemStore::new();
    let fixture = fixture(&mem, "x");
    bootstrap_membership(&[&fixture]).await;
    fixture.manager.create_session(s1(), "one", None).await.unwrap();
    fixture.manager.reconcile_once().await;
    assert!(fixture.manager.has_poller(&s1()));

    fixture.manager.pause_session(&s1()).await.unwrap();
    fixture.manager.reconcile_once().await;

    assert!(!fixture.manager.has_poller(&s1()));
    assert!(!fixture.lease.is_owned(&s1()));
    assert!(mem.keys().iter().all(|k| !k.starts_with("lease:")));
    assert!(fixture.manager.session(&s1()).unwrap().is_paused);

    // Resume: the next pass re-acquires and repolls.
    fixture.manager.resume_session(&s1()).await.unwrap();
    fixture.manager.reconcile_once().await;
    assert!(fixture.manager.has_poller(&s1()));
    assert!(fixture.lease.is_owned(&s1()));
}

#[tokio::test]
async fn ownership_follows_the_preferred_owner() {
    let mem = MemStore::new();
    let x = fixture(&mem, "alpha");
    let y = fixture(&mem, "beta");
    bootstrap_membership(&[&x, &y]).await;

    x.manager.create_session(s1(), "one", None).await.unwrap();
    y.manager.registry().load().await.unwrap();

    x.manager.reconcile_once().await;
    y.manager.reconcile_once().await;

    // Exactly one instance owns and polls the session, and it is the preferred one.
    let preferred = x.lease.preferred_owner(&s1()).unwrap();
    assert_eq!(preferred, y.lease.preferred_owner(&s1()).unwrap());
    let (winner, loser) = if preferred == InstanceId::new("alpha") {
        (&x, &y)
    } else {
        (&y, &x)
    };
    assert!(winner.manager.has_poller(&s1()));
    assert!(!loser.manager.has_poller(&s1()));

    // The preferred owner goes away: marker dropped, leases released.
    winner.lease.release_all().await;
    store::KeyValue::delete(&mem, &format!("node:{preferred}"))
        .await
        .unwrap();
    loser.lease.discover_once().await.unwrap();
    loser.manager.reconcile_once().await;

    assert!(loser.manager.has_poller(&s1()));
    assert!(loser.lease.is_owned(&s1()));
}

#[tokio::test]
async fn non_preferred_owner_yields_voluntarily() {
    let mem = MemStore::new();
    let x = fixture(&mem, "alpha");
    let y = fixture(&mem, "beta");

    // x starts alone, owns the session.
    bootstrap_membership(&[&x]).await;
    x.manager.create_session(s1(), "one", None).await.unwrap();
    x.manager.reconcile_once().await;
    assert!(x.manager.has_poller(&s1()));

    // y joins; if the rendezvous prefers y, x must yield on its next pass.
    bootstrap_membership(&[&x, &y]).await;
    y.manager.registry().load().await.unwrap();
    let preferred = x.lease.preferred_owner(&s1()).unwrap();

    x.manager.reconcile_once().await;
    y.manager.reconcile_once().await;
    if preferred == InstanceId::new("beta") {
        assert!(!x.manager.has_poller(&s1()));
        assert!(y.manager.has_poller(&s1()));
    } else {
        // The session already sat with its preferred owner; nothing moved.
        assert!(x.manager.has_poller(&s1()));
        assert!(!y.manager.has_poller(&s1()));
    }
}

#[tokio::test]
async fn stage_machine_walks_created_validating_ready() {
    let mem = MemStore::new();
    let fixture = fixture(&mem, "x");
    bootstrap_membership(&[&fixture]).await;
    fixture.manager.create_session(s1(), "one", None).await.unwrap();
    assert_eq!(fixture.manager.session(&s1()).unwrap().stage, Stage::Created);

    // Drive a hand-built poller through the manager's own hooks.
    assert!(fixture.lease.try_acquire(&s1()).await.unwrap());
    fixture.mock.set_session_info(SessionInfo {
        session_name: "Save_A".to_owned(),
        passed_real_seconds: 10,
    });
    let poller = Poller::new(
        s1(),
        PollerDeps {
            client: Arc::new(fixture.mock.clone()),
            cache: fixture.cache.clone(),
            history: fixture.history.clone(),
            bus: fixture.bus.clone(),
            lease: fixture.lease.clone(),
            pause_view: Arc::new(fixture.manager.registry().clone()),
            hooks: fixture.manager.poller_hooks(),
            config: Arc::new(Config::default()),
        },
    );

    poller.probe_session_info().await;
    let session = fixture.manager.session(&s1()).unwrap();
    assert_eq!(session.stage, Stage::Validating);
    assert_eq!(session.session_name.as_deref(), Some("Save_A"));
    assert_eq!(session.passed_real_seconds, 10);
    assert!(session.is_online);

    // One fast tick satisfies the default critical set.
    poller.poll_group(upstream::CadenceGroup::Fast).await;
    assert_eq!(fixture.manager.session(&s1()).unwrap().stage, Stage::Ready);
}

#[tokio::test]
async fn delete_session_tears_everything_down() {
    let mem = MemStore::new();
    let fixture = fixture(&mem, "x");
    bootstrap_membership(&[&fixture]).await;
    fixture.manager.create_session(s1(), "one", None).await.unwrap();
    fixture.manager.reconcile_once().await;

    let mut subscription = fixture.bus.subscribe(s1());
    fixture.manager.delete_session(&s1()).await.unwrap();

    assert!(!fixture.manager.has_poller(&s1()));
    assert!(fixture.manager.session(&s1()).is_none());
    assert!(fixture.manager.get_cached(&s1()).is_empty());
    assert!(!fixture.lease.is_owned(&s1()));
    assert!(mem.keys().iter().all(|k| !k.starts_with("session:") && !k.starts_with("lease:")));

    // Streams observe the terminal signal.
    loop {
        match subscription.recv().await {
            Some(event) if event.data == EventData::SessionDeleted => break,
            Some(_) => {}
            None => panic!("subscription closed without SessionDeleted"),
        }
    }
}

#[tokio::test]
async fn sessions_created_elsewhere_are_reconciled_here() {
    let mem = MemStore::new();
    let fixture = fixture(&mem, "x");
    bootstrap_membership(&[&fixture]).await;

    // Another instance's control surface writes the record; this instance has never heard
    // of it. The next reconciliation pass re-reads the table and takes the session over.
    let elsewhere = SessionRegistry::new(Store::new(Arc::new(mem.clone()), Duration::from_secs(2)));
    elsewhere
        .insert(Session::new(s1(), "made elsewhere", None))
        .await
        .unwrap();

    fixture.manager.reconcile_once().await;
    assert!(fixture.manager.session(&s1()).is_some());
    assert!(fixture.manager.has_poller(&s1()));

    // Deleting the record elsewhere stops the poller here on the following pass.
    elsewhere.delete(&s1()).await.unwrap();
    fixture.manager.reconcile_once().await;
    assert!(!fixture.manager.has_poller(&s1()));
}

#[tokio::test]
async fn cache_follows_events_for_sessions_owned_elsewhere() {
    let mem = MemStore::new();
    let fixture = fixture(&mem, "x");
    fixture.manager.create_session(s1(), "one", None).await.unwrap();

    // A snapshot produced by the owning instance arrives through the relay. Dispatching it
    // on this bus is what the relay task does with a remote frame.
    fixture
        .bus
        .publish(bus::Event {
            session_id: s1(),
            data: EventData::Snapshot {
                data_type: upstream::DataType::Trains,
                payload: serde_json::json!([{ "name": "T-1" }]),
            },
        })
        .await;
    assert_eq!(
        fixture.manager.get_cached(&s1())[&upstream::DataType::Trains],
        serde_json::json!([{ "name": "T-1" }])
    );

    // A save change on the owner resets the follower's view too.
    fixture
        .bus
        .publish(bus::Event {
            session_id: s1(),
            data: EventData::SaveChanged {
                save_name: "Save_B".to_owned(),
            },
        })
        .await;
    assert!(fixture.manager.get_cached(&s1()).is_empty());
}

#[tokio::test]
async fn stage_never_regresses() {
    let mut session = Session::new(s1(), "one", None);
    assert!(session.advance_stage(Stage::Validating));
    assert!(session.advance_stage(Stage::Ready));
    assert!(!session.advance_stage(Stage::Validating));
    assert!(!session.advance_stage(Stage::Created));
    assert_eq!(session.stage, Stage::Ready);
}

#[tokio::test]
async fn session_record_round_trips_in_camel_case() {
    let session = Session::new(s1(), "one", Some("10.0.0.1:8080".to_owned()));
    let value = serde_json::to_value(&session).unwrap();
    assert_eq!(value["isPaused"], serde_json::json!(false));
    assert_eq!(value["passedRealSeconds"], serde_json::json!(0));
    assert_eq!(value["stage"], serde_json::json!("created"));
    let back: Session = serde_json::from_value(value).unwrap();
    assert_eq!(back, session);
}

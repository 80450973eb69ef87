// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! End-to-end scenarios across manager, poller, cache, history and stream, over the
//! in-memory store. Ticks are driven by hand so every assertion is deterministic.

use std::sync::Arc;
use std::time::Duration;

use async_latch::AsyncLatch;
use bus::EventBus;
use cache::SnapshotCache;
use futures::StreamExt;
use history::HistoryStore;
use identity::{InstanceId, SessionId};
use lease::{LeaseConfig, LeaseManager};
use options::Config;
use poller::{Poller, PollerDeps};
use serde_json::json;
use sessions::{Session, SessionManager, SessionManagerDeps, SessionRegistry, Stage, UpstreamClientFactory};
use store::Store;
use testutil::{MemStore, MockUpstream};
use upstream::{CadenceGroup, DataType, SessionInfo, UpstreamClient};

use crate::MessageKind;

struct MockFactory {
    mock: MockUpstream,
}

impl UpstreamClientFactory for MockFactory {
    fn client_for(&self, _session: &Session) -> Arc<dyn UpstreamClient> {
        Arc::new(self.mock.clone())
    }
}

struct World {
    mock: MockUpstream,
    manager: SessionManager,
    lease: LeaseManager,
    registry: SessionRegistry,
    cache: SnapshotCache,
    bus: EventBus,
    store: Store,
    config: Arc<Config>,
    session_id: SessionId,
}

impl World {
    async fn new() -> World {
        let world = World::over(&MemStore::new(), "x").await;
        world
            .manager
            .create_session(world.session_id.clone(), "factory one", None)
            .await
            .unwrap();
        world
    }

    /// One instance's full wiring over a (possibly shared) backing store.
    async fn over(mem: &MemStore, instance: &str) -> World {
        let store = Store::new(Arc::new(mem.clone()), Duration::from_secs(2));
        let config = Arc::new(Config::default());
        let registry = SessionRegistry::new(store.clone());
        let bus = EventBus::new(
            store.clone(),
            InstanceId::new(instance),
            config.subscriber_queue_size,
        );
        let cache = SnapshotCache::new();
        let history =
            HistoryStore::new(store.clone(), config.history_chunk_size, config.history_max_chunks);
        let lease = LeaseManager::new(
            store.clone(),
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
            task_executor::Executor::new(),
            SessionManagerDeps {
                registry: registry.clone(),
                lease: lease.clone(),
                bus: bus.clone(),
                cache: cache.clone(),
                history: history.clone(),
                clients: Arc::new(MockFactory { mock: mock.clone() }),
                config: config.clone(),
            },
        );
        lease.heartbeat_once().await.unwrap();
        lease.discover_once().await.unwrap();

        let session_id = SessionId::new("s1");
        World {
            mock,
            manager,
            lease,
            registry,
            cache,
            bus,
            store,
            config,
            session_id,
        }
    }

    /// A poller wired exactly like the manager's own, but driven by hand.
    fn hand_poller(&self) -> Poller {
        Poller::new(
            self.session_id.clone(),
            PollerDeps {
                client: Arc::new(self.mock.clone()),
                cache: self.cache.clone(),
                history: HistoryStore::new(
                    self.store.clone(),
                    self.config.history_chunk_size,
                    self.config.history_max_chunks,
                ),
                bus: self.bus.clone(),
                lease: self.lease.clone(),
                pause_view: Arc::new(self.registry.clone()),
                hooks: self.manager.poller_hooks(),
                config: self.config.clone(),
            },
        )
    }

    fn open_stream(&self) -> futures::stream::BoxStream<'static, crate::StreamMessage> {
        crate::open(
            self.session_id.clone(),
            self.registry.clone(),
            self.cache.clone(),
            self.bus.clone(),
            self.config.stream_heartbeat_interval,
            AsyncLatch::new(),
        )
    }
}

#[tokio::test]
async fn single_instance_happy_path() {
    let world = World::new().await;

    // A client connects before the first poll: it sees the placeholder.
    let mut stream = world.open_stream();
    assert_eq!(stream.next().await.unwrap().kind, MessageKind::Initializing);

    // The instance wins the session and polls it.
    assert!(world.lease.try_acquire(&world.session_id).await.unwrap());
    world.mock.set_session_info(SessionInfo {
        session_name: "Save_A".to_owned(),
        passed_real_seconds: 60,
    });
    world.mock.set_payload(DataType::FactoryStats, json!({ "power": 100 }));
    let poller = world.hand_poller();
    poller.probe_session_info().await;

    // Online within one tick of the first success.
    let session = world.manager.session(&world.session_id).unwrap();
    assert!(session.is_online);
    assert_eq!(session.stage, Stage::Validating);

    // Every critical data type lands: the session is ready and the stream hydrates.
    poller.poll_group(CadenceGroup::Fast).await;
    assert_eq!(world.manager.session(&world.session_id).unwrap().stage, Stage::Ready);

    let initial = loop {
        match stream.next().await.unwrap().kind {
            MessageKind::Initial(state) => break state,
            MessageKind::SessionUpdated => {}
            other => panic!("expected hydration, got {other:?}"),
        }
    };
    assert_eq!(initial[&DataType::FactoryStats], json!({ "power": 100 }));

    // Subsequent polls carry deltas, not another hydration. Deltas of types that completed
    // after the hydration point may still be queued; wait for the new payload specifically.
    world.mock.set_payload(DataType::FactoryStats, json!({ "power": 150 }));
    poller.poll_group(CadenceGroup::Fast).await;
    loop {
        match stream.next().await.unwrap().kind {
            MessageKind::Snapshot { data_type, payload }
                if data_type == DataType::FactoryStats && payload == json!({ "power": 150 }) =>
            {
                break;
            }
            MessageKind::Snapshot { .. } | MessageKind::SessionUpdated => {}
            other => panic!("expected delta, got {other:?}"),
        }
    }

    // The read surface serves the same state the stream carries.
    assert_eq!(
        world.manager.get_cached(&world.session_id)[&DataType::FactoryStats],
        json!({ "power": 150 })
    );
}

#[tokio::test]
async fn pause_then_resume() {
    let world = World::new().await;
    world.manager.reconcile_once().await;
    assert!(world.manager.has_poller(&world.session_id));

    // Pause: within one reconciliation tick the poller is gone and the lease released.
    world.manager.pause_session(&world.session_id).await.unwrap();
    world.manager.reconcile_once().await;
    assert!(!world.manager.has_poller(&world.session_id));
    assert!(!world.lease.is_owned(&world.session_id));
    assert!(world.manager.session(&world.session_id).unwrap().is_paused);

    // The paused session still serves its most recent cache.
    world.cache.put(&world.session_id, DataType::Hub, json!({ "tier": 1 }));
    assert!(!world.manager.get_cached(&world.session_id).is_empty());

    // Resume: the next pass re-acquires and polling starts again.
    world.manager.resume_session(&world.session_id).await.unwrap();
    world.manager.reconcile_once().await;
    assert!(world.manager.has_poller(&world.session_id));
    assert!(world.lease.is_owned(&world.session_id));
}

#[tokio::test]
async fn deltas_reach_streams_on_non_owning_instances() {
    let mem = MemStore::new();
    let x = World::over(&mem, "alpha").await;
    let y = World::over(&mem, "beta").await;
    x.manager
        .create_session(x.session_id.clone(), "factory one", None)
        .await
        .unwrap();

    // Both relays come up; afterwards every publish on one instance reaches the other.
    let executor = task_executor::Executor::new();
    let shutdown = AsyncLatch::new();
    x.bus.start_relay(&executor, shutdown.clone());
    y.bus.start_relay(&executor, shutdown.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    // alpha owns and polls the session.
    assert!(x.lease.try_acquire(&x.session_id).await.unwrap());
    x.mock.set_session_info(SessionInfo {
        session_name: "Save_A".to_owned(),
        passed_real_seconds: 5,
    });
    x.mock.set_payload(DataType::FactoryStats, json!({ "power": 7 }));
    let poller = x.hand_poller();
    poller.probe_session_info().await;
    poller.poll_group(CadenceGroup::Fast).await;

    // beta learns the session (store-backed table) and, via the relay, its cache.
    y.manager.reconcile_once().await;
    assert_eq!(
        y.manager.session(&y.session_id).unwrap().stage,
        Stage::Ready,
        "the stage walked on alpha is visible from the shared table"
    );
    let cached_on_beta = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let state = y.manager.get_cached(&y.session_id);
            if let Some(payload) = state.get(&DataType::FactoryStats) {
                break payload.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("relayed snapshot never reached beta's cache");
    assert_eq!(cached_on_beta, json!({ "power": 7 }));

    // A client streaming from beta hydrates from beta's (follower) cache, then receives
    // deltas produced by alpha's poller.
    let mut stream = y.open_stream();
    match stream.next().await.unwrap().kind {
        MessageKind::Initial(state) => {
            assert_eq!(state[&DataType::FactoryStats], json!({ "power": 7 }));
        }
        other => panic!("expected initial, got {other:?}"),
    }

    x.mock.set_payload(DataType::FactoryStats, json!({ "power": 8 }));
    poller.poll_group(CadenceGroup::Fast).await;
    let delta = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.next().await.unwrap().kind {
                MessageKind::Snapshot { data_type, payload }
                    if data_type == DataType::FactoryStats =>
                {
                    break payload;
                }
                _ => {}
            }
        }
    })
    .await
    .expect("delta never crossed the relay");
    assert_eq!(delta, json!({ "power": 8 }));

    shutdown.trigger();
}

#[tokio::test]
async fn outage_surfaces_offline_and_recovers() {
    let world = World::new().await;
    assert!(world.lease.try_acquire(&world.session_id).await.unwrap());
    let poller = world.hand_poller();
    poller.probe_session_info().await;
    assert!(world.manager.session(&world.session_id).unwrap().is_online);

    // The upstream goes dark: the session flips offline at the failure threshold.
    world
        .mock
        .fail_all(upstream::UpstreamError::Down("unreachable".to_owned()));
    for _ in 0..world.config.failure_threshold {
        poller.probe_session_info().await;
    }
    let session = world.manager.session(&world.session_id).unwrap();
    assert!(!session.is_online);
    assert_eq!(session.failure_count, world.config.failure_threshold);

    // Recovery is one successful tick away.
    world.mock.heal();
    poller.probe_session_info().await;
    let session = world.manager.session(&world.session_id).unwrap();
    assert!(session.is_online);
    assert_eq!(session.failure_count, 0);
}

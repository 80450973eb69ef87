// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;

use async_latch::AsyncLatch;
use async_trait::async_trait;
use bus::{Event, EventBus, EventData};
use cache::{CachedState, SnapshotCache};
use history::HistoryStore;
use identity::SessionId;
use lease::LeaseManager;
use log::{debug, error, trace, warn};
use options::Config;
use parking_lot::Mutex;
use poller::{Poller, PollerDeps, PollerHooks};
use store::StoreError;
use task_executor::Executor;
use upstream::{DataType, SessionInfo, UpstreamClient};

use crate::model::{Session, Stage};
use crate::registry::SessionRegistry;

///
/// Produces the upstream client for one session. Injected at startup: the daemon supplies a
/// real network client keyed by the session's address, tests and demos supply fixtures.
///
pub trait UpstreamClientFactory: Send + Sync {
    fn client_for(&self, session: &Session) -> Arc<dyn UpstreamClient>;
}

#[derive(Clone)]
pub struct SessionManagerDeps {
    pub registry: SessionRegistry,
    pub lease: LeaseManager,
    pub bus: EventBus,
    pub cache: SnapshotCache,
    pub history: HistoryStore,
    pub clients: Arc<dyn UpstreamClientFactory>,
    pub config: Arc<Config>,
}

///
/// Owns the poller table and the reconciliation loop. Every reconciliation tick lines three
/// things up per session: the pause flag (paused sessions run nothing and hold no lease), the
/// lease manager's preferred-owner verdict (acquire when preferred, release when not), and
/// the poller table (spawn when owned, cancel when not).
///
#[derive(Clone)]
pub struct SessionManager {
    deps: SessionManagerDeps,
    executor: Executor,
    pollers: Arc<Mutex<HashMap<SessionId, Poller>>>,
    hooks: Arc<ManagerHooks>,
}

impl SessionManager {
    pub fn new(executor: Executor, deps: SessionManagerDeps) -> SessionManager {
        let hooks = Arc::new(ManagerHooks {
            registry: deps.registry.clone(),
            bus: deps.bus.clone(),
            cache: deps.cache.clone(),
            config: deps.config.clone(),
        });

        // The cache follows every dispatched event, so sessions owned elsewhere still serve
        // (possibly stale) reads here: relayed snapshots land, save changes and deletions
        // clear. On the owning instance this re-applies what the poller already wrote, which
        // is idempotent.
        let cache = deps.cache.clone();
        deps.bus.add_tap(Arc::new(move |event: &Event| match &event.data {
            EventData::Snapshot { data_type, payload } => {
                cache.put(&event.session_id, *data_type, payload.clone());
            }
            EventData::SaveChanged { .. } | EventData::SessionDeleted => {
                cache.clear_session(&event.session_id);
            }
            EventData::SessionUpdated => {}
        }));

        SessionManager {
            deps,
            executor,
            pollers: Arc::new(Mutex::new(HashMap::new())),
            hooks,
        }
    }

    ///
    /// Load persisted sessions, start the lease loops, and spawn the reconciliation loop.
    /// Runs until the latch triggers, at which point every poller is cancelled; lease release
    /// is handled by the lease manager's own shutdown path.
    ///
    pub async fn start(&self, shutdown: AsyncLatch) -> Result<(), StoreError> {
        self.deps.registry.load().await?;
        self.deps.lease.start(&self.executor, shutdown.clone()).await;

        let manager = self.clone();
        let _join = self.executor.native_spawn(async move {
            let mut ticker = tokio::time::interval(manager.deps.config.reconciliation_interval);
            loop {
                tokio::select! {
                    _ = shutdown.triggered() => break,
                    _ = ticker.tick() => manager.reconcile_once().await,
                }
            }
            manager.stop_all_pollers().await;
        });
        Ok(())
    }

    /// One reconciliation pass. Public so tests (and the synthetic driver) can step it.
    pub async fn reconcile_once(&self) {
        // The session table is store-backed and shared: sessions created, paused or deleted
        // through any instance's control surface must reach this one's verdicts, so every
        // pass re-reads the table. Local updates are persisted as they happen, which makes
        // the replace safe.
        if let Err(e) = self.deps.registry.load().await {
            warn!("Could not refresh the session table (reconciling the cached view): {e}");
        }

        // Pollers whose session vanished from the table are cancelled first.
        let running = self.pollers.lock().keys().cloned().collect::<Vec<_>>();
        for id in running {
            if !self.deps.registry.contains(&id) {
                debug!("Stopping poller for deleted session {id}");
                self.stop_poller(&id).await;
                if let Err(e) = self.deps.lease.release(&id).await {
                    warn!("Could not release lease of deleted session {id}: {e}");
                }
            }
        }

        for session in self.deps.registry.list() {
            let id = session.id.clone();

            if session.is_paused {
                if self.pollers.lock().contains_key(&id) {
                    debug!("Session {id} is paused; cancelling its poller");
                    self.stop_poller(&id).await;
                }
                if self.deps.lease.is_owned(&id) {
                    if let Err(e) = self.deps.lease.release(&id).await {
                        warn!("Could not release lease of paused session {id}: {e}");
                    }
                }
                continue;
            }

            match self.deps.lease.is_preferred_owner(&id) {
                Err(reason) => {
                    // No live nodes known (yet): no acquisitions this tick.
                    trace!("Skipping placement of session {id}: {reason}");
                }
                Ok(true) => {
                    if !self.deps.lease.is_owned(&id) {
                        match self.deps.lease.try_acquire(&id).await {
                            Ok(true) => debug!("Acquired session {id} as preferred owner"),
                            Ok(false) => {
                                // Held elsewhere; its owner will yield once it sees the
                                // preference flip, and we re-try next tick.
                                trace!("Session {id} is still held elsewhere");
                            }
                            Err(e) => warn!("Could not acquire session {id}: {e}"),
                        }
                    }
                }
                Ok(false) => {
                    if self.deps.lease.is_owned(&id) {
                        debug!("Yielding session {id} to its preferred owner");
                        if let Err(e) = self.deps.lease.release(&id).await {
                            warn!("Could not yield session {id}: {e}");
                        }
                    }
                }
            }

            let owned = self.deps.lease.is_owned(&id);
            let has_poller = self.pollers.lock().contains_key(&id);
            if owned && !has_poller {
                self.spawn_poller(&session);
            } else if !owned && has_poller {
                debug!("Ownership of session {id} moved away; cancelling its poller");
                self.stop_poller(&id).await;
            }
        }
    }

    fn spawn_poller(&self, session: &Session) {
        debug!("Starting poller for session {}", session.id);
        let poller = Poller::new(
            session.id.clone(),
            PollerDeps {
                client: self.deps.clients.client_for(session),
                cache: self.deps.cache.clone(),
                history: self.deps.history.clone(),
                bus: self.deps.bus.clone(),
                lease: self.deps.lease.clone(),
                pause_view: Arc::new(self.deps.registry.clone()),
                hooks: self.hooks.clone(),
                config: self.deps.config.clone(),
            },
        );
        poller.spawn(&self.executor);
        self.pollers.lock().insert(session.id.clone(), poller);
    }

    async fn stop_poller(&self, id: &SessionId) {
        let poller = self.pollers.lock().remove(id);
        if let Some(poller) = poller {
            poller.shutdown().await;
        }
    }

    async fn stop_all_pollers(&self) {
        let pollers = std::mem::take(&mut *self.pollers.lock());
        for (_, poller) in pollers {
            poller.shutdown().await;
        }
    }

    // --- control surface -------------------------------------------------------------------

    /// Register a new session; it enters the lifecycle at `Created` and is picked up by the
    /// next reconciliation tick of whichever instance wins it.
    pub async fn create_session(
        &self,
        id: SessionId,
        name: impl Into<String>,
        address: Option<String>,
    ) -> Result<Session, StoreError> {
        let session = Session::new(id.clone(), name, address);
        self.deps.registry.insert(session.clone()).await?;
        self.publish(&id, EventData::SessionUpdated).await;
        Ok(session)
    }

    pub async fn pause_session(&self, id: &SessionId) -> Result<Session, StoreError> {
        let (_, updated) = self
            .deps
            .registry
            .update(id, |session| session.is_paused = true)
            .await?;
        self.publish(id, EventData::SessionUpdated).await;
        Ok(updated)
    }

    pub async fn resume_session(&self, id: &SessionId) -> Result<Session, StoreError> {
        let (_, updated) = self
            .deps
            .registry
            .update(id, |session| session.is_paused = false)
            .await?;
        self.publish(id, EventData::SessionUpdated).await;
        Ok(updated)
    }

    ///
    /// Delete a session: its poller stops, its lease is released, and its cached and historic
    /// state is removed. Streams observe `SessionDeleted` as their terminal signal.
    ///
    pub async fn delete_session(&self, id: &SessionId) -> Result<(), StoreError> {
        self.stop_poller(id).await;
        if let Err(e) = self.deps.lease.release(id).await {
            warn!("Could not release lease of deleted session {id}: {e}");
        }
        self.deps.registry.delete(id).await?;
        self.deps.cache.clear_session(id);
        if let Err(e) = self.deps.history.delete_session(id).await {
            warn!("Could not delete history of session {id}: {e}");
        }
        self.publish(id, EventData::SessionDeleted).await;
        Ok(())
    }

    /// The in-process read surface: the cached state this instance holds for one session.
    pub fn get_cached(&self, id: &SessionId) -> CachedState {
        self.deps.cache.get_cached(id)
    }

    pub fn session(&self, id: &SessionId) -> Option<Session> {
        self.deps.registry.get(id)
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.deps.registry.list()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.deps.registry
    }

    /// Whether a poller is currently running for the session, for tests and introspection.
    pub fn has_poller(&self, id: &SessionId) -> bool {
        self.pollers.lock().contains_key(id)
    }

    /// The hooks this manager installs into the pollers it spawns. Public for tests, which
    /// drive hand-built pollers through them deterministically.
    pub fn poller_hooks(&self) -> Arc<dyn PollerHooks> {
        self.hooks.clone()
    }

    async fn publish(&self, id: &SessionId, data: EventData) {
        self.deps
            .bus
            .publish(Event {
                session_id: id.clone(),
                data,
            })
            .await;
    }
}

///
/// The poller's window back into the session table. Persisting probe outcomes and walking the
/// stage machine happens here; keeping it separate from `SessionManager` avoids handing each
/// poller a reference to the poller table it lives in.
///
struct ManagerHooks {
    registry: SessionRegistry,
    bus: EventBus,
    cache: SnapshotCache,
    config: Arc<Config>,
}

impl ManagerHooks {
    async fn publish_updated(&self, session_id: &SessionId) {
        self.bus
            .publish(Event {
                session_id: session_id.clone(),
                data: EventData::SessionUpdated,
            })
            .await;
    }
}

#[async_trait]
impl PollerHooks for ManagerHooks {
    async fn on_session_info(&self, session_id: &SessionId, info: &SessionInfo) {
        let result = self
            .registry
            .update(session_id, |session| {
                session.session_name = Some(info.session_name.clone());
                session.passed_real_seconds = info.passed_real_seconds;
                session.advance_stage(Stage::Validating);
            })
            .await;
        match result {
            Ok((previous, updated)) => {
                // The clock moves every probe; only structural changes are worth an event.
                if previous.stage != updated.stage || previous.session_name != updated.session_name
                {
                    self.publish_updated(session_id).await;
                }
            }
            Err(StoreError::NotFound) => trace!("Probe outcome for unknown session {session_id}"),
            Err(e) => warn!("Could not persist probe outcome for session {session_id}: {e}"),
        }
    }

    async fn on_save_changed(&self, session_id: &SessionId, previous: &str, current: &str) {
        debug!("Session {session_id} switched save {previous:?} -> {current:?}");
    }

    async fn on_online_changed(&self, session_id: &SessionId, online: bool, failure_count: u32) {
        let result = self
            .registry
            .update(session_id, |session| {
                session.is_online = online;
                session.failure_count = failure_count;
            })
            .await;
        match result {
            Ok((previous, updated)) => {
                if previous.is_online != updated.is_online {
                    self.publish_updated(session_id).await;
                }
            }
            Err(StoreError::NotFound) => {}
            Err(e) => warn!("Could not persist online state for session {session_id}: {e}"),
        }
    }

    async fn on_snapshot(&self, session_id: &SessionId, _data_type: DataType) {
        let Some(session) = self.registry.get(session_id) else {
            return;
        };
        if session.stage != Stage::Validating {
            return;
        }
        if !self.cache.has_all(session_id, &self.config.critical_data_types) {
            return;
        }
        match self
            .registry
            .update(session_id, |session| {
                session.advance_stage(Stage::Ready);
            })
            .await
        {
            Ok((previous, updated)) if previous.stage != updated.stage => {
                debug!("Session {session_id} is ready");
                self.publish_updated(session_id).await;
            }
            Ok(_) => {}
            Err(StoreError::NotFound) => {}
            Err(e) => warn!("Could not persist stage for session {session_id}: {e}"),
        }
    }

    async fn on_store_fatal(&self, session_id: &SessionId, error: &StoreError) {
        error!("Fatal store failure for session {session_id}: {error}");
        match self
            .registry
            .update(session_id, |session| session.is_online = false)
            .await
        {
            Ok((previous, updated)) if previous.is_online != updated.is_online => {
                self.publish_updated(session_id).await;
            }
            Ok(_) => {}
            Err(e) => warn!("Could not mark session {session_id} unhealthy: {e}"),
        }
    }
}

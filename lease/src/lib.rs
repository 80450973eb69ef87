// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Single-writer election per session. Each instance heartbeats a TTL'd membership key,
//! discovers the live set by scanning, and holds TTL'd leases for the sessions it polls.
//! Rendezvous hashing over the live set names a preferred owner per session; the session
//! manager's reconciliation acquires when preferred and voluntarily releases when not,
//! which keeps handoff prompt while the TTL masks network blips.
//!
//! Correctness does not depend on local clocks: expiry is enforced by the store, and renewal
//! refreshes the TTL only behind a store-side value check, so a successful renewal can never
//! lose the race against its own expiry.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

use async_latch::AsyncLatch;
use bytes::Bytes;
use fnv::FnvHasher;
use identity::{InstanceId, SessionId};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use store::{Store, StoreError};
use task_executor::Executor;

fn lease_key(session_id: &SessionId) -> String {
    format!("lease:{session_id}")
}

fn node_key(instance_id: &InstanceId) -> String {
    format!("node:{instance_id}")
}

const NODE_PREFIX: &str = "node:";

/// How many consecutive failed renewals a lease survives locally before it is treated as lost.
const MAX_RENEWAL_FAILURES: u32 = 2;

/// Timing knobs, typically derived from the service configuration.
#[derive(Clone, Debug)]
pub struct LeaseConfig {
    pub lease_ttl: Duration,
    pub renewal_interval: Duration,
    pub heartbeat_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub node_discovery_interval: Duration,
}

///
/// The session manager's view of pause state. Paused sessions must never be acquired: the
/// check lives here so that `try_acquire` cannot be misused into violating it.
///
pub trait PauseView: Send + Sync {
    fn is_paused(&self, session_id: &SessionId) -> bool;
}

#[derive(Clone, Debug)]
struct OwnedLease {
    acquired_at: std::time::Instant,
    /// Set when the last renewal failed transiently: ownership is in doubt, and history
    /// writes must pause until a renewal round settles it one way or the other.
    uncertain: bool,
    consecutive_renewal_failures: u32,
}

impl OwnedLease {
    fn new() -> OwnedLease {
        OwnedLease {
            acquired_at: std::time::Instant::now(),
            uncertain: false,
            consecutive_renewal_failures: 0,
        }
    }
}

#[derive(Default)]
struct State {
    live_nodes: Vec<InstanceId>,
    owned: HashMap<SessionId, OwnedLease>,
}

#[derive(Clone)]
pub struct LeaseManager {
    store: Store,
    instance_id: InstanceId,
    config: LeaseConfig,
    pause_view: Arc<dyn PauseView>,
    state: Arc<Mutex<State>>,
}

impl LeaseManager {
    pub fn new(
        store: Store,
        instance_id: InstanceId,
        config: LeaseConfig,
        pause_view: Arc<dyn PauseView>,
    ) -> LeaseManager {
        LeaseManager {
            store,
            instance_id,
            config,
            pause_view,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    fn self_value(&self) -> Bytes {
        Bytes::from(self.instance_id.as_str().as_bytes().to_vec())
    }

    ///
    /// Attempt to take (or re-take) the lease for one session. Succeeds when the lease key was
    /// absent and is now ours, or when we already hold it (in which case the TTL is refreshed).
    /// Paused sessions always fail.
    ///
    pub async fn try_acquire(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        if self.pause_view.is_paused(session_id) {
            return Ok(false);
        }

        let key = lease_key(session_id);
        let acquired = self
            .store
            .set_if_absent(&key, self.self_value(), self.config.lease_ttl)
            .await?;
        let owned = if acquired {
            debug!("Acquired lease for session {session_id}");
            true
        } else {
            // Held by someone: us (refresh), or another instance (back off until the next
            // reconciliation tick).
            self.store
                .compare_and_expire(&key, self.self_value(), self.config.lease_ttl)
                .await?
        };

        if owned {
            // Re-acquiring keeps the original acquisition time; a refresh is not a handoff.
            self.state
                .lock()
                .owned
                .entry(session_id.clone())
                .or_insert_with(OwnedLease::new);
        }
        Ok(owned)
    }

    ///
    /// Give up the lease for one session. Idempotent: an absent key or one held by another
    /// instance is already the state we want.
    ///
    pub async fn release(&self, session_id: &SessionId) -> Result<(), StoreError> {
        // Local state goes first so that a failed delete still stops this instance's writers;
        // the TTL cleans the key up in the worst case.
        let held = self.state.lock().owned.remove(session_id);
        let released = self
            .store
            .compare_and_delete(&lease_key(session_id), self.self_value())
            .await?;
        if released {
            let held_for = held
                .map(|lease| format!(" after {:?}", lease.acquired_at.elapsed()))
                .unwrap_or_default();
            debug!("Released lease for session {session_id}{held_for}");
        }
        Ok(())
    }

    /// The cached, optimistic ownership view.
    pub fn is_owned(&self, session_id: &SessionId) -> bool {
        self.state.lock().owned.contains_key(session_id)
    }

    ///
    /// Owned, and not in renewal limbo. Gate irreversible writes (history appends) on this
    /// rather than `is_owned`.
    ///
    pub fn is_writable(&self, session_id: &SessionId) -> bool {
        self.state
            .lock()
            .owned
            .get(session_id)
            .map(|lease| !lease.uncertain)
            .unwrap_or(false)
    }

    /// Consult the store; use before irreversible writes on contentious handoffs.
    pub async fn is_owned_strict(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        match self.store.get(&lease_key(session_id)).await {
            Ok(value) => Ok(value == self.self_value()),
            Err(StoreError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Sessions this instance believes it owns.
    pub fn owned_sessions(&self) -> Vec<SessionId> {
        self.state.lock().owned.keys().cloned().collect()
    }

    /// The live instances as of the last discovery scan.
    pub fn live_nodes(&self) -> Vec<InstanceId> {
        self.state.lock().live_nodes.clone()
    }

    ///
    /// Rendezvous (highest-random-weight) selection: every live instance scores
    /// `hash(instance ++ session)`, and the highest score wins. Deterministic for a given
    /// membership, and moves only the sessions of a departed instance when membership changes.
    ///
    /// Fails when no live nodes are known, in which case no acquisition should occur.
    ///
    pub fn preferred_owner(&self, session_id: &SessionId) -> Result<InstanceId, String> {
        let state = self.state.lock();
        state
            .live_nodes
            .iter()
            .max_by_key(|instance| (rendezvous_score(instance, session_id), (*instance).clone()))
            .cloned()
            .ok_or_else(|| {
                format!("No live instances known; cannot place session {session_id}")
            })
    }

    pub fn is_preferred_owner(&self, session_id: &SessionId) -> Result<bool, String> {
        Ok(self.preferred_owner(session_id)? == self.instance_id)
    }

    ///
    /// Start the heartbeat, node-discovery and renewal loops. Each runs until the latch
    /// triggers; the renewal task then releases every owned lease on the way out (best
    /// effort: the TTL is the backstop).
    ///
    /// The first heartbeat and scan run inline, so that by the time this returns, the live
    /// set includes this instance and preferred-owner queries are answerable.
    ///
    pub async fn start(&self, executor: &Executor, shutdown: AsyncLatch) {
        if let Err(e) = self.heartbeat_once().await {
            warn!("Initial heartbeat failed (the heartbeat loop will retry): {e}");
        }
        if let Err(e) = self.discover_once().await {
            warn!("Initial node discovery failed (the discovery loop will retry): {e}");
        }
        self.start_heartbeat(executor, shutdown.clone());
        self.start_discovery(executor, shutdown.clone());
        self.start_renewal(executor, shutdown);
    }

    fn start_heartbeat(&self, executor: &Executor, shutdown: AsyncLatch) {
        let manager = self.clone();
        let _join = executor.native_spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = shutdown.triggered() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = manager.heartbeat_once().await {
                            warn!("Heartbeat failed (will retry): {e}");
                        }
                    }
                }
            }
            // Drop the membership marker eagerly so peers re-place our sessions without
            // waiting out the TTL.
            if let Err(e) = manager.store.delete(&node_key(&manager.instance_id)).await {
                warn!("Could not remove membership marker on shutdown: {e}");
            }
        });
    }

    /// One heartbeat refresh. Public for tests and the bootstrap path.
    pub async fn heartbeat_once(&self) -> Result<(), StoreError> {
        let key = node_key(&self.instance_id);
        let marker = Bytes::new();
        let created = self
            .store
            .set_if_absent(&key, marker.clone(), self.config.heartbeat_ttl)
            .await?;
        if !created {
            self.store
                .compare_and_expire(&key, marker, self.config.heartbeat_ttl)
                .await?;
        }
        trace!("Heartbeat refreshed for {}", self.instance_id);
        Ok(())
    }

    fn start_discovery(&self, executor: &Executor, shutdown: AsyncLatch) {
        let manager = self.clone();
        let _join = executor.native_spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.node_discovery_interval);
            loop {
                tokio::select! {
                    _ = shutdown.triggered() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = manager.discover_once().await {
                            warn!("Node discovery failed (will retry): {e}");
                        }
                    }
                }
            }
        });
    }

    /// One live-node scan. Public for tests and the bootstrap path.
    pub async fn discover_once(&self) -> Result<(), StoreError> {
        let keys = self.store.scan(NODE_PREFIX).await?;
        let mut nodes = keys
            .iter()
            .filter_map(|key| key.strip_prefix(NODE_PREFIX))
            .map(InstanceId::new)
            .collect::<Vec<_>>();
        nodes.sort();
        nodes.dedup();

        let mut state = self.state.lock();
        if state.live_nodes != nodes {
            debug!("Live instance set changed: {nodes:?}");
            state.live_nodes = nodes;
        }
        Ok(())
    }

    fn start_renewal(&self, executor: &Executor, shutdown: AsyncLatch) {
        let manager = self.clone();
        let _join = executor.native_spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.renewal_interval);
            loop {
                tokio::select! {
                    _ = shutdown.triggered() => break,
                    _ = ticker.tick() => manager.renew_all().await,
                }
            }
            manager.release_all().await;
        });
    }

    /// One renewal round over every owned lease. Public for tests.
    pub async fn renew_all(&self) {
        for session_id in self.owned_sessions() {
            let result = self
                .store
                .compare_and_expire(
                    &lease_key(&session_id),
                    self.self_value(),
                    self.config.lease_ttl,
                )
                .await;

            let mut state = self.state.lock();
            let Some(lease) = state.owned.get_mut(&session_id) else {
                // Released while we were renewing.
                continue;
            };
            match result {
                Ok(true) => {
                    lease.uncertain = false;
                    lease.consecutive_renewal_failures = 0;
                    trace!("Renewed lease for session {session_id}");
                }
                Ok(false) => {
                    // The store is definite: the key expired or another instance owns it.
                    warn!("Lease for session {session_id} is lost");
                    state.owned.remove(&session_id);
                }
                Err(e) => {
                    lease.uncertain = true;
                    lease.consecutive_renewal_failures += 1;
                    warn!(
                        "Lease renewal for session {session_id} failed ({} consecutive): {e}",
                        lease.consecutive_renewal_failures
                    );
                    if lease.consecutive_renewal_failures >= MAX_RENEWAL_FAILURES {
                        warn!("Treating lease for session {session_id} as lost locally");
                        state.owned.remove(&session_id);
                    }
                }
            }
        }
    }

    /// Release every owned lease. Failures are logged, not fatal: the TTL cleans up.
    pub async fn release_all(&self) {
        for session_id in self.owned_sessions() {
            if let Err(e) = self.release(&session_id).await {
                warn!("Could not release lease for session {session_id} on shutdown: {e}");
            }
        }
    }
}

fn rendezvous_score(instance_id: &InstanceId, session_id: &SessionId) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(instance_id.as_str().as_bytes());
    hasher.write(b":");
    hasher.write(session_id.as_str().as_bytes());
    hasher.finish()
}

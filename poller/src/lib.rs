// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The per-session poller: one instance exists per session this instance holds the lease for.
//! Three staggered tickers poll the upstream's cadence groups and a fourth probes session
//! info; every changed payload flows through the cache, then history, then the bus, in that
//! order, so subscribers observe updates in producer order per data type.
//!
//! The poller never stops itself on upstream failure: it counts failures, flips the session
//! offline at the threshold, and keeps trying, so recovery is one successful tick away.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

use async_latch::AsyncLatch;
use async_trait::async_trait;
use bus::{Event, EventBus, EventData};
use cache::SnapshotCache;
use fnv::FnvHasher;
use futures::StreamExt;
use futures::stream;
use history::{Group, HistoryRecord, HistoryStore};
use identity::SessionId;
use lease::{LeaseManager, PauseView};
use log::{debug, error, trace, warn};
use options::Config;
use parking_lot::Mutex;
use store::StoreError;
use task_executor::Executor;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use upstream::{CadenceGroup, DataType, Payload, SessionInfo, UpstreamClient, UpstreamError};

/// Bound on concurrent upstream calls within one tick.
const FANOUT: usize = 8;

///
/// How poll outcomes reach the session record. The session manager implements this; the
/// indirection keeps the poller free of any dependency on the session table.
///
#[async_trait]
pub trait PollerHooks: Send + Sync {
    /// A session-info probe succeeded.
    async fn on_session_info(&self, session_id: &SessionId, info: &SessionInfo);

    /// The upstream reported a different save than last observed.
    async fn on_save_changed(&self, session_id: &SessionId, previous: &str, current: &str);

    ///
    /// The session's connectivity changed: `true` on the first success after an outage (or
    /// ever), `false` when the failure count crosses the threshold. The `false` edge is the
    /// disconnect hook, and fires exactly once per outage.
    ///
    async fn on_online_changed(&self, session_id: &SessionId, online: bool, failure_count: u32);

    /// A changed payload was cached for this data type.
    async fn on_snapshot(&self, session_id: &SessionId, data_type: DataType);

    /// The store refused an irreversible write with a fatal error.
    async fn on_store_fatal(&self, session_id: &SessionId, error: &StoreError);
}

/// Everything a poller needs from the outside, cloneable per spawned session.
#[derive(Clone)]
pub struct PollerDeps {
    pub client: Arc<dyn UpstreamClient>,
    pub cache: SnapshotCache,
    pub history: HistoryStore,
    pub bus: EventBus,
    pub lease: LeaseManager,
    pub pause_view: Arc<dyn PauseView>,
    pub hooks: Arc<dyn PollerHooks>,
    pub config: Arc<Config>,
}

#[derive(Default)]
struct PollState {
    /// Last payload seen per data type; the change filter.
    last_payloads: HashMap<DataType, Payload>,
    /// Most recent session info this run; its clock stamps history records.
    session_info: Option<SessionInfo>,
    /// Last observed save name; the save-change detector.
    save_name: Option<String>,
    /// Snapshots taken before the first session info landed, awaiting a time coordinate.
    pending_history: HashMap<DataType, Payload>,
    failure_count: u32,
    /// None until the first probe outcome of this run.
    online: Option<bool>,
}

enum SaveTransition {
    Unchanged,
    FirstObservation,
    Changed { previous: String },
}

#[derive(Clone)]
pub struct Poller {
    session_id: SessionId,
    deps: PollerDeps,
    state: Arc<Mutex<PollState>>,
    latch: AsyncLatch,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Poller {
    pub fn new(session_id: SessionId, deps: PollerDeps) -> Poller {
        Poller {
            session_id,
            deps,
            state: Arc::new(Mutex::new(PollState::default())),
            latch: AsyncLatch::new(),
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    ///
    /// Start the ticker tasks: one per cadence group, staggered by a deterministic fraction
    /// of the period derived from the session id, plus the session-info probe, which fires
    /// immediately so that history writes gain their time coordinate as early as possible.
    ///
    pub fn spawn(&self, executor: &Executor) {
        let mut handles = self.handles.lock();

        for group in CadenceGroup::ALL {
            let poller = self.clone();
            handles.push(executor.native_spawn(async move {
                let period = poller.deps.config.poll_interval(group);
                let offset = stagger(&poller.session_id, group.name(), period);
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + offset, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = poller.latch.triggered() => break,
                        _ = ticker.tick() => poller.poll_group(group).await,
                    }
                }
                trace!("Poller ticker {} for session {} exited", group.name(), poller.session_id);
            }));
        }

        let poller = self.clone();
        handles.push(executor.native_spawn(async move {
            let mut ticker = tokio::time::interval(poller.deps.config.session_info_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = poller.latch.triggered() => break,
                    _ = ticker.tick() => poller.probe_session_info().await,
                }
            }
        }));
    }

    /// Request cooperative shutdown. In-flight upstream calls finish within their deadlines.
    pub fn stop(&self) {
        self.latch.trigger();
    }

    /// Stop and wait for every ticker task to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }

    ///
    /// One tick of a cadence group: fetch the group's data types with a bounded fan-out and
    /// run each changed payload through the cache/history/bus pipeline. Public so that tests
    /// drive ticks deterministically.
    ///
    pub async fn poll_group(&self, group: CadenceGroup) {
        if self.deps.pause_view.is_paused(&self.session_id) {
            return;
        }

        let client = self.deps.client.clone();
        let deadline = self.deps.config.upstream_timeout;
        let results = stream::iter(group.data_types().map(|data_type| {
            let client = client.clone();
            async move {
                let result = match tokio::time::timeout(deadline, client.fetch(data_type)).await {
                    Ok(result) => result,
                    Err(_) => Err(UpstreamError::Timeout),
                };
                (data_type, result)
            }
        }))
        .buffer_unordered(FANOUT)
        .collect::<Vec<_>>()
        .await;

        for (data_type, result) in results {
            if self.latch.poll_triggered() {
                return;
            }
            match result {
                Ok(payload) => self.handle_snapshot(data_type, payload).await,
                Err(error) => self.handle_upstream_error(Some(data_type), &error).await,
            }
        }
    }

    ///
    /// One session-info probe: connectivity first, then the save/clock read with save-change
    /// detection. Public so that tests drive probes deterministically.
    ///
    pub async fn probe_session_info(&self) {
        if self.deps.pause_view.is_paused(&self.session_id) {
            return;
        }

        let deadline = self.deps.config.upstream_timeout;
        match tokio::time::timeout(deadline, self.deps.client.get_api_status()).await {
            Ok(Ok(())) => self.mark_upstream_success().await,
            Ok(Err(error)) => {
                self.handle_upstream_error(None, &error).await;
                return;
            }
            Err(_) => {
                self.handle_upstream_error(None, &UpstreamError::Timeout).await;
                return;
            }
        }

        match tokio::time::timeout(deadline, self.deps.client.get_session_info()).await {
            Ok(Ok(info)) => self.handle_session_info(info).await,
            Ok(Err(error)) => self.handle_upstream_error(None, &error).await,
            Err(_) => self.handle_upstream_error(None, &UpstreamError::Timeout).await,
        }
    }

    async fn handle_session_info(&self, info: SessionInfo) {
        self.mark_upstream_success().await;
        self.deps.hooks.on_session_info(&self.session_id, &info).await;

        let transition = {
            let mut state = self.state.lock();
            let transition = match state.save_name.clone() {
                None => SaveTransition::FirstObservation,
                Some(previous) if previous != info.session_name => {
                    // Reset derived per-save state: payload baselines restart so the next
                    // successful poll of each type seeds the new namespace.
                    state.last_payloads.clear();
                    state.pending_history.clear();
                    SaveTransition::Changed { previous }
                }
                Some(_) => SaveTransition::Unchanged,
            };
            state.save_name = Some(info.session_name.clone());
            state.session_info = Some(info.clone());
            transition
        };

        match transition {
            SaveTransition::Unchanged => {}
            SaveTransition::FirstObservation => {
                self.set_current_save(&info.session_name).await;
                self.flush_pending_history(info.passed_real_seconds, &info.session_name).await;
            }
            SaveTransition::Changed { previous } => {
                debug!(
                    "Session {} save changed: {previous:?} -> {:?}",
                    self.session_id, info.session_name
                );
                self.deps
                    .bus
                    .publish(Event {
                        session_id: self.session_id.clone(),
                        data: EventData::SaveChanged {
                            save_name: info.session_name.clone(),
                        },
                    })
                    .await;
                self.deps.cache.clear_session(&self.session_id);
                self.set_current_save(&info.session_name).await;
                self.deps
                    .hooks
                    .on_save_changed(&self.session_id, &previous, &info.session_name)
                    .await;
            }
        }
    }

    async fn set_current_save(&self, save_name: &str) {
        if let Err(e) = self
            .deps
            .history
            .set_current_save(&self.session_id, save_name)
            .await
        {
            warn!(
                "Could not advance current save of session {} (retried on the next probe): {e}",
                self.session_id
            );
        }
    }

    /// Replay snapshots that arrived before the first session info under the now-known clock.
    async fn flush_pending_history(&self, game_time_id: u64, save_name: &str) {
        let pending = std::mem::take(&mut self.state.lock().pending_history);
        for (data_type, payload) in pending {
            self.append_history(data_type, payload, game_time_id, save_name).await;
        }
    }

    async fn handle_snapshot(&self, data_type: DataType, payload: Payload) {
        self.mark_upstream_success().await;

        let append_under = {
            let mut state = self.state.lock();
            if state.last_payloads.get(&data_type) == Some(&payload) {
                return;
            }
            state.last_payloads.insert(data_type, payload.clone());
            match (&state.session_info, &state.save_name) {
                (Some(info), Some(save)) => Some((info.passed_real_seconds, save.clone())),
                _ => {
                    // No time coordinate yet: buffer until the first session info lands.
                    state.pending_history.insert(data_type, payload.clone());
                    None
                }
            }
        };

        self.deps.cache.put(&self.session_id, data_type, payload.clone());
        if let Some((game_time_id, save_name)) = append_under {
            self.append_history(data_type, payload.clone(), game_time_id, &save_name).await;
        }
        self.deps.hooks.on_snapshot(&self.session_id, data_type).await;
        self.deps
            .bus
            .publish(Event {
                session_id: self.session_id.clone(),
                data: EventData::Snapshot { data_type, payload },
            })
            .await;
    }

    async fn append_history(
        &self,
        data_type: DataType,
        payload: Payload,
        game_time_id: u64,
        save_name: &str,
    ) {
        if !self.deps.lease.is_writable(&self.session_id) {
            // Ownership is uncertain (or gone): pausing appends here is what keeps the
            // single-writer invariant through contested handoffs.
            trace!(
                "Skipping history append for {}:{data_type}: lease not writable",
                self.session_id
            );
            return;
        }

        let group = Group::new(self.session_id.clone(), data_type, save_name);
        let record = HistoryRecord {
            game_time_id,
            payload,
        };
        match self.deps.history.append(&group, record.clone()).await {
            Ok(()) => {}
            Err(StoreError::Conflict) => {
                // Another writer moved the pointer. Confirm ownership against the store and
                // retry once with the fresh pointer; on a lost lease the append is dropped.
                match self.deps.lease.is_owned_strict(&self.session_id).await {
                    Ok(true) => {
                        if let Err(e) = self.deps.history.append(&group, record).await {
                            warn!(
                                "History append retry for {}:{data_type} failed: {e}",
                                self.session_id
                            );
                        }
                    }
                    Ok(false) => warn!(
                        "Dropping history append for {}:{data_type}: lease is held elsewhere",
                        self.session_id
                    ),
                    Err(e) => warn!(
                        "Could not confirm lease for {}:{data_type} after conflict: {e}",
                        self.session_id
                    ),
                }
            }
            Err(e @ StoreError::Fatal(_)) => {
                error!("History append for {}:{data_type} failed: {e}", self.session_id);
                self.deps.hooks.on_store_fatal(&self.session_id, &e).await;
            }
            Err(e) => {
                // Transient: the next changed payload re-attempts.
                debug!("History append for {}:{data_type} deferred: {e}", self.session_id);
            }
        }
    }

    async fn mark_upstream_success(&self) {
        let flipped_online = {
            let mut state = self.state.lock();
            state.failure_count = 0;
            if state.online == Some(true) {
                false
            } else {
                state.online = Some(true);
                true
            }
        };
        if flipped_online {
            debug!("Session {} is online", self.session_id);
            self.deps.hooks.on_online_changed(&self.session_id, true, 0).await;
        }
    }

    async fn handle_upstream_error(&self, data_type: Option<DataType>, error: &UpstreamError) {
        let context = data_type.map(|dt| dt.to_string()).unwrap_or_else(|| "probe".to_owned());
        if !error.counts_as_failure() {
            // Decode and transient failures skip this tick without touching the accounting.
            warn!("Skipping {context} for session {} this tick: {error}", self.session_id);
            return;
        }

        let threshold = self.deps.config.failure_threshold;
        let (crossed, failure_count) = {
            let mut state = self.state.lock();
            state.failure_count += 1;
            let crossed = state.failure_count >= threshold && state.online != Some(false);
            if crossed {
                state.online = Some(false);
            }
            (crossed, state.failure_count)
        };

        trace!(
            "Upstream failure {failure_count} for session {} ({context}): {error}",
            self.session_id
        );
        if crossed {
            warn!(
                "Session {} is offline after {failure_count} consecutive failures",
                self.session_id
            );
            self.deps
                .hooks
                .on_online_changed(&self.session_id, false, failure_count)
                .await;
        }
    }
}

/// The deterministic first-fire offset: a stable hash of the session and group, modulo the
/// period, so many sessions on one instance spread their load without coordination.
fn stagger(session_id: &SessionId, group: &str, period: Duration) -> Duration {
    let mut hasher = FnvHasher::default();
    hasher.write(session_id.as_str().as_bytes());
    hasher.write(b"/");
    hasher.write(group.as_bytes());
    let period_millis = period.as_millis().max(1) as u64;
    Duration::from_millis(hasher.finish() % period_millis)
}

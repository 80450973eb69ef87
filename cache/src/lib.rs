// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The per-session last-value cache behind the read surface. Writes come from exactly one
//! place per session (the poller on the owning instance), so readers only need a cheap
//! copy-out view, and staleness on non-owning instances is accepted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use identity::SessionId;
use parking_lot::RwLock;
use upstream::{DataType, Payload};

/// The subset of the cache a reader gets: one latest payload per data type the session has seen.
pub type CachedState = BTreeMap<DataType, Payload>;

#[derive(Clone)]
pub struct SnapshotCache {
    inner: Arc<RwLock<HashMap<SessionId, CachedState>>>,
}

impl SnapshotCache {
    pub fn new() -> SnapshotCache {
        SnapshotCache {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn put(&self, session_id: &SessionId, data_type: DataType, payload: Payload) {
        self.inner
            .write()
            .entry(session_id.clone())
            .or_default()
            .insert(data_type, payload);
    }

    pub fn get(&self, session_id: &SessionId, data_type: DataType) -> Option<Payload> {
        self.inner
            .read()
            .get(session_id)
            .and_then(|state| state.get(&data_type))
            .cloned()
    }

    ///
    /// The full cached state for one session, copied out. Empty if the session has not seen a
    /// successful poll on this instance yet.
    ///
    pub fn get_cached(&self, session_id: &SessionId) -> CachedState {
        self.inner
            .read()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// True if every data type in `required` has a cached payload for this session.
    pub fn has_all(&self, session_id: &SessionId, required: &HashSet<DataType>) -> bool {
        let inner = self.inner.read();
        let Some(state) = inner.get(session_id) else {
            return required.is_empty();
        };
        required.iter().all(|dt| state.contains_key(dt))
    }

    /// Drop everything for one session: save changed, or the session was deleted.
    pub fn clear_session(&self, session_id: &SessionId) {
        self.inner.write().remove(session_id);
    }
}

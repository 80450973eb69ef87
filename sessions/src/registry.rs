// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use identity::SessionId;
use lease::PauseView;
use log::warn;
use parking_lot::RwLock;
use store::{Store, StoreError};

use crate::model::Session;

const SESSION_PREFIX: &str = "session:";

///
/// The session table: an in-memory map mirrored to `session:<id>` records in the KV store.
/// The session manager is the single writer on this instance; readers get copies. Sessions
/// survive restarts through `load`.
///
#[derive(Clone)]
pub struct SessionRegistry {
    store: Store,
    sessions: Arc<RwLock<HashMap<SessionId, Session>>>,
}

impl SessionRegistry {
    pub fn new(store: Store) -> SessionRegistry {
        SessionRegistry {
            store,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Populate the in-memory table from the store. Undecodable records are skipped loudly.
    pub async fn load(&self) -> Result<(), StoreError> {
        let mut loaded = HashMap::new();
        for key in self.store.scan(SESSION_PREFIX).await? {
            match self.store.get_json::<Session>(&key).await {
                Ok(session) => {
                    loaded.insert(session.id.clone(), session);
                }
                Err(StoreError::NotFound) => {}
                Err(e) => warn!("Skipping undecodable session record {key}: {e}"),
            }
        }
        *self.sessions.write() = loaded;
        Ok(())
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Session> {
        let mut sessions = self.sessions.read().values().cloned().collect::<Vec<_>>();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// Insert a new session and persist it.
    pub async fn insert(&self, session: Session) -> Result<(), StoreError> {
        self.store.set_json(&Session::key(&session.id), &session).await?;
        self.sessions.write().insert(session.id.clone(), session);
        Ok(())
    }

    ///
    /// Mutate one session and persist the result. Returns the (previous, updated) pair, or
    /// `NotFound` for unknown ids. Writes are last-writer-wins across instances; the record
    /// converges on the next probe.
    ///
    pub async fn update(
        &self,
        id: &SessionId,
        mutate: impl FnOnce(&mut Session),
    ) -> Result<(Session, Session), StoreError> {
        let (previous, updated) = {
            let mut sessions = self.sessions.write();
            let session = sessions.get_mut(id).ok_or(StoreError::NotFound)?;
            let previous = session.clone();
            mutate(session);
            session.updated_at = Utc::now();
            (previous, session.clone())
        };
        self.store.set_json(&Session::key(id), &updated).await?;
        Ok((previous, updated))
    }

    /// Remove a session from the table and the store. Idempotent.
    pub async fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        self.sessions.write().remove(id);
        self.store.delete(&Session::key(id)).await
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().contains_key(id)
    }
}

impl PauseView for SessionRegistry {
    fn is_paused(&self, session_id: &SessionId) -> bool {
        self.sessions
            .read()
            .get(session_id)
            .map(|session| session.is_paused)
            .unwrap_or(false)
    }
}

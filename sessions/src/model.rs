// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use chrono::{DateTime, Utc};
use identity::SessionId;
use serde_derive::{Deserialize, Serialize};

///
/// The monotone lifecycle phase of a session. A new session is `Created`; the first successful
/// session-info probe advances it to `Validating`; once every critical data type has produced
/// a snapshot it is `Ready`. The stage never regresses; consumers of cached state gate on
/// `Ready` and rely on that.
///
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Created,
    Validating,
    Ready,
}

///
/// One upstream endpoint plus the derived state the service keeps for it. Persisted as
/// `session:<id>` in the KV store and owned, in memory, by the session registry.
///
/// During a lease handoff two instances can briefly both write this record; the later write
/// wins and the fields converge on the next probe tick.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    /// Human-readable name, chosen by whoever created the session.
    pub name: String,
    /// Upstream address; None marks a synthetic session served by the fixture client.
    pub address: Option<String>,
    pub synthetic: bool,
    pub stage: Stage,
    pub is_paused: bool,
    pub is_online: bool,
    /// The save the upstream most recently reported.
    pub session_name: Option<String>,
    /// The upstream's in-game clock, as of the last probe.
    pub passed_real_seconds: u64,
    pub failure_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, name: impl Into<String>, address: Option<String>) -> Session {
        let now = Utc::now();
        let synthetic = address.is_none();
        Session {
            id,
            name: name.into(),
            address,
            synthetic,
            stage: Stage::Created,
            is_paused: false,
            is_online: false,
            session_name: None,
            passed_real_seconds: 0,
            failure_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    ///
    /// Advance to `stage` if that is forward progress; regressions are ignored. Returns true
    /// if the stage changed.
    ///
    pub fn advance_stage(&mut self, stage: Stage) -> bool {
        if stage > self.stage {
            self.stage = stage;
            true
        } else {
            false
        }
    }

    pub fn key(id: &SessionId) -> String {
        format!("session:{id}")
    }
}

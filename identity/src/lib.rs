// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use serde_derive::{Deserialize, Serialize};

///
/// The stable identity of one running service instance, used as the heartbeat key and as the
/// value of every lease this instance holds.
///
/// Two instances must never share an id: rendezvous selection and lease ownership both key on
/// it. The default derivation includes the pid so that multiple instances on one host stay
/// distinct; deployments that restart in place should configure an explicit name instead, so
/// that identity survives the restart.
///
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> InstanceId {
        InstanceId(id.into())
    }

    ///
    /// Derive an id from the local hostname and pid. Falls back to a fixed host marker when the
    /// hostname is unavailable, which keeps the id stable for the life of the process either way.
    ///
    pub fn derive() -> InstanceId {
        let hostname = whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_owned());
        InstanceId(format!("{}.{}", hostname, std::process::id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The opaque identity of one session (one upstream endpoint plus its cached/derived state).
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> SessionId {
        SessionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

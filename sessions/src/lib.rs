// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Session lifecycle: the persisted session records, the KV-backed registry that owns them on
//! this instance, and the manager whose reconciliation loop lines the set of running pollers
//! up with the lease manager's verdicts.

mod manager;
mod model;
mod registry;

pub use crate::manager::{SessionManager, SessionManagerDeps, UpstreamClientFactory};
pub use crate::model::{Session, Stage};
pub use crate::registry::SessionRegistry;

#[cfg(test)]
mod tests;

// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The key-value store adapter: a deadline-bounded capability surface over raw bytes, with a
//! typed JSON handle layered on top. Production uses `RedisStore`; tests use the in-memory
//! double from `testutil`. Leases, heartbeats, sessions, history chunks and the cross-instance
//! event relay all go through this one seam.

mod redis_store;

pub use crate::redis_store::RedisStore;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Classified failure of one store operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StoreError {
    /// Worth retrying on the next tick: connection hiccups, elapsed deadlines.
    Transient(String),
    /// The key does not exist.
    NotFound,
    /// A compare-and-swap style operation observed a concurrent writer.
    Conflict,
    /// Not recoverable by retrying: protocol violations, corrupt values.
    Fatal(String),
}

impl StoreError {
    pub fn retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Transient(msg) => write!(f, "transient store failure: {msg}"),
            StoreError::NotFound => write!(f, "key not found"),
            StoreError::Conflict => write!(f, "concurrent writer conflict"),
            StoreError::Fatal(msg) => write!(f, "fatal store failure: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

///
/// The raw capability surface. All operations are value-oriented over `Bytes`; callers that
/// want typed values go through `Store`, which layers serde on top.
///
/// Implementations do not enforce deadlines themselves: `Store` wraps every call in the
/// configured store deadline, so that the bound is applied uniformly no matter the backend.
///
#[async_trait]
pub trait KeyValue: Send + Sync {
    /// Fails with `NotFound` when the key is absent.
    async fn get(&self, key: &str) -> Result<Bytes, StoreError>;

    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError>;

    /// Idempotent: deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All keys currently starting with `prefix`, in no particular order.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// SETNX with a TTL: returns true if this call created the key.
    async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    ///
    /// Atomically delete the key only if it currently holds `expected`. Returns true if the
    /// key was deleted; absent keys and keys holding another value return false.
    ///
    async fn compare_and_delete(&self, key: &str, expected: Bytes) -> Result<bool, StoreError>;

    ///
    /// Atomically refresh the TTL only if the key currently holds `expected`. Returns true if
    /// the TTL was set. This is the primitive behind lease renewal: because the value check
    /// and the TTL refresh are one store-side step, expiry never races ahead of a successful
    /// renewal.
    ///
    async fn compare_and_expire(
        &self,
        key: &str,
        expected: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), StoreError>;

    ///
    /// A lazy sequence of payloads published to `channel`, starting from subscription time.
    /// The stream ends when the backing connection is lost; resubscribing is the caller's
    /// responsibility.
    ///
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Bytes>, StoreError>;
}

///
/// A cloneable, deadline-enforcing handle over a `KeyValue` backend, with typed JSON get/set.
///
#[derive(Clone)]
pub struct Store {
    inner: Arc<dyn KeyValue>,
    deadline: Duration,
}

impl Store {
    pub fn new(inner: Arc<dyn KeyValue>, deadline: Duration) -> Store {
        Store { inner, deadline }
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.deadline, fut)
            .await
            .unwrap_or_else(|_| {
                Err(StoreError::Transient(format!(
                    "{op} exceeded the {}ms store deadline",
                    self.deadline.as_millis()
                )))
            })
    }

    pub async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        self.bounded("get", self.inner.get(key)).await
    }

    pub async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        self.bounded("set", self.inner.set(key, value)).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.bounded("delete", self.inner.delete(key)).await
    }

    pub async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.bounded("scan", self.inner.scan(prefix)).await
    }

    pub async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.bounded("set_if_absent", self.inner.set_if_absent(key, value, ttl))
            .await
    }

    pub async fn compare_and_delete(
        &self,
        key: &str,
        expected: Bytes,
    ) -> Result<bool, StoreError> {
        self.bounded(
            "compare_and_delete",
            self.inner.compare_and_delete(key, expected),
        )
        .await
    }

    pub async fn compare_and_expire(
        &self,
        key: &str,
        expected: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.bounded(
            "compare_and_expire",
            self.inner.compare_and_expire(key, expected, ttl),
        )
        .await
    }

    pub async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), StoreError> {
        self.bounded("publish", self.inner.publish(channel, payload))
            .await
    }

    /// The deadline bounds subscription establishment only; the returned stream is unbounded
    /// in time by nature.
    pub async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Bytes>, StoreError> {
        self.bounded("subscribe", self.inner.subscribe(channel)).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T, StoreError> {
        let bytes = self.get(key).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            StoreError::Fatal(format!("Value at {key} did not decode as JSON: {e}"))
        })
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| StoreError::Fatal(format!("Value for {key} did not encode: {e}")))?;
        self.set(key, bytes.into()).await
    }
}

#[cfg(test)]
mod tests;

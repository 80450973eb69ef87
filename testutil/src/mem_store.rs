// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use store::{KeyValue, StoreError};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

struct Inner {
    entries: HashMap<String, Entry>,
    channels: HashMap<String, broadcast::Sender<Bytes>>,
    // When set, every operation fails with a clone of this error. Lets tests take the store
    // down mid-scenario.
    fail_with: Option<StoreError>,
}

///
/// An in-memory `KeyValue` backend. TTLs are checked lazily against tokio's clock on every
/// access, which makes expiry deterministic under `#[tokio::test(start_paused = true)]`.
///
#[derive(Clone)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore {
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                channels: HashMap::new(),
                fail_with: None,
            })),
        }
    }

    /// Make every subsequent operation fail with `error` until `heal` is called.
    pub fn fail_with(&self, error: StoreError) {
        self.inner.lock().fail_with = Some(error);
    }

    pub fn heal(&self) {
        self.inner.lock().fail_with = None;
    }

    /// The live (unexpired) key set, for assertions.
    pub fn keys(&self) -> Vec<String> {
        let mut inner = self.inner.lock();
        Self::purge_expired(&mut inner);
        let mut keys = inner.entries.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    fn purge_expired(inner: &mut Inner) {
        let now = Instant::now();
        inner
            .entries
            .retain(|_, entry| entry.expires_at.map(|at| at > now).unwrap_or(true));
    }

    fn checked(&self) -> Result<parking_lot::MutexGuard<'_, Inner>, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(error) = &inner.fail_with {
            return Err(error.clone());
        }
        Self::purge_expired(&mut inner);
        Ok(inner)
    }
}

#[async_trait]
impl KeyValue for MemStore {
    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let inner = self.checked()?;
        inner
            .entries
            .get(key)
            .map(|entry| entry.value.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        let mut inner = self.checked()?;
        inner.entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.checked()?;
        inner.entries.remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.checked()?;
        Ok(inner
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.checked()?;
        if inner.entries.contains_key(key) {
            return Ok(false);
        }
        inner.entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: Bytes) -> Result<bool, StoreError> {
        let mut inner = self.checked()?;
        match inner.entries.get(key) {
            Some(entry) if entry.value == expected => {
                inner.entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.checked()?;
        match inner.entries.get_mut(key) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), StoreError> {
        let sender = {
            let mut inner = self.checked()?;
            inner
                .channels
                .entry(channel.to_owned())
                .or_insert_with(|| broadcast::channel(256).0)
                .clone()
        };
        // No subscribers is not an error; publishes are fire-and-forget.
        let _ = sender.send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Bytes>, StoreError> {
        let receiver = {
            let mut inner = self.checked()?;
            inner
                .channels
                .entry(channel.to_owned())
                .or_insert_with(|| broadcast::channel(256).0)
                .subscribe()
        };
        Ok(BroadcastStream::new(receiver)
            .filter_map(|item| async move { item.ok() })
            .boxed())
    }
}

// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::{KeyValue, Store, StoreError};

/// A backend that answers `get` only after a configurable delay, for deadline tests.
struct SlowBackend {
    delay: Duration,
}

#[async_trait]
impl KeyValue for SlowBackend {
    async fn get(&self, _key: &str) -> Result<Bytes, StoreError> {
        tokio::time::sleep(self.delay).await;
        Ok(Bytes::from_static(b"\"late\""))
    }

    async fn set(&self, _key: &str, _value: Bytes) -> Result<(), StoreError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn scan(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(vec![])
    }

    async fn set_if_absent(
        &self,
        _key: &str,
        _value: Bytes,
        _ttl: Duration,
    ) -> Result<bool, StoreError> {
        Ok(true)
    }

    async fn compare_and_delete(&self, _key: &str, _expected: Bytes) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn compare_and_expire(
        &self,
        _key: &str,
        _expected: Bytes,
        _ttl: Duration,
    ) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn publish(&self, _channel: &str, _payload: Bytes) -> Result<(), StoreError> {
        Ok(())
    }

    async fn subscribe(&self, _channel: &str) -> Result<BoxStream<'static, Bytes>, StoreError> {
        Ok(futures::stream::pending().boxed())
    }
}

#[tokio::test(start_paused = true)]
async fn deadline_expiry_is_transient() {
    let store = Store::new(
        Arc::new(SlowBackend {
            delay: Duration::from_secs(10),
        }),
        Duration::from_secs(2),
    );

    let err = store.get("any").await.unwrap_err();
    assert!(err.retryable(), "deadline expiry should classify as transient: {err}");
}

#[tokio::test]
async fn within_deadline_passes_through() {
    let store = Store::new(
        Arc::new(SlowBackend {
            delay: Duration::from_millis(0),
        }),
        Duration::from_secs(2),
    );

    assert_eq!(store.get("any").await.unwrap(), Bytes::from_static(b"\"late\""));
}

#[tokio::test]
async fn json_decode_failure_is_fatal() {
    struct Garbage;

    #[async_trait]
    impl KeyValue for Garbage {
        async fn get(&self, _key: &str) -> Result<Bytes, StoreError> {
            Ok(Bytes::from_static(b"not json"))
        }
        async fn set(&self, _key: &str, _value: Bytes) -> Result<(), StoreError> {
            Ok(())
        }
        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn scan(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
            Ok(vec![])
        }
        async fn set_if_absent(
            &self,
            _key: &str,
            _value: Bytes,
            _ttl: Duration,
        ) -> Result<bool, StoreError> {
            Ok(true)
        }
        async fn compare_and_delete(
            &self,
            _key: &str,
            _expected: Bytes,
        ) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn compare_and_expire(
            &self,
            _key: &str,
            _expected: Bytes,
            _ttl: Duration,
        ) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn publish(&self, _channel: &str, _payload: Bytes) -> Result<(), StoreError> {
            Ok(())
        }
        async fn subscribe(
            &self,
            _channel: &str,
        ) -> Result<BoxStream<'static, Bytes>, StoreError> {
            Ok(futures::stream::pending().boxed())
        }
    }

    let store = Store::new(Arc::new(Garbage), Duration::from_secs(2));
    match store.get_json::<u64>("k").await {
        Err(StoreError::Fatal(_)) => {}
        other => panic!("expected fatal decode error, got {other:?}"),
    }
}

// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, IntoConnectionInfo, RedisError, Script};

use crate::{KeyValue, StoreError};

///
/// The production `KeyValue` backend: one multiplexed tokio connection for commands (cheap to
/// clone per call), and a dedicated pubsub connection per subscription, because Redis devotes
/// a connection to pubsub once SUBSCRIBE is issued.
///
/// Compare-and-delete and compare-and-expire are Lua scripts so the value guard and the
/// mutation are a single server-side step.
///
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
}

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

const COMPARE_AND_EXPIRE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
  return 0
end
"#;

fn classify(e: RedisError) -> StoreError {
    if e.is_io_error()
        || e.is_timeout()
        || e.is_connection_dropped()
        || e.is_connection_refusal()
    {
        StoreError::Transient(e.to_string())
    } else {
        StoreError::Fatal(e.to_string())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PEXPIRE treats 0 as "delete now"; a TTL below one millisecond still has to grant time.
    (ttl.as_millis() as u64).max(1)
}

impl RedisStore {
    pub async fn connect(url: &str, password: Option<&str>) -> Result<RedisStore, String> {
        let mut info = url
            .into_connection_info()
            .map_err(|e| format!("Invalid redis url {url}: {e}"))?;
        if let Some(password) = password {
            info.redis.password = Some(password.to_owned());
        }
        let client =
            Client::open(info).map_err(|e| format!("Could not configure redis client: {e}"))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| format!("Could not connect to redis at {url}: {e}"))?;
        Ok(RedisStore { client, conn })
    }
}

#[async_trait]
impl KeyValue for RedisStore {
    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(classify)?;
        value.map(Bytes::from).ok_or(StoreError::NotFound)
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let () = conn.set(key, &value[..]).await.map_err(classify)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _deleted: u64 = conn.del(key).await.map_err(classify)?;
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut iter = conn
            .scan_match::<_, String>(pattern)
            .await
            .map_err(classify)?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let created: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&value[..])
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(created.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: Bytes) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = Script::new(COMPARE_AND_DELETE)
            .key(key)
            .arg(&expected[..])
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(deleted > 0)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let refreshed: i64 = Script::new(COMPARE_AND_EXPIRE)
            .key(key)
            .arg(&expected[..])
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(refreshed > 0)
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _receivers: u64 = conn
            .publish(channel, &payload[..])
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Bytes>, StoreError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(classify)?;
        pubsub.subscribe(channel).await.map_err(classify)?;
        let stream = pubsub
            .into_on_message()
            .map(|msg| Bytes::from(msg.get_payload_bytes().to_vec()));
        Ok(stream.boxed())
    }
}

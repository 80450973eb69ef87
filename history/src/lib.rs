// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The durable time series: per `(session, dataType, save)` group, records keyed by the
//! in-game clock are packed into fixed-size chunks, gzipped, and written through the KV store.
//! A pointer record per group tracks the chunk window; rotation always writes the new chunk
//! before bumping the pointer, so a crash between the two steps leaves an orphan that the next
//! append adopts or deletes.
//!
//! A save change never deletes prior history: it opens a fresh group namespace and advances
//! the per-session current-save pointer.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::Arc;

use async_stream::try_stream;
use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use futures::stream::BoxStream;
use identity::SessionId;
use log::{debug, warn};
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use store::{Store, StoreError};
use upstream::{DataType, Payload};

/// One appended observation: the in-game clock reading and the payload captured at it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub game_time_id: u64,
    pub payload: Payload,
}

///
/// The per-group pointer. `base_chunk` is the retention window floor: chunks below it have
/// been evicted and their indices are skipped by queries.
///
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
struct ChunkPointer {
    chunk_count: u64,
    latest_game_time_id: u64,
    #[serde(default)]
    base_chunk: u64,
}

/// One group of records: a session's stream of one data type under one save.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Group {
    pub session_id: SessionId,
    pub data_type: DataType,
    pub save_name: String,
}

impl Group {
    pub fn new(session_id: SessionId, data_type: DataType, save_name: impl Into<String>) -> Group {
        Group {
            session_id,
            data_type,
            save_name: save_name.into(),
        }
    }

    fn ptr_key(&self) -> String {
        format!(
            "history:{}:{}:{}:ptr",
            self.session_id, self.data_type, self.save_name
        )
    }

    fn chunk_key(&self, index: u64) -> String {
        format!(
            "history:{}:{}:{}:chunk:{}",
            self.session_id, self.data_type, self.save_name, index
        )
    }
}

fn save_key(session_id: &SessionId) -> String {
    format!("history:{session_id}:save")
}

#[derive(Clone)]
pub struct HistoryStore {
    store: Store,
    chunk_size: usize,
    /// Retained chunks per group; zero retains everything.
    max_chunks: u64,
    /// Groups whose orphan recovery has run this process.
    recovered: Arc<Mutex<HashSet<Group>>>,
}

impl HistoryStore {
    pub fn new(store: Store, chunk_size: usize, max_chunks: u64) -> HistoryStore {
        HistoryStore {
            store,
            chunk_size,
            max_chunks,
            recovered: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    ///
    /// Append one record to the group, rotating to a new chunk when the current one is full.
    /// Fails with `Conflict` if another writer advanced the pointer concurrently; the lease
    /// invariant makes this a misconfiguration signal, and the recovery is to retry so the
    /// re-read pointer is observed.
    ///
    pub async fn append(&self, group: &Group, record: HistoryRecord) -> Result<(), StoreError> {
        self.ensure_recovered(group).await?;

        let ptr_key = group.ptr_key();
        let observed = self.read_pointer(group).await?;
        if record.game_time_id < observed.latest_game_time_id {
            // Accepted during handoff overlap; the producer contract keeps this rare.
            debug!(
                "History append for {}:{} moved backwards: {} < {}",
                group.session_id, group.data_type, record.game_time_id, observed.latest_game_time_id
            );
        }

        let mut next = observed.clone();
        next.latest_game_time_id = record.game_time_id.max(observed.latest_game_time_id);

        if observed.chunk_count == 0 {
            // First record of the group.
            self.write_chunk(group, 0, &[record]).await?;
            next.chunk_count = 1;
        } else {
            let current_index = observed.chunk_count - 1;
            let mut records = match self.read_chunk(group, current_index).await {
                Ok(records) => records,
                // A missing current chunk means a rotation crashed after the pointer bump
                // of a previous layout, or an eviction raced; start the chunk fresh.
                Err(StoreError::NotFound) => Vec::new(),
                Err(e) => return Err(e),
            };
            if records.len() < self.chunk_size {
                records.push(record);
                self.write_chunk(group, current_index, &records).await?;
            } else {
                // Rotate: the new chunk is created before the pointer bump.
                self.write_chunk(group, observed.chunk_count, &[record]).await?;
                next.chunk_count = observed.chunk_count + 1;
            }
        }

        // Retention: advance the window base once it exceeds the cap. The pointer moves
        // before the chunks are deleted, so a crash mid-eviction leaves only unreferenced
        // chunks below the base, which queries already skip.
        let evict_from = next.base_chunk;
        if self.max_chunks > 0 {
            while next.chunk_count - next.base_chunk > self.max_chunks {
                next.base_chunk += 1;
            }
        }

        // Single-writer check: the pointer must not have moved while we wrote.
        let reread = self.read_pointer(group).await?;
        if reread != observed {
            return Err(StoreError::Conflict);
        }
        self.store.set_json(&ptr_key, &next).await?;

        for evict in evict_from..next.base_chunk {
            self.store.delete(&group.chunk_key(evict)).await?;
            debug!(
                "Evicted history chunk {} of {}:{}:{}",
                evict, group.session_id, group.data_type, group.save_name
            );
        }
        Ok(())
    }

    ///
    /// Records of the group with `game_time_id >= since`, in ascending append order, ending
    /// after `limit` records. Chunks are loaded lazily in index order and a chunk whose last
    /// record predates `since` is discarded without yielding.
    ///
    pub fn query(
        &self,
        group: &Group,
        since: u64,
        limit: usize,
    ) -> BoxStream<'static, Result<HistoryRecord, StoreError>> {
        let this = self.clone();
        let group = group.clone();
        Box::pin(try_stream! {
            if limit == 0 {
                return;
            }
            let ptr = this.read_pointer(&group).await?;
            let mut yielded = 0usize;
            for index in ptr.base_chunk..ptr.chunk_count {
                let records = match this.read_chunk(&group, index).await {
                    Ok(records) => records,
                    // Evicted or never written (crash window); skip.
                    Err(StoreError::NotFound) => continue,
                    Err(e) => Err(e)?,
                };
                match records.last() {
                    Some(last) if last.game_time_id < since => continue,
                    None => continue,
                    Some(_) => {}
                }
                for record in records {
                    if record.game_time_id < since {
                        continue;
                    }
                    yield record;
                    yielded += 1;
                    if yielded >= limit {
                        return;
                    }
                }
            }
        })
    }

    /// Every save name this session has history under.
    pub async fn list_saves(&self, session_id: &SessionId) -> Result<HashSet<String>, StoreError> {
        let mut saves = HashSet::new();
        for key in self.store.scan(&format!("history:{session_id}:")).await? {
            // history:<sid>:<dataType>:<save>:ptr. The save segment may itself contain
            // colons, so parse from both ends.
            let Some(rest) = key.strip_prefix(&format!("history:{session_id}:")) else {
                continue;
            };
            let Some(rest) = rest.strip_suffix(":ptr") else {
                continue;
            };
            let Some((data_type, save)) = rest.split_once(':') else {
                continue;
            };
            if data_type.parse::<DataType>().is_ok() && !save.is_empty() {
                saves.insert(save.to_owned());
            }
        }
        Ok(saves)
    }

    /// The save the session's poller is currently writing under, if any poll has landed yet.
    pub async fn current_save(&self, session_id: &SessionId) -> Result<Option<String>, StoreError> {
        match self.store.get_json::<String>(&save_key(session_id)).await {
            Ok(save) => Ok(Some(save)),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn set_current_save(
        &self,
        session_id: &SessionId,
        save_name: &str,
    ) -> Result<(), StoreError> {
        self.store
            .set_json(&save_key(session_id), &save_name.to_owned())
            .await
    }

    /// Delete every key of the session: history chunks, pointers and the save pointer.
    pub async fn delete_session(&self, session_id: &SessionId) -> Result<(), StoreError> {
        for key in self.store.scan(&format!("history:{session_id}:")).await? {
            self.store.delete(&key).await?;
        }
        Ok(())
    }

    async fn read_pointer(&self, group: &Group) -> Result<ChunkPointer, StoreError> {
        match self.store.get_json::<ChunkPointer>(&group.ptr_key()).await {
            Ok(ptr) => Ok(ptr),
            Err(StoreError::NotFound) => Ok(ChunkPointer::default()),
            Err(e) => Err(e),
        }
    }

    async fn read_chunk(&self, group: &Group, index: u64) -> Result<Vec<HistoryRecord>, StoreError> {
        let bytes = self.store.get(&group.chunk_key(index)).await?;
        decode_chunk(&bytes)
    }

    async fn write_chunk(
        &self,
        group: &Group,
        index: u64,
        records: &[HistoryRecord],
    ) -> Result<(), StoreError> {
        let bytes = encode_chunk(records)?;
        self.store.set(&group.chunk_key(index), bytes).await
    }

    ///
    /// Orphan-chunk recovery, once per group per process: chunks whose index is at or past
    /// the pointer were written by a rotation that crashed before the pointer bump. Non-empty
    /// orphans are adopted into the pointer (it was stale); empty or undecodable ones are
    /// deleted.
    ///
    async fn ensure_recovered(&self, group: &Group) -> Result<(), StoreError> {
        if !self.recovered.lock().insert(group.clone()) {
            return Ok(());
        }

        let mut ptr = self.read_pointer(group).await?;
        let prefix = format!(
            "history:{}:{}:{}:chunk:",
            group.session_id, group.data_type, group.save_name
        );
        let mut orphans = Vec::new();
        for key in self.store.scan(&prefix).await? {
            if let Some(index) = key
                .strip_prefix(&prefix)
                .and_then(|raw| raw.parse::<u64>().ok())
            {
                if index >= ptr.chunk_count {
                    orphans.push(index);
                } else if index < ptr.base_chunk {
                    // Left behind by an eviction that crashed between pointer and delete.
                    self.store.delete(&key).await?;
                }
            }
        }
        orphans.sort_unstable();

        let mut adopted = false;
        for index in orphans {
            match self.read_chunk(group, index).await {
                Ok(records) if !records.is_empty() => {
                    warn!(
                        "Adopting orphan history chunk {} of {}:{}:{}",
                        index, group.session_id, group.data_type, group.save_name
                    );
                    ptr.chunk_count = index + 1;
                    if let Some(last) = records.last() {
                        ptr.latest_game_time_id = ptr.latest_game_time_id.max(last.game_time_id);
                    }
                    adopted = true;
                }
                Ok(_) | Err(StoreError::NotFound) => {
                    self.store.delete(&group.chunk_key(index)).await?;
                }
                Err(StoreError::Fatal(e)) => {
                    warn!("Deleting undecodable orphan chunk {index}: {e}");
                    self.store.delete(&group.chunk_key(index)).await?;
                }
                Err(e) => return Err(e),
            }
        }
        if adopted {
            self.store.set_json(&group.ptr_key(), &ptr).await?;
        }
        Ok(())
    }
}

fn encode_chunk(records: &[HistoryRecord]) -> Result<Bytes, StoreError> {
    let json = serde_json::to_vec(records)
        .map_err(|e| StoreError::Fatal(format!("History chunk did not encode: {e}")))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .and_then(|()| encoder.finish())
        .map(Bytes::from)
        .map_err(|e| StoreError::Fatal(format!("History chunk did not compress: {e}")))
}

fn decode_chunk(bytes: &[u8]) -> Result<Vec<HistoryRecord>, StoreError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|e| StoreError::Fatal(format!("History chunk did not decompress: {e}")))?;
    serde_json::from_slice(&json)
        .map_err(|e| StoreError::Fatal(format!("History chunk did not decode: {e}")))
}

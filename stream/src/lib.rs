// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The per-client session event stream: a long-lived typed sequence the transport layer
//! writes out as line-delimited JSON. Hydration first (`initializing` until the session is
//! ready, then one `initial` carrying the full cache), then deltas in bus order interleaved
//! with heartbeats, then exactly one terminal `closed`.
//!
//! The bus subscription's bounded queue is the per-client back-pressure bound: when it
//! overflows, the bus drops the subscriber and the stream observes its channel closing, which
//! it converts into a `slow-consumer` close. Clients reconnect and re-hydrate.

use std::time::Duration;

use async_latch::AsyncLatch;
use bus::{EventBus, EventData};
use cache::{CachedState, SnapshotCache};
use futures::stream::BoxStream;
use identity::SessionId;
use log::debug;
use sessions::{SessionRegistry, Stage};
use upstream::{DataType, Payload};

#[derive(Clone, Debug, PartialEq)]
pub enum CloseReason {
    SessionDeleted,
    SlowConsumer,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::SessionDeleted => "session-deleted",
            CloseReason::SlowConsumer => "slow-consumer",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MessageKind {
    /// The session is not `Ready` yet; `Initial` follows as soon as it is.
    Initializing,
    /// Full-state hydration: the latest payload of every data type the session has seen.
    Initial(CachedState),
    /// Stream keep-alive, distinct from any upstream or lease heartbeat.
    Heartbeat,
    /// One delta: a fresh payload for one data type.
    Snapshot { data_type: DataType, payload: Payload },
    SaveChanged { save_name: String },
    /// The session record changed (stage, pause, online, rename).
    SessionUpdated,
    /// Terminal; nothing follows.
    Closed { reason: CloseReason },
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamMessage {
    pub session_id: SessionId,
    pub kind: MessageKind,
}

impl StreamMessage {
    ///
    /// The wire form: `{type, sessionId, data}`. Snapshot deltas use their data type's wire
    /// name as the message type, so clients can dispatch on `type` alone.
    ///
    pub fn to_wire(&self) -> serde_json::Value {
        let (message_type, data) = match &self.kind {
            MessageKind::Initializing => ("initializing".to_owned(), serde_json::Value::Null),
            MessageKind::Initial(state) => {
                let map = state
                    .iter()
                    .map(|(data_type, payload)| (data_type.as_str().to_owned(), payload.clone()))
                    .collect::<serde_json::Map<_, _>>();
                ("initial".to_owned(), serde_json::Value::Object(map))
            }
            MessageKind::Heartbeat => ("heartbeat".to_owned(), serde_json::Value::Null),
            MessageKind::Snapshot { data_type, payload } => {
                (data_type.as_str().to_owned(), payload.clone())
            }
            MessageKind::SaveChanged { save_name } => (
                "saveChanged".to_owned(),
                serde_json::json!({ "saveName": save_name }),
            ),
            MessageKind::SessionUpdated => ("sessionUpdated".to_owned(), serde_json::Value::Null),
            MessageKind::Closed { reason } => (
                "closed".to_owned(),
                serde_json::json!({ "reason": reason.as_str() }),
            ),
        };
        serde_json::json!({
            "type": message_type,
            "sessionId": self.session_id.as_str(),
            "data": data,
        })
    }
}

///
/// Open a stream for one client over one session. The returned sequence ends after its
/// `Closed` message; dropping it early unsubscribes from the bus and releases everything the
/// stream held.
///
pub fn open(
    session_id: SessionId,
    registry: SessionRegistry,
    cache: SnapshotCache,
    bus: EventBus,
    heartbeat_interval: Duration,
    shutdown: AsyncLatch,
) -> BoxStream<'static, StreamMessage> {
    Box::pin(async_stream::stream! {
        let message = |kind: MessageKind| StreamMessage {
            session_id: session_id.clone(),
            kind,
        };

        // Subscribe before hydrating, so deltas racing the snapshot are queued, not lost.
        let mut subscription = bus.subscribe(session_id.clone());

        if !registry.contains(&session_id) {
            yield message(MessageKind::Closed { reason: CloseReason::SessionDeleted });
            return;
        }

        let mut hydrated = false;
        if registry.get(&session_id).map(|s| s.stage) == Some(Stage::Ready) {
            yield message(MessageKind::Initial(cache.get_cached(&session_id)));
            hydrated = true;
        } else {
            yield message(MessageKind::Initializing);
        }

        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        // The first interval tick fires immediately; hydration already said hello.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.triggered() => {
                    yield message(MessageKind::Closed { reason: CloseReason::Shutdown });
                    return;
                }
                _ = heartbeat.tick() => {
                    // Belt and braces for a missed SessionUpdated: readiness is re-checked on
                    // the heartbeat cadence while unhydrated.
                    if !hydrated && registry.get(&session_id).map(|s| s.stage) == Some(Stage::Ready) {
                        yield message(MessageKind::Initial(cache.get_cached(&session_id)));
                        hydrated = true;
                    }
                    yield message(MessageKind::Heartbeat);
                }
                event = subscription.recv() => {
                    let Some(event) = event else {
                        // The bus dropped this subscriber: its queue overflowed.
                        debug!("Stream for session {session_id} fell behind; closing");
                        yield message(MessageKind::Closed { reason: CloseReason::SlowConsumer });
                        return;
                    };
                    match event.data {
                        EventData::Snapshot { data_type, payload } => {
                            // Deltas before hydration are folded into the coming `initial`.
                            if hydrated {
                                yield message(MessageKind::Snapshot { data_type, payload });
                            }
                        }
                        EventData::SaveChanged { save_name } => {
                            yield message(MessageKind::SaveChanged { save_name });
                        }
                        EventData::SessionUpdated => {
                            if !hydrated && registry.get(&session_id).map(|s| s.stage) == Some(Stage::Ready) {
                                yield message(MessageKind::Initial(cache.get_cached(&session_id)));
                                hydrated = true;
                            } else {
                                yield message(MessageKind::SessionUpdated);
                            }
                        }
                        EventData::SessionDeleted => {
                            yield message(MessageKind::Closed { reason: CloseReason::SessionDeleted });
                            return;
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod scenario_tests;

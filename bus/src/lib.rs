// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The typed event bus. Every event published here is fanned out twice: to in-process
//! subscribers over bounded queues, and to peer instances through the store's pubsub channel.
//! Producers are never blocked: a subscriber that cannot keep up is dropped and its channel
//! closed, which its stream observes as a slow-consumer teardown.

use std::sync::Arc;
use std::time::Duration;

use async_latch::AsyncLatch;
use futures::StreamExt;
use identity::{InstanceId, SessionId};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use store::Store;
use task_executor::Executor;
use tokio::sync::mpsc;
use upstream::{DataType, Payload};

/// The single well-known pubsub channel carrying serialized bus events between instances.
pub const RELAY_CHANNEL: &str = "telemetry:events";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EventData {
    /// A fresh snapshot for one data type.
    Snapshot { data_type: DataType, payload: Payload },
    /// The upstream reported a different save; derived state for the session was reset.
    SaveChanged { save_name: String },
    /// The session record changed (stage, pause state, online state, rename).
    SessionUpdated,
    /// The session was deleted; streams should send a terminal event and close.
    SessionDeleted,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub data: EventData,
}

/// The cross-instance envelope: the source tag lets receivers drop their own frames.
#[derive(Serialize, Deserialize)]
struct RelayFrame {
    source: InstanceId,
    event: Event,
}

type Filter = Box<dyn Fn(&Event) -> bool + Send + 'static>;

///
/// A synchronous observer of every event this bus dispatches, local or relayed. Taps are how
/// an instance's cache follows sessions it does not own: snapshots it never produced still
/// arrive through the relay and land in the local cache before any subscriber sees them.
///
pub type EventTap = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscriber {
    session_id: SessionId,
    filter: Option<Filter>,
    sender: mpsc::Sender<Event>,
}

///
/// A subscription to one session's events. Dropping the receiver is enough to unsubscribe:
/// the bus discards closed subscribers on its next dispatch.
///
pub struct Subscription {
    receiver: mpsc::Receiver<Event>,
}

impl Subscription {
    ///
    /// The next event, or None once the subscription is finished: either this subscriber was
    /// dropped for falling behind, or the bus itself shut down.
    ///
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }
}

#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    taps: Arc<Mutex<Vec<EventTap>>>,
    store: Store,
    instance_id: InstanceId,
    queue_size: usize,
}

impl EventBus {
    pub fn new(store: Store, instance_id: InstanceId, queue_size: usize) -> EventBus {
        EventBus {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            taps: Arc::new(Mutex::new(Vec::new())),
            store,
            instance_id,
            queue_size,
        }
    }

    /// Register a tap. Taps must be cheap and non-blocking: they run on the dispatch path.
    pub fn add_tap(&self, tap: EventTap) {
        self.taps.lock().push(tap);
    }

    ///
    /// Publish an event: local fan-out first (so subscribers on the owning instance observe
    /// producer order), then the cross-instance relay. Relay failures are logged and dropped;
    /// peers re-hydrate from snapshots, so a lost frame is not replayed.
    ///
    pub async fn publish(&self, event: Event) {
        self.dispatch_local(&event);

        let frame = RelayFrame {
            source: self.instance_id.clone(),
            event,
        };
        let payload = match serde_json::to_vec(&frame) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping unserializable bus event: {e}");
                return;
            }
        };
        if let Err(e) = self.store.publish(RELAY_CHANNEL, payload.into()).await {
            warn!("Could not relay bus event to peers: {e}");
        }
    }

    pub fn subscribe(&self, session_id: SessionId) -> Subscription {
        self.subscribe_filtered(session_id, None)
    }

    ///
    /// Subscribe with an additional predicate over matching events. The session filter always
    /// applies; the predicate narrows within the session.
    ///
    pub fn subscribe_filtered(
        &self,
        session_id: SessionId,
        filter: Option<Filter>,
    ) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.queue_size);
        self.subscribers.lock().push(Subscriber {
            session_id,
            filter,
            sender,
        });
        Subscription { receiver }
    }

    /// The number of live subscribers, for tests and introspection.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn dispatch_local(&self, event: &Event) {
        for tap in self.taps.lock().iter() {
            tap(event);
        }
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| {
            if subscriber.session_id != event.session_id {
                return true;
            }
            if let Some(filter) = &subscriber.filter {
                if !filter(event) {
                    return true;
                }
            }
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Overflow policy: drop and close, never block the producer. The closed
                    // channel is the subscriber's slow-consumer signal.
                    warn!(
                        "Dropping slow subscriber of session {}: queue of {} overflowed",
                        event.session_id, self.queue_size
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!("Discarding closed subscriber of session {}", event.session_id);
                    false
                }
            }
        });
    }

    ///
    /// Start the relay dispatcher: a background task that subscribes to the well-known channel
    /// and fans peer events out locally, suppressing frames this instance published. The
    /// subscription is re-established with a short pause if the connection drops; events
    /// published while disconnected are not replayed.
    ///
    pub fn start_relay(&self, executor: &Executor, shutdown: AsyncLatch) {
        let bus = self.clone();
        let _join = executor.native_spawn(async move {
            loop {
                let mut stream = tokio::select! {
                    _ = shutdown.triggered() => break,
                    subscribed = bus.store.subscribe(RELAY_CHANNEL) => match subscribed {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!("Could not subscribe to the event relay: {e}");
                            tokio::select! {
                                _ = shutdown.triggered() => break,
                                _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                            }
                        }
                    },
                };
                debug!("Event relay subscribed to {RELAY_CHANNEL}");

                loop {
                    let frame = tokio::select! {
                        _ = shutdown.triggered() => return,
                        frame = stream.next() => frame,
                    };
                    let Some(bytes) = frame else {
                        warn!("Event relay subscription lost; resubscribing");
                        break;
                    };
                    match serde_json::from_slice::<RelayFrame>(&bytes) {
                        Ok(frame) if frame.source == bus.instance_id => {
                            // Loopback: this instance already dispatched the event locally.
                        }
                        Ok(frame) => bus.dispatch_local(&frame.event),
                        Err(e) => warn!("Dropping undecodable relay frame: {e}"),
                    }
                }
            }
        });
    }
}

// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

///
/// A one-shot condition used to request cooperative shutdown of the tasks that hold a clone of
/// it: the daemon owns a root latch cloned into every background loop, and each session poller
/// carries its own so it can be stopped without stopping the world.
///
/// Triggering is sticky: once triggered, every current and future `triggered().await` completes
/// immediately, and further calls to `trigger` are noops.
///
#[derive(Clone)]
pub struct AsyncLatch {
    sender: Arc<Mutex<watch::Sender<bool>>>,
    receiver: watch::Receiver<bool>,
}

impl AsyncLatch {
    pub fn new() -> AsyncLatch {
        let (sender, receiver) = watch::channel(false);
        AsyncLatch {
            sender: Arc::new(Mutex::new(sender)),
            receiver,
        }
    }

    ///
    /// Mark this latch triggered, releasing all tasks that are waiting for it to trigger.
    ///
    pub fn trigger(&self) {
        let _ = self.sender.lock().send(true);
    }

    ///
    /// Wait for another task to trigger this latch.
    ///
    pub async fn triggered(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                // The sender is held alive by this struct, so this is unreachable in practice,
                // but treating a closed channel as triggered is the safe reading.
                return;
            }
        }
    }

    ///
    /// Return true if the latch has been triggered.
    ///
    pub fn poll_triggered(&self) -> bool {
        *self.receiver.borrow()
    }
}

#[cfg(test)]
mod tests;

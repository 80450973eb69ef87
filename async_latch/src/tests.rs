// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use crate::AsyncLatch;

#[tokio::test]
async fn basic() {
    let latch = AsyncLatch::new();

    let mut join = tokio::spawn({
        let latch = latch.clone();
        async move { latch.triggered().await }
    });

    // Ensure that `triggered` doesn't return until `trigger` has been called.
    tokio::select! {
      _ = tokio::time::sleep(Duration::from_millis(100)) => {},
      _ = &mut join => { panic!("Background task should have continued to wait.") }
    }
    assert!(!latch.poll_triggered());
    latch.trigger();
    join.await.unwrap();
    assert!(latch.poll_triggered());

    // And that calling `trigger` again is harmless.
    latch.trigger();
}

#[tokio::test]
async fn trigger_before_wait() {
    let latch = AsyncLatch::new();
    latch.trigger();

    // A waiter that arrives after the trigger must not block.
    latch.triggered().await;
    assert!(latch.poll_triggered());
}

#[tokio::test]
async fn releases_all_clones() {
    let latch = AsyncLatch::new();
    let waiters = (0..4)
        .map(|_| {
            let latch = latch.clone();
            tokio::spawn(async move { latch.triggered().await })
        })
        .collect::<Vec<_>>();

    latch.trigger();
    for waiter in waiters {
        waiter.await.unwrap();
    }
}

// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::Executor;

#[tokio::test]
async fn spawn_and_join() {
    let executor = Executor::new();
    let value = executor.spawn(async { 40 + 2 }, |e| panic!("join error: {e}")).await;
    assert_eq!(value, 42);
}

#[tokio::test]
async fn spawn_blocking_runs_off_thread() {
    let executor = Executor::new();
    let value = executor
        .spawn_blocking(|| 21 * 2, |e| panic!("join error: {e}"))
        .await;
    assert_eq!(value, 42);
}

#[tokio::test]
async fn borrowed_executor_is_always_shutdown() {
    let executor = Executor::new();
    assert!(executor.is_shutdown());
    let borrowed = executor.to_borrowed();
    assert!(borrowed.is_shutdown());
}

#[tokio::test]
async fn spawn_outlives_dropped_handle() {
    let executor = Executor::new();
    let (sender, receiver) = tokio::sync::oneshot::channel::<usize>();
    // Dropping the returned future must not cancel the spawned task.
    let fut = executor.spawn(
        async move {
            let _ = sender.send(42);
        },
        |_| (),
    );
    drop(fut);
    assert_eq!(receiver.await, Ok(42));
}

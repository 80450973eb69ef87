// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The daemon shell: wires the store, bus, cache, history, lease and session manager together,
//! then runs until SIGTERM/ctrl-c. The upstream client here is the synthetic fixture; the
//! real network client is a collaborator injected by the embedding service. This binary exists
//! to run the core standalone and to demo it against generated data.

mod synthetic;

use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use async_latch::AsyncLatch;
use bus::EventBus;
use cache::SnapshotCache;
use clap::Parser;
use history::HistoryStore;
use identity::{InstanceId, SessionId};
use lease::{LeaseConfig, LeaseManager};
use log::{info, warn};
use options::Config;
use sessions::{SessionManager, SessionManagerDeps, SessionRegistry};
use store::{RedisStore, Store};
use task_executor::Executor;

use crate::synthetic::SyntheticClientFactory;

#[derive(Parser)]
#[command(name = "telemetryd", about = "Multi-tenant telemetry aggregation daemon")]
struct Opts {
    /// Worker threads for the runtime; defaults to the machine's parallelism.
    #[arg(long)]
    worker_threads: Option<usize>,

    /// Create this many synthetic demo sessions at startup if they do not exist yet.
    #[arg(long, default_value_t = 0)]
    synthetic_sessions: usize,
}

fn main() {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let opts = Opts::parse();

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            exit(2);
        }
    };

    let worker_threads = opts
        .worker_threads
        .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
        .unwrap_or(4);
    let executor = match Executor::new_owned(worker_threads, worker_threads * 4) {
        Ok(executor) => executor,
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
    };

    let result = executor.block_on(run(executor.clone(), config, opts));
    executor.shutdown(Duration::from_secs(5));
    if let Err(e) = result {
        eprintln!("{e}");
        exit(1);
    }
}

async fn run(executor: Executor, config: Arc<Config>, opts: Opts) -> Result<(), String> {
    let instance_id = config
        .instance_name
        .clone()
        .map(InstanceId::new)
        .unwrap_or_else(InstanceId::derive);
    info!("Starting telemetryd as instance {instance_id}");

    let redis = RedisStore::connect(&config.redis_url, config.redis_password.as_deref()).await?;
    let store = Store::new(Arc::new(redis), config.store_timeout);

    let shutdown = AsyncLatch::new();
    let bus = EventBus::new(store.clone(), instance_id.clone(), config.subscriber_queue_size);
    bus.start_relay(&executor, shutdown.clone());

    let registry = SessionRegistry::new(store.clone());
    let cache = SnapshotCache::new();
    let history = HistoryStore::new(
        store.clone(),
        config.history_chunk_size,
        config.history_max_chunks,
    );
    let lease = LeaseManager::new(
        store,
        instance_id,
        LeaseConfig {
            lease_ttl: config.lease_ttl,
            renewal_interval: config.lease_renewal_interval,
            heartbeat_ttl: config.heartbeat_ttl,
            heartbeat_interval: config.heartbeat_interval,
            node_discovery_interval: config.node_discovery_interval,
        },
        Arc::new(registry.clone()),
    );

    let manager = SessionManager::new(
        executor.clone(),
        SessionManagerDeps {
            registry,
            lease,
            bus,
            cache,
            history,
            clients: Arc::new(SyntheticClientFactory::new()),
            config: config.clone(),
        },
    );
    manager
        .start(shutdown.clone())
        .await
        .map_err(|e| format!("Could not start the session manager: {e}"))?;

    for n in 0..opts.synthetic_sessions {
        let id = SessionId::new(format!("synthetic-{n}"));
        if manager.session(&id).is_none() {
            manager
                .create_session(id.clone(), format!("Synthetic {n}"), None)
                .await
                .map_err(|e| format!("Could not create synthetic session {id}: {e}"))?;
            info!("Created synthetic session {id}");
        }
    }

    wait_for_termination().await;
    info!("Shutting down");
    shutdown.trigger();
    // Give the reconciliation and lease loops a moment to cancel pollers and return leases;
    // TTLs cover whatever does not make it out.
    tokio::time::sleep(Duration::from_secs(2)).await;
    Ok(())
}

async fn wait_for_termination() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("Could not install SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

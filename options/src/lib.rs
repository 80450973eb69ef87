// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Read-only service configuration, captured from `TELEMETRYD_`-prefixed environment variables
//! and validated once at startup. Everything downstream takes an immutable reference; nothing
//! re-reads the environment after boot.

use std::collections::{HashMap, HashSet};
use std::env;
use std::time::Duration;

use upstream::{CadenceGroup, DataType};

#[derive(Clone, Debug)]
pub struct Config {
    /// Store connection.
    pub redis_url: String,
    pub redis_password: Option<String>,

    /// Stable identity override for lease/heartbeat; defaults to hostname+pid when unset.
    pub instance_name: Option<String>,

    /// Lease and membership timing.
    pub lease_ttl: Duration,
    pub lease_renewal_interval: Duration,
    pub heartbeat_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub node_discovery_interval: Duration,
    pub reconciliation_interval: Duration,

    /// Per-call deadlines.
    pub upstream_timeout: Duration,
    pub store_timeout: Duration,

    /// Consecutive upstream failures before a session is marked offline.
    pub failure_threshold: u32,

    /// History ring shape: records per chunk, and how many chunks to retain per
    /// (session, dataType, save) group. Zero retains everything.
    pub history_chunk_size: usize,
    pub history_max_chunks: u64,

    /// Poll periods for the three cadence groups.
    pub poll_interval_fast: Duration,
    pub poll_interval_medium: Duration,
    pub poll_interval_slow: Duration,

    /// Period of the session-info probe that feeds save-change detection and the game clock.
    pub session_info_interval: Duration,

    /// Data types that must each have produced one snapshot before a session is `ready`.
    pub critical_data_types: HashSet<DataType>,

    /// Bounded queue size for each event-bus subscriber.
    pub subscriber_queue_size: usize,

    /// Keep-alive period for session event streams.
    pub stream_heartbeat_interval: Duration,
}

const ENV_PREFIX: &str = "TELEMETRYD_";

impl Config {
    pub fn from_env() -> Result<Config, String> {
        Self::from_vars(
            env::vars()
                .filter_map(|(k, v)| {
                    k.strip_prefix(ENV_PREFIX)
                        .map(|stripped| (stripped.to_owned(), v))
                })
                .collect(),
        )
    }

    ///
    /// Build from pre-stripped variable names (`LEASE_TTL`, not `TELEMETRYD_LEASE_TTL`).
    /// Durations are integer seconds.
    ///
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Config, String> {
        let secs = |name: &str, default: u64| -> Result<Duration, String> {
            match vars.get(name) {
                None => Ok(Duration::from_secs(default)),
                Some(raw) => raw
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| format!("{ENV_PREFIX}{name} must be an integer number of seconds, got {raw:?}")),
            }
        };
        let int = |name: &str, default: u64| -> Result<u64, String> {
            match vars.get(name) {
                None => Ok(default),
                Some(raw) => raw
                    .parse::<u64>()
                    .map_err(|_| format!("{ENV_PREFIX}{name} must be an integer, got {raw:?}")),
            }
        };

        let lease_ttl = secs("LEASE_TTL", 30)?;
        let heartbeat_ttl = secs("HEARTBEAT_TTL", 30)?;
        let lease_renewal_interval = match vars.get("LEASE_RENEWAL_INTERVAL") {
            Some(_) => secs("LEASE_RENEWAL_INTERVAL", 0)?,
            None => lease_ttl / 3,
        };
        let heartbeat_interval = match vars.get("HEARTBEAT_INTERVAL") {
            Some(_) => secs("HEARTBEAT_INTERVAL", 0)?,
            None => heartbeat_ttl / 3,
        };

        let critical_data_types = match vars.get("CRITICAL_DATA_TYPES") {
            None => CadenceGroup::Fast.data_types().collect(),
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(|name| {
                    name.parse::<DataType>()
                        .map_err(|e| format!("{ENV_PREFIX}CRITICAL_DATA_TYPES: {e}"))
                })
                .collect::<Result<HashSet<_>, String>>()?,
        };

        let config = Config {
            redis_url: vars
                .get("REDIS_URL")
                .cloned()
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_owned()),
            redis_password: vars.get("REDIS_PASSWORD").cloned(),
            instance_name: vars.get("INSTANCE_NAME").cloned(),
            lease_ttl,
            lease_renewal_interval,
            heartbeat_ttl,
            heartbeat_interval,
            node_discovery_interval: secs("NODE_DISCOVERY_INTERVAL", 10)?,
            reconciliation_interval: secs("RECONCILIATION_INTERVAL", 5)?,
            upstream_timeout: secs("UPSTREAM_TIMEOUT", 5)?,
            store_timeout: secs("STORE_TIMEOUT", 2)?,
            failure_threshold: int("FAILURE_THRESHOLD", 5)? as u32,
            history_chunk_size: int("HISTORY_CHUNK_SIZE", 100)? as usize,
            history_max_chunks: int("HISTORY_MAX_CHUNKS", 0)?,
            poll_interval_fast: secs("POLL_INTERVAL_FAST", 4)?,
            poll_interval_medium: secs("POLL_INTERVAL_MEDIUM", 30)?,
            poll_interval_slow: secs("POLL_INTERVAL_SLOW", 120)?,
            session_info_interval: secs("SESSION_INFO_INTERVAL", 30)?,
            critical_data_types,
            subscriber_queue_size: int("SUBSCRIBER_QUEUE_SIZE", 256)? as usize,
            stream_heartbeat_interval: secs("STREAM_HEARTBEAT_INTERVAL", 15)?,
        };
        config.validated()
    }

    pub fn poll_interval(&self, group: CadenceGroup) -> Duration {
        match group {
            CadenceGroup::Fast => self.poll_interval_fast,
            CadenceGroup::Medium => self.poll_interval_medium,
            CadenceGroup::Slow => self.poll_interval_slow,
        }
    }

    fn validated(self) -> Result<Config, String> {
        let at_least_a_second: [(&str, Duration); 9] = [
            ("LEASE_TTL", self.lease_ttl),
            ("HEARTBEAT_TTL", self.heartbeat_ttl),
            ("NODE_DISCOVERY_INTERVAL", self.node_discovery_interval),
            ("RECONCILIATION_INTERVAL", self.reconciliation_interval),
            ("UPSTREAM_TIMEOUT", self.upstream_timeout),
            ("STORE_TIMEOUT", self.store_timeout),
            ("POLL_INTERVAL_FAST", self.poll_interval_fast),
            ("SESSION_INFO_INTERVAL", self.session_info_interval),
            ("STREAM_HEARTBEAT_INTERVAL", self.stream_heartbeat_interval),
        ];
        for (name, value) in at_least_a_second {
            if value < Duration::from_secs(1) {
                return Err(format!("{ENV_PREFIX}{name} must be at least 1 second"));
            }
        }
        if self.lease_renewal_interval >= self.lease_ttl {
            return Err(format!(
                "{ENV_PREFIX}LEASE_RENEWAL_INTERVAL must be less than the lease TTL, or renewals cannot keep a lease alive"
            ));
        }
        if self.heartbeat_interval >= self.heartbeat_ttl {
            return Err(format!(
                "{ENV_PREFIX}HEARTBEAT_INTERVAL must be less than the heartbeat TTL"
            ));
        }
        if self.history_chunk_size == 0 {
            return Err(format!(
                "{ENV_PREFIX}HISTORY_CHUNK_SIZE must hold at least one record"
            ));
        }
        if self.critical_data_types.is_empty() {
            return Err(format!(
                "{ENV_PREFIX}CRITICAL_DATA_TYPES must name at least one data type: an empty set would mark every session ready before any data arrived"
            ));
        }
        if self.subscriber_queue_size == 0 {
            return Err(format!(
                "{ENV_PREFIX}SUBSCRIBER_QUEUE_SIZE must be at least 1"
            ));
        }
        Ok(self)
    }
}

impl Default for Config {
    /// The documented defaults, as produced by an empty environment.
    fn default() -> Config {
        Config::from_vars(HashMap::new()).expect("defaults are valid")
    }
}

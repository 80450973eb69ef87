// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The capability surface the session poller consumes: one method per data type, plus the
//! session-info and connectivity probes. Implementations are injected at startup (a real
//! network client in production, `testutil::MockUpstream` in tests and demos) and the core
//! stays agnostic of how the bytes arrive.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};

/// Payloads are normalized JSON: the closed `DataType` set is the type tag, and per-endpoint
/// response shapes are the concrete client's concern.
pub type Payload = serde_json::Value;

///
/// The closed set of data types the service aggregates. The wire name of each variant doubles
/// as its event type on the session event stream.
///
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataType {
    Circuits,
    FactoryStats,
    ProdStats,
    GeneratorStats,
    SinkStats,
    Players,
    Trains,
    TrainStations,
    Drones,
    DroneStations,
    Machines,
    Schematics,
    SpaceElevator,
    Hub,
    RadarTowers,
    ResourceNodes,
    VehiclePaths,
    Tractors,
    Explorers,
    Belts,
    Pipes,
    Cables,
    TrainRails,
}

///
/// Data types are polled in three groups: dynamic state every few seconds, semi-static state
/// on a medium period, and infrastructure geometry on a slow one. The concrete periods come
/// from configuration; the grouping itself is fixed.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CadenceGroup {
    Fast,
    Medium,
    Slow,
}

impl CadenceGroup {
    pub const ALL: [CadenceGroup; 3] = [CadenceGroup::Fast, CadenceGroup::Medium, CadenceGroup::Slow];

    pub fn data_types(self) -> impl Iterator<Item = DataType> {
        DataType::ALL.iter().copied().filter(move |dt| dt.cadence() == self)
    }

    pub fn name(self) -> &'static str {
        match self {
            CadenceGroup::Fast => "fast",
            CadenceGroup::Medium => "medium",
            CadenceGroup::Slow => "slow",
        }
    }
}

impl DataType {
    pub const ALL: [DataType; 23] = [
        DataType::Circuits,
        DataType::FactoryStats,
        DataType::ProdStats,
        DataType::GeneratorStats,
        DataType::SinkStats,
        DataType::Players,
        DataType::Trains,
        DataType::TrainStations,
        DataType::Drones,
        DataType::DroneStations,
        DataType::Machines,
        DataType::Schematics,
        DataType::SpaceElevator,
        DataType::Hub,
        DataType::RadarTowers,
        DataType::ResourceNodes,
        DataType::VehiclePaths,
        DataType::Tractors,
        DataType::Explorers,
        DataType::Belts,
        DataType::Pipes,
        DataType::Cables,
        DataType::TrainRails,
    ];

    pub fn cadence(self) -> CadenceGroup {
        match self {
            DataType::Circuits
            | DataType::FactoryStats
            | DataType::ProdStats
            | DataType::GeneratorStats
            | DataType::SinkStats
            | DataType::Players
            | DataType::Trains
            | DataType::TrainStations
            | DataType::Drones
            | DataType::DroneStations
            | DataType::Machines => CadenceGroup::Fast,
            DataType::Schematics
            | DataType::SpaceElevator
            | DataType::Hub
            | DataType::RadarTowers
            | DataType::ResourceNodes
            | DataType::VehiclePaths
            | DataType::Tractors
            | DataType::Explorers => CadenceGroup::Medium,
            DataType::Belts | DataType::Pipes | DataType::Cables | DataType::TrainRails => {
                CadenceGroup::Slow
            }
        }
    }

    /// The camelCase wire name, as used in persisted history keys and stream event types.
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Circuits => "circuits",
            DataType::FactoryStats => "factoryStats",
            DataType::ProdStats => "prodStats",
            DataType::GeneratorStats => "generatorStats",
            DataType::SinkStats => "sinkStats",
            DataType::Players => "players",
            DataType::Trains => "trains",
            DataType::TrainStations => "trainStations",
            DataType::Drones => "drones",
            DataType::DroneStations => "droneStations",
            DataType::Machines => "machines",
            DataType::Schematics => "schematics",
            DataType::SpaceElevator => "spaceElevator",
            DataType::Hub => "hub",
            DataType::RadarTowers => "radarTowers",
            DataType::ResourceNodes => "resourceNodes",
            DataType::VehiclePaths => "vehiclePaths",
            DataType::Tractors => "tractors",
            DataType::Explorers => "explorers",
            DataType::Belts => "belts",
            DataType::Pipes => "pipes",
            DataType::Cables => "cables",
            DataType::TrainRails => "trainRails",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<DataType, String> {
        DataType::ALL
            .iter()
            .copied()
            .find(|dt| dt.as_str() == s)
            .ok_or_else(|| format!("Unrecognized data type: {s}"))
    }
}

///
/// The session-info probe result: the save the upstream is currently running, and the in-game
/// elapsed-seconds counter that serves as the monotonic history coordinate.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_name: String,
    pub passed_real_seconds: u64,
}

/// Classified failure of one upstream call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UpstreamError {
    /// The upstream is unreachable or answered with a server failure.
    Down(String),
    /// The per-call deadline elapsed.
    Timeout,
    /// The upstream answered, but the response did not decode.
    Decode(String),
    /// A failure worth retrying on the next tick that says nothing about upstream health.
    Transient(String),
}

impl UpstreamError {
    ///
    /// Whether this error counts against the session's failure threshold. Decode and transient
    /// failures do not: the upstream answered, so the session is not disconnected.
    ///
    pub fn counts_as_failure(&self) -> bool {
        matches!(self, UpstreamError::Down(_) | UpstreamError::Timeout)
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::Down(msg) => write!(f, "upstream down: {msg}"),
            UpstreamError::Timeout => write!(f, "upstream timed out"),
            UpstreamError::Decode(msg) => write!(f, "upstream response did not decode: {msg}"),
            UpstreamError::Transient(msg) => write!(f, "transient upstream failure: {msg}"),
        }
    }
}

impl std::error::Error for UpstreamError {}

///
/// One method per data type, plus the probes. The poller only ever goes through `fetch`, which
/// dispatches on the closed `DataType` set; the per-type methods exist so that concrete clients
/// map one-to-one onto the upstream's REST surface.
///
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn get_session_info(&self) -> Result<SessionInfo, UpstreamError>;

    /// Connectivity probe; a successful return means the upstream is reachable and healthy.
    async fn get_api_status(&self) -> Result<(), UpstreamError>;

    async fn get_circuits(&self) -> Result<Payload, UpstreamError>;
    async fn get_factory_stats(&self) -> Result<Payload, UpstreamError>;
    async fn get_prod_stats(&self) -> Result<Payload, UpstreamError>;
    async fn get_generator_stats(&self) -> Result<Payload, UpstreamError>;
    async fn get_sink_stats(&self) -> Result<Payload, UpstreamError>;
    async fn list_players(&self) -> Result<Payload, UpstreamError>;
    async fn list_trains(&self) -> Result<Payload, UpstreamError>;
    async fn list_train_stations(&self) -> Result<Payload, UpstreamError>;
    async fn list_drones(&self) -> Result<Payload, UpstreamError>;
    async fn list_drone_stations(&self) -> Result<Payload, UpstreamError>;
    async fn get_machines(&self) -> Result<Payload, UpstreamError>;
    async fn list_schematics(&self) -> Result<Payload, UpstreamError>;
    async fn get_space_elevator(&self) -> Result<Payload, UpstreamError>;
    async fn get_hub(&self) -> Result<Payload, UpstreamError>;
    async fn list_radar_towers(&self) -> Result<Payload, UpstreamError>;
    async fn list_resource_nodes(&self) -> Result<Payload, UpstreamError>;
    async fn list_vehicle_paths(&self) -> Result<Payload, UpstreamError>;
    async fn list_tractors(&self) -> Result<Payload, UpstreamError>;
    async fn list_explorers(&self) -> Result<Payload, UpstreamError>;
    async fn list_belts(&self) -> Result<Payload, UpstreamError>;
    async fn list_pipes(&self) -> Result<Payload, UpstreamError>;
    async fn list_cables(&self) -> Result<Payload, UpstreamError>;
    async fn list_train_rails(&self) -> Result<Payload, UpstreamError>;

    /// Dispatch to the method matching `data_type`.
    async fn fetch(&self, data_type: DataType) -> Result<Payload, UpstreamError> {
        match data_type {
            DataType::Circuits => self.get_circuits().await,
            DataType::FactoryStats => self.get_factory_stats().await,
            DataType::ProdStats => self.get_prod_stats().await,
            DataType::GeneratorStats => self.get_generator_stats().await,
            DataType::SinkStats => self.get_sink_stats().await,
            DataType::Players => self.list_players().await,
            DataType::Trains => self.list_trains().await,
            DataType::TrainStations => self.list_train_stations().await,
            DataType::Drones => self.list_drones().await,
            DataType::DroneStations => self.list_drone_stations().await,
            DataType::Machines => self.get_machines().await,
            DataType::Schematics => self.list_schematics().await,
            DataType::SpaceElevator => self.get_space_elevator().await,
            DataType::Hub => self.get_hub().await,
            DataType::RadarTowers => self.list_radar_towers().await,
            DataType::ResourceNodes => self.list_resource_nodes().await,
            DataType::VehiclePaths => self.list_vehicle_paths().await,
            DataType::Tractors => self.list_tractors().await,
            DataType::Explorers => self.list_explorers().await,
            DataType::Belts => self.list_belts().await,
            DataType::Pipes => self.list_pipes().await,
            DataType::Cables => self.list_cables().await,
            DataType::TrainRails => self.list_train_rails().await,
        }
    }
}

#[cfg(test)]
mod tests;

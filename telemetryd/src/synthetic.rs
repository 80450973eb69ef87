// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use log::warn;
use sessions::{Session, UpstreamClientFactory};
use upstream::{DataType, Payload, SessionInfo, UpstreamClient, UpstreamError};

///
/// The demo fixture: answers every endpoint with generated data that drifts over time, so a
/// poller sees changed payloads at a realistic rhythm without any game server behind it. The
/// in-game clock is wall time since the client was created.
///
pub struct SyntheticUpstream {
    session_name: String,
    started: Instant,
}

impl SyntheticUpstream {
    pub fn new(session_name: String) -> SyntheticUpstream {
        SyntheticUpstream {
            session_name,
            started: Instant::now(),
        }
    }

    fn elapsed_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    fn generate(&self, data_type: DataType) -> Result<Payload, UpstreamError> {
        // Buckets the clock so payloads change every few seconds rather than every call.
        let sample = self.elapsed_seconds() / 5;
        Ok(serde_json::json!({
            "dataType": data_type.as_str(),
            "sample": sample,
        }))
    }
}

#[async_trait]
impl UpstreamClient for SyntheticUpstream {
    async fn get_session_info(&self) -> Result<SessionInfo, UpstreamError> {
        Ok(SessionInfo {
            session_name: self.session_name.clone(),
            passed_real_seconds: self.elapsed_seconds(),
        })
    }

    async fn get_api_status(&self) -> Result<(), UpstreamError> {
        Ok(())
    }

    async fn get_circuits(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::Circuits)
    }

    async fn get_factory_stats(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::FactoryStats)
    }

    async fn get_prod_stats(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::ProdStats)
    }

    async fn get_generator_stats(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::GeneratorStats)
    }

    async fn get_sink_stats(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::SinkStats)
    }

    async fn list_players(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::Players)
    }

    async fn list_trains(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::Trains)
    }

    async fn list_train_stations(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::TrainStations)
    }

    async fn list_drones(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::Drones)
    }

    async fn list_drone_stations(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::DroneStations)
    }

    async fn get_machines(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::Machines)
    }

    async fn list_schematics(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::Schematics)
    }

    async fn get_space_elevator(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::SpaceElevator)
    }

    async fn get_hub(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::Hub)
    }

    async fn list_radar_towers(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::RadarTowers)
    }

    async fn list_resource_nodes(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::ResourceNodes)
    }

    async fn list_vehicle_paths(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::VehiclePaths)
    }

    async fn list_tractors(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::Tractors)
    }

    async fn list_explorers(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::Explorers)
    }

    async fn list_belts(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::Belts)
    }

    async fn list_pipes(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::Pipes)
    }

    async fn list_cables(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::Cables)
    }

    async fn list_train_rails(&self) -> Result<Payload, UpstreamError> {
        self.generate(DataType::TrainRails)
    }
}

/// Serves the synthetic fixture for every session. The embedding service swaps this factory
/// for one that builds real REST clients from the session's address.
pub struct SyntheticClientFactory;

impl SyntheticClientFactory {
    pub fn new() -> SyntheticClientFactory {
        SyntheticClientFactory
    }
}

impl UpstreamClientFactory for SyntheticClientFactory {
    fn client_for(&self, session: &Session) -> Arc<dyn UpstreamClient> {
        if let Some(address) = &session.address {
            warn!(
                "Session {} has upstream address {address} but this build only carries the synthetic client",
                session.id
            );
        }
        Arc::new(SyntheticUpstream::new(format!("{}_World", session.name)))
    }
}

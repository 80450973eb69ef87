// Copyright 2023 Telemetryd project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use upstream::{DataType, Payload, SessionInfo, UpstreamClient, UpstreamError};

struct Inner {
    payloads: HashMap<DataType, Result<Payload, UpstreamError>>,
    session_info: Result<SessionInfo, UpstreamError>,
    api_status: Result<(), UpstreamError>,
    fetch_counts: HashMap<DataType, usize>,
    session_info_count: usize,
}

///
/// A scriptable `UpstreamClient`: tests install payloads or failures per data type and assert
/// on call counts. Data types with nothing installed answer with an empty JSON object, so a
/// poller pointed at a fresh mock makes progress on every endpoint.
///
#[derive(Clone)]
pub struct MockUpstream {
    inner: Arc<Mutex<Inner>>,
}

impl MockUpstream {
    pub fn new() -> MockUpstream {
        MockUpstream {
            inner: Arc::new(Mutex::new(Inner {
                payloads: HashMap::new(),
                session_info: Ok(SessionInfo {
                    session_name: "Save_A".to_owned(),
                    passed_real_seconds: 0,
                }),
                api_status: Ok(()),
                fetch_counts: HashMap::new(),
                session_info_count: 0,
            })),
        }
    }

    pub fn set_payload(&self, data_type: DataType, payload: Payload) {
        self.inner.lock().payloads.insert(data_type, Ok(payload));
    }

    pub fn fail(&self, data_type: DataType, error: UpstreamError) {
        self.inner.lock().payloads.insert(data_type, Err(error));
    }

    /// Make every endpoint, including the probes, fail with a clone of `error`.
    pub fn fail_all(&self, error: UpstreamError) {
        let mut inner = self.inner.lock();
        for dt in DataType::ALL {
            inner.payloads.insert(dt, Err(error.clone()));
        }
        inner.session_info = Err(error.clone());
        inner.api_status = Err(error);
    }

    /// Restore every endpoint to success; payloads previously installed are kept.
    pub fn heal(&self) {
        let mut inner = self.inner.lock();
        inner.payloads.retain(|_, result| result.is_ok());
        let session_name = match &inner.session_info {
            Ok(info) => info.session_name.clone(),
            Err(_) => "Save_A".to_owned(),
        };
        inner.session_info = Ok(SessionInfo {
            session_name,
            passed_real_seconds: 0,
        });
        inner.api_status = Ok(());
    }

    pub fn set_session_info(&self, info: SessionInfo) {
        self.inner.lock().session_info = Ok(info);
    }

    pub fn fetch_count(&self, data_type: DataType) -> usize {
        self.inner
            .lock()
            .fetch_counts
            .get(&data_type)
            .copied()
            .unwrap_or(0)
    }

    pub fn session_info_count(&self) -> usize {
        self.inner.lock().session_info_count
    }

    fn resolve(&self, data_type: DataType) -> Result<Payload, UpstreamError> {
        let mut inner = self.inner.lock();
        *inner.fetch_counts.entry(data_type).or_insert(0) += 1;
        inner
            .payloads
            .get(&data_type)
            .cloned()
            .unwrap_or_else(|| Ok(serde_json::json!({})))
    }
}

#[async_trait]
impl UpstreamClient for MockUpstream {
    async fn get_session_info(&self) -> Result<SessionInfo, UpstreamError> {
        let mut inner = self.inner.lock();
        inner.session_info_count += 1;
        inner.session_info.clone()
    }

    async fn get_api_status(&self) -> Result<(), UpstreamError> {
        self.inner.lock().api_status.clone()
    }

    async fn get_circuits(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::Circuits)
    }

    async fn get_factory_stats(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::FactoryStats)
    }

    async fn get_prod_stats(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::ProdStats)
    }

    async fn get_generator_stats(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::GeneratorStats)
    }

    async fn get_sink_stats(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::SinkStats)
    }

    async fn list_players(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::Players)
    }

    async fn list_trains(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::Trains)
    }

    async fn list_train_stations(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::TrainStations)
    }

    async fn list_drones(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::Drones)
    }

    async fn list_drone_stations(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::DroneStations)
    }

    async fn get_machines(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::Machines)
    }

    async fn list_schematics(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::Schematics)
    }

    async fn get_space_elevator(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::SpaceElevator)
    }

    async fn get_hub(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::Hub)
    }

    async fn list_radar_towers(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::RadarTowers)
    }

    async fn list_resource_nodes(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::ResourceNodes)
    }

    async fn list_vehicle_paths(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::VehiclePaths)
    }

    async fn list_tractors(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::Tractors)
    }

    async fn list_explorers(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::Explorers)
    }

    async fn list_belts(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::Belts)
    }

    async fn list_pipes(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::Pipes)
    }

    async fn list_cables(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::Cables)
    }

    async fn list_train_rails(&self) -> Result<Payload, UpstreamError> {
        self.resolve(DataType::TrainRails)
    }
}

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use fuel_sync::db::{Credentials, Store};
use fuel_sync::lubelogger::LubeLoggerApi;
use fuel_sync::model::{FuelType, GasRecord, Vehicle};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

#[derive(Default)]
struct ApiState {
    add_responses: VecDeque<Result<()>>,
    add_calls: Vec<(i64, GasRecord)>,
    vehicle_responses: VecDeque<Result<Vec<Vehicle>>>,
    vehicle_calls: usize,
}

/// Scripted LubeLogger. Unscripted calls succeed.
#[derive(Clone, Default)]
pub struct RecordingApi {
    state: Arc<Mutex<ApiState>>,
    auth: Arc<std::sync::Mutex<Option<Credentials>>>,
    gate: Option<Arc<Notify>>,
}

impl RecordingApi {
    pub fn with_add_responses(responses: Vec<Result<()>>) -> Self {
        let api = Self::default();
        api.state
            .try_lock()
            .unwrap()
            .add_responses
            .extend(responses);
        api
    }

    /// Every `add_gas_record` waits for a permit on the returned gate.
    pub fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let api = Self {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        };
        (api, gate)
    }

    pub async fn push_vehicles(&self, response: Result<Vec<Vehicle>>) {
        self.state.lock().await.vehicle_responses.push_back(response);
    }

    pub async fn add_calls(&self) -> Vec<(i64, GasRecord)> {
        self.state.lock().await.add_calls.clone()
    }

    pub async fn vehicle_calls(&self) -> usize {
        self.state.lock().await.vehicle_calls
    }

    pub fn auth(&self) -> Option<Credentials> {
        self.auth.lock().unwrap().clone()
    }

    pub async fn wait_for_add_calls(&self, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let n = self.add_calls().await.len();
            if n >= expected {
                return;
            }
            assert!(Instant::now() < deadline, "saw {} add calls, want {}", n, expected);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait::async_trait]
impl LubeLoggerApi for RecordingApi {
    fn set_auth(&self, credentials: Credentials) {
        *self.auth.lock().unwrap() = Some(credentials);
    }

    fn clear_auth(&self) {
        *self.auth.lock().unwrap() = None;
    }

    async fn get_vehicles(&self) -> Result<Vec<Vehicle>> {
        let mut state = self.state.lock().await;
        state.vehicle_calls += 1;
        state
            .vehicle_responses
            .pop_front()
            .unwrap_or_else(|| Ok(vec![vehicle(1, "Peugeot", "208")]))
    }

    async fn get_vehicle_info(&self, vehicle_id: i64) -> Result<Value> {
        Ok(json!([{ "vehicleData": { "id": vehicle_id }, "gasRecordCount": 3 }]))
    }

    async fn add_gas_record(&self, vehicle_id: i64, record: &GasRecord) -> Result<()> {
        self.state
            .lock()
            .await
            .add_calls
            .push((vehicle_id, record.clone()));
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.state
            .lock()
            .await
            .add_responses
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

pub fn network_down() -> anyhow::Error {
    anyhow!("failed to reach LubeLogger: connection refused")
}

pub fn vehicle(id: i64, make: &str, model: &str) -> Vehicle {
    serde_json::from_value(json!({
        "id": id,
        "year": 2019,
        "make": make,
        "model": model,
        "licensePlate": format!("AB-{:03}-CD", id),
    }))
    .unwrap()
}

pub fn record(odometer: f64) -> GasRecord {
    GasRecord {
        date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
        odometer,
        fuel_consumed: 40.0,
        cost: 60.0,
        is_fill_to_full: true,
        missed_fuel_up: false,
        fuel_type: FuelType::SP95,
        notes: None,
    }
}

pub async fn wait_for_pending(store: &Store, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let n = store.pending_count().await.unwrap();
        if n == expected {
            return;
        }
        assert!(Instant::now() < deadline, "pending count stuck at {}, want {}", n, expected);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

//! The surface the form layer talks to.
//!
//! [`build`] wires one instance of every component at start-up; everything
//! else receives references from here instead of reaching for globals.

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::db::{keys, Credentials, PendingRecord, Snapshot, Store, StoreError};
use crate::interceptor::{CacheRules, CacheStorage, HttpFetcher, Interceptor, ReplayReport};
use crate::lubelogger::{LubeLoggerApi, LubeLoggerClient};
use crate::model::{GasRecord, Vehicle};
use crate::sync::{DrainReport, SubmitOutcome, SyncDispatcher};

/// Reference datasets that are cached as snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKey {
    Vehicles,
    VehicleInfo(i64),
}

impl ReferenceKey {
    pub fn storage_key(&self) -> String {
        match self {
            ReferenceKey::Vehicles => keys::VEHICLES.to_string(),
            ReferenceKey::VehicleInfo(id) => keys::vehicle_info(*id),
        }
    }
}

/// Where a vehicle list came from.
#[derive(Debug, Clone, PartialEq)]
pub enum VehicleList {
    Fresh(Vec<Vehicle>),
    /// Network failed; this is the last snapshot.
    Cached(Snapshot<Vec<Vehicle>>),
}

impl VehicleList {
    pub fn vehicles(&self) -> &[Vehicle] {
        match self {
            VehicleList::Fresh(v) => v,
            VehicleList::Cached(snap) => &snap.data,
        }
    }
}

pub struct FuelLogService {
    store: Store,
    api: Arc<dyn LubeLoggerApi>,
    connectivity: ConnectivityMonitor,
    dispatcher: Arc<SyncDispatcher>,
    interceptor: Option<Arc<Interceptor>>,
    sync_interval: Duration,
}

impl FuelLogService {
    pub fn new(
        store: Store,
        api: Arc<dyn LubeLoggerApi>,
        connectivity: ConnectivityMonitor,
        sync_interval: Duration,
    ) -> Self {
        let dispatcher = Arc::new(SyncDispatcher::new(
            store.clone(),
            Arc::clone(&api),
            connectivity.clone(),
        ));
        Self {
            store,
            api,
            connectivity,
            dispatcher,
            interceptor: None,
            sync_interval,
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<Interceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn dispatcher(&self) -> &Arc<SyncDispatcher> {
        &self.dispatcher
    }

    pub fn interceptor(&self) -> Option<&Arc<Interceptor>> {
        self.interceptor.as_ref()
    }

    // ---- records -------------------------------------------------------

    /// Single entry point for the form. A delivered record also clears that
    /// vehicle's draft.
    pub async fn submit(&self, vehicle_id: i64, record: GasRecord) -> Result<SubmitOutcome, StoreError> {
        let outcome = self.dispatcher.submit(vehicle_id, record).await?;
        if outcome.accepted() {
            self.store.clear_draft(vehicle_id).await?;
        }
        Ok(outcome)
    }

    pub async fn pending_count(&self) -> Result<usize, StoreError> {
        self.store.pending_count().await
    }

    pub async fn pending(&self) -> Result<Vec<PendingRecord>, StoreError> {
        self.store.list_pending().await
    }

    pub async fn sync_now(&self) -> Result<DrainReport, StoreError> {
        self.dispatcher.drain_queue().await
    }

    // ---- drafts --------------------------------------------------------

    pub async fn save_draft<T: Serialize>(&self, vehicle_id: i64, draft: &T) -> Result<(), StoreError> {
        self.store.save_draft(vehicle_id, draft).await
    }

    pub async fn draft<T: DeserializeOwned>(&self, vehicle_id: i64) -> Result<Option<Snapshot<T>>, StoreError> {
        self.store.get_draft(vehicle_id).await
    }

    // ---- reference data -----------------------------------------------

    pub async fn cached_reference_data(&self, key: ReferenceKey) -> Result<Option<Snapshot<Value>>, StoreError> {
        self.store.get_snapshot(&key.storage_key()).await
    }

    /// Fetch fresh data and snapshot it.
    #[instrument(skip_all, fields(key = ?key))]
    pub async fn refresh_reference_data(&self, key: ReferenceKey) -> Result<Value> {
        let fresh = match key {
            ReferenceKey::Vehicles => serde_json::to_value(self.api.get_vehicles().await?)?,
            ReferenceKey::VehicleInfo(id) => self.api.get_vehicle_info(id).await?,
        };
        self.store.save_snapshot(&key.storage_key(), &fresh).await?;
        Ok(fresh)
    }

    /// Fresh vehicles when reachable, else the last snapshot. Errors only
    /// when neither exists.
    pub async fn load_vehicles(&self) -> Result<VehicleList> {
        match self.api.get_vehicles().await {
            Ok(vehicles) => {
                if let Err(err) = self.store.save_snapshot(keys::VEHICLES, &vehicles).await {
                    warn!(?err, "failed to snapshot vehicles");
                }
                Ok(VehicleList::Fresh(vehicles))
            }
            Err(err) => {
                warn!(?err, "failed to load vehicles, trying cache");
                match self.store.get_snapshot::<Vec<Vehicle>>(keys::VEHICLES).await? {
                    Some(snapshot) => Ok(VehicleList::Cached(snapshot)),
                    None => Err(err.context("no cached vehicles available")),
                }
            }
        }
    }

    // ---- session -------------------------------------------------------

    /// Validate and, if accepted, persist the credentials. `false` means the
    /// server rejected them.
    pub async fn login(&self, username: &str, password: &str) -> Result<bool, StoreError> {
        let valid = self
            .api
            .validate_credentials(Credentials::new(username, password))
            .await;
        if valid {
            self.store.save_credentials(username, password).await?;
            info!(username, "logged in");
        }
        Ok(valid)
    }

    /// Re-validate stored credentials at start-up.
    pub async fn restore_session(&self) -> Result<bool, StoreError> {
        match self.store.get_credentials().await? {
            Some(creds) => Ok(self.api.validate_credentials(creds).await),
            None => Ok(false),
        }
    }

    /// Reinstall stored credentials without probing the server, for
    /// commands that must work offline. Returns whether any were stored.
    pub async fn resume_session(&self) -> Result<bool, StoreError> {
        match self.store.get_credentials().await? {
            Some(creds) => {
                self.api.set_auth(creds);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn logout(&self) -> Result<(), StoreError> {
        self.on_session_end();
        self.store.clear_credentials().await?;
        self.api.clear_auth();
        info!("logged out");
        Ok(())
    }

    /// Auto-sync and the reconnect drain run for exactly the authenticated
    /// session.
    pub fn on_session_start(&self) {
        self.dispatcher.watch_connectivity();
        self.dispatcher.start_auto_sync(self.sync_interval);
    }

    pub fn on_session_end(&self) {
        self.dispatcher.stop_auto_sync();
        self.dispatcher.stop_watching_connectivity();
    }

    // ---- host hooks ----------------------------------------------------

    pub fn on_connectivity_change(&self, state: ConnectivityState) {
        self.connectivity.on_connectivity_change(state);
    }

    pub async fn on_background_sync_signal(&self, tag: &str) -> Result<ReplayReport> {
        match &self.interceptor {
            Some(interceptor) => interceptor.on_background_sync(tag).await,
            None => Err(anyhow!("no request interceptor configured")),
        }
    }
}

/// Assemble the process-wide instance from configuration.
pub async fn build(cfg: &Config) -> Result<FuelLogService> {
    let store = Store::open(&cfg.database_url())
        .await
        .context("failed to open local store")?;
    let api: Arc<dyn LubeLoggerApi> = Arc::new(LubeLoggerClient::from_config(cfg)?);
    let connectivity = ConnectivityMonitor::new(ConnectivityState::Online);

    let fetcher = HttpFetcher::new(Duration::from_secs(cfg.app.request_timeout_secs))?;
    let interceptor = Interceptor::new(
        CacheStorage::new(store.pool().clone()),
        Arc::new(fetcher),
        CacheRules::from_config(&cfg.cache)?,
    );

    Ok(FuelLogService::new(
        store,
        api,
        connectivity,
        Duration::from_millis(cfg.app.sync_interval_ms),
    )
    .with_interceptor(Arc::new(interceptor)))
}

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::Credentials;
use crate::model::{GasRecord, Vehicle};

pub const VEHICLES_PATH: &str = "api/vehicles";
pub const VEHICLE_INFO_PATH: &str = "api/vehicle/info";
pub const ADD_GAS_RECORD_PATH: &str = "api/vehicle/gasrecords/add";

/// Note attached to records the user left without one.
pub const DEFAULT_NOTES: &str = "Added from LubeLogger Quick Fuel";

/// Remote operations the sync layer needs from LubeLogger.
#[async_trait]
pub trait LubeLoggerApi: Send + Sync {
    /// Credentials sent as basic auth on every subsequent request.
    fn set_auth(&self, credentials: Credentials);

    fn clear_auth(&self);

    /// Vehicles that have not been sold.
    async fn get_vehicles(&self) -> Result<Vec<Vehicle>>;

    async fn get_vehicle_info(&self, vehicle_id: i64) -> Result<Value>;

    async fn add_gas_record(&self, vehicle_id: i64, record: &GasRecord) -> Result<()>;

    /// Install `credentials` and probe the vehicle list. Any success counts
    /// as valid; on failure the credentials are dropped again.
    async fn validate_credentials(&self, credentials: Credentials) -> bool {
        self.set_auth(credentials);
        match self.get_vehicles().await {
            Ok(_) => true,
            Err(err) => {
                warn!(?err, "credential validation failed");
                self.clear_auth();
                false
            }
        }
    }
}

pub struct LubeLoggerClient {
    http: Client,
    base_url: Url,
    auth: RwLock<Option<Credentials>>,
}

impl fmt::Debug for LubeLoggerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LubeLoggerClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl LubeLoggerClient {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("fuel-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: with_trailing_slash(base_url),
            auth: RwLock::new(None),
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.server.base_url).context("invalid server.base_url")?;
        Self::new(base_url, Duration::from_secs(cfg.app.request_timeout_secs))
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self
            .base_url
            .join(path)
            .with_context(|| format!("invalid LubeLogger path {}", path))?;
        let builder = self.http.request(method, url);
        let auth = self.auth.read().unwrap_or_else(|e| e.into_inner());
        Ok(match auth.as_ref() {
            Some(creds) => builder.basic_auth(&creds.username, Some(&creds.password)),
            None => builder,
        })
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let request = builder.build().context("failed to build LubeLogger request")?;
        let method = request.method().clone();
        let url = request.url().clone();
        debug!(%method, %url, "lubelogger request");

        let res = self
            .http
            .execute(request)
            .await
            .with_context(|| format!("failed to reach LubeLogger at {}", url))?;

        let status = res.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(anyhow!("lubelogger rejected credentials (401) for {}", url));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, %url, "lubelogger error response");
            return Err(anyhow!("lubelogger error {}: {}", status, body));
        }
        debug!(%status, %url, "lubelogger response");
        Ok(res)
    }
}

#[async_trait]
impl LubeLoggerApi for LubeLoggerClient {
    fn set_auth(&self, credentials: Credentials) {
        let mut auth = self.auth.write().unwrap_or_else(|e| e.into_inner());
        *auth = Some(credentials);
    }

    fn clear_auth(&self) {
        let mut auth = self.auth.write().unwrap_or_else(|e| e.into_inner());
        *auth = None;
    }

    async fn get_vehicles(&self) -> Result<Vec<Vehicle>> {
        let res = self.send(self.request(Method::GET, VEHICLES_PATH)?).await?;
        let all: Vec<Vehicle> = res.json().await.context("invalid vehicles JSON")?;
        Ok(all.into_iter().filter(|v| !v.is_sold()).collect())
    }

    async fn get_vehicle_info(&self, vehicle_id: i64) -> Result<Value> {
        let builder = self
            .request(Method::GET, VEHICLE_INFO_PATH)?
            .query(&[("vehicleId", vehicle_id)]);
        let res = self.send(builder).await?;
        res.json().await.context("invalid vehicle info JSON")
    }

    async fn add_gas_record(&self, vehicle_id: i64, record: &GasRecord) -> Result<()> {
        let form = gas_record_form_fields(record)
            .into_iter()
            .fold(reqwest::multipart::Form::new(), |form, (name, value)| {
                form.text(name, value)
            });
        let builder = self
            .request(Method::POST, ADD_GAS_RECORD_PATH)?
            .query(&[("vehicleId", vehicle_id)])
            .multipart(form);
        let res = self.send(builder).await?;
        // Body is an informational JSON message; delivery is judged by status.
        let _ = res.text().await;
        info!(vehicle_id, date = %record.date, "gas record delivered");
        Ok(())
    }
}

/// Multipart fields for `POST /api/vehicle/gasrecords/add`, in send order.
pub fn gas_record_form_fields(record: &GasRecord) -> Vec<(&'static str, String)> {
    let fuel_type = record.fuel_type.as_str().to_string();
    let notes = record
        .notes
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(DEFAULT_NOTES)
        .to_string();
    vec![
        ("date", record.date.format("%Y-%m-%d").to_string()),
        ("odometer", record.odometer.to_string()),
        ("fuelConsumed", record.fuel_consumed.to_string()),
        ("cost", record.cost.to_string()),
        ("isFillToFull", record.is_fill_to_full.to_string()),
        ("missedFuelUp", record.missed_fuel_up.to_string()),
        ("notes", notes),
        ("tags", fuel_type.clone()),
        ("extrafields[0][name]", "Fuel type".to_string()),
        ("extrafields[0][value]", fuel_type),
    ]
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

//! Persisted shapes.
//!
//! Keep these focused on what goes to disk. Sync behaviour lives in
//! `crate::sync`.

use crate::model::RecordPayload;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage keys. Everything sits under the `fuel_logger_` namespace.
pub mod keys {
    pub const CREDENTIALS: &str = "fuel_logger_credentials";
    pub const VEHICLES: &str = "fuel_logger_vehicles";
    pub const VEHICLE_INFO_PREFIX: &str = "fuel_logger_vehicle_info_id";
    pub const FORM_DATA_PREFIX: &str = "fuel_logger_form_data_id";

    pub fn vehicle_info(vehicle_id: i64) -> String {
        format!("{}{}", VEHICLE_INFO_PREFIX, vehicle_id)
    }

    pub fn form_data(vehicle_id: i64) -> String {
        format!("{}{}", FORM_DATA_PREFIX, vehicle_id)
    }
}

/// A queued write waiting for delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingRecord {
    /// Creation time in milliseconds, bumped when needed to stay unique.
    pub id: i64,
    pub payload: RecordPayload,
    pub enqueued_at: DateTime<Utc>,
}

/// Timestamped local copy of remote data or of a draft.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot<T> {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub data: T,
}

impl<T> Snapshot<T> {
    pub fn now(data: T) -> Self {
        Self {
            timestamp: Utc::now(),
            data,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Reversible base64 encoding of the JSON form.
    ///
    /// This is obfuscation only. Anyone who can read the database can
    /// recover the password.
    pub fn obfuscate(&self) -> Result<String, serde_json::Error> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    pub fn deobfuscate(blob: &str) -> Result<Self, String> {
        let raw = STANDARD
            .decode(blob.trim())
            .map_err(|e| format!("invalid base64: {}", e))?;
        serde_json::from_slice(&raw).map_err(|e| format!("invalid credential JSON: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn credentials_obfuscation_is_reversible() {
        let creds = Credentials::new("alice", "s3cret:with:colons");
        let blob = creds.obfuscate().unwrap();
        assert!(!blob.contains("s3cret"));
        assert_eq!(Credentials::deobfuscate(&blob).unwrap(), creds);
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = Credentials::new("alice", "hunter2");
        let dbg = format!("{:?}", creds);
        assert!(dbg.contains("alice"));
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn snapshot_timestamp_is_millis_on_disk() {
        let snap = Snapshot {
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
            data: vec![1, 2],
        };
        let v = serde_json::to_value(&snap).unwrap();
        assert_eq!(v["timestamp"], 1_700_000_000_123_i64);
        assert_eq!(v["data"], serde_json::json!([1, 2]));
    }
}

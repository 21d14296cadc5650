use super::model::{keys, Credentials, PendingRecord, Snapshot};
use super::{init_pool, run_migrations, Pool, StoreError};
use crate::model::RecordPayload;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::Row;
use tracing::{instrument, warn};

/// Sole owner of the device-local state.
///
/// Every mutation is a single SQL statement (or one transaction), so callers
/// on different trigger paths never need to coordinate. Removing something
/// that is already gone is a no-op, not an error.
#[derive(Debug, Clone)]
pub struct Store {
    pool: Pool,
}

impl Store {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date.
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let pool = init_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::open("sqlite::memory:").await
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    // ---- raw key/value -------------------------------------------------

    #[instrument(skip_all, fields(key = %key))]
    pub async fn set_value<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        sqlx::query(
            "INSERT INTO kv (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(key = %key))]
    pub async fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let raw = sqlx::query_scalar::<_, String>("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Returns whether a value was present.
    pub async fn remove_value(&self, key: &str) -> Result<bool, StoreError> {
        let res = sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM kv WHERE substr(key, 1, ?) = ?")
            .bind(prefix.len() as i64)
            .bind(prefix)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    // ---- credentials ---------------------------------------------------

    pub async fn save_credentials(&self, username: &str, password: &str) -> Result<(), StoreError> {
        let blob = Credentials::new(username, password).obfuscate()?;
        self.set_value(keys::CREDENTIALS, &blob).await
    }

    pub async fn get_credentials(&self) -> Result<Option<Credentials>, StoreError> {
        let Some(blob) = self.get_value::<String>(keys::CREDENTIALS).await? else {
            return Ok(None);
        };
        Credentials::deobfuscate(&blob)
            .map(Some)
            .map_err(|reason| StoreError::Corrupt {
                key: keys::CREDENTIALS.to_string(),
                reason,
            })
    }

    pub async fn clear_credentials(&self) -> Result<(), StoreError> {
        self.remove_value(keys::CREDENTIALS).await?;
        Ok(())
    }

    // ---- snapshots -----------------------------------------------------

    pub async fn save_snapshot<T: Serialize>(&self, key: &str, data: &T) -> Result<(), StoreError> {
        self.set_value(key, &Snapshot::now(data)).await
    }

    pub async fn get_snapshot<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Snapshot<T>>, StoreError> {
        self.get_value(key).await
    }

    // ---- pending queue -------------------------------------------------

    /// Append a record. The id is the current time in milliseconds, raised
    /// past the highest id ever issued, so an id is never reused even after
    /// its record was removed or the clock stepped back.
    #[instrument(skip_all, fields(vehicle_id = payload.vehicle_id))]
    pub async fn enqueue_pending(&self, payload: &RecordPayload) -> Result<PendingRecord, StoreError> {
        let now = Utc::now();
        let raw = serde_json::to_string(payload)?;
        let id: i64 = sqlx::query(
            "INSERT INTO pending_records (id, payload, enqueued_at) \
             VALUES (MAX(?, COALESCE((SELECT seq FROM sqlite_sequence WHERE name = 'pending_records'), 0) + 1), ?, ?) \
             RETURNING id",
        )
        .bind(now.timestamp_millis())
        .bind(raw)
        .bind(now)
        .fetch_one(&self.pool)
        .await?
        .get("id");
        Ok(PendingRecord {
            id,
            payload: payload.clone(),
            enqueued_at: now,
        })
    }

    /// All queued records, oldest first. Rows whose payload no longer parses
    /// are left in place and skipped.
    #[instrument(skip_all)]
    pub async fn list_pending(&self) -> Result<Vec<PendingRecord>, StoreError> {
        let rows = sqlx::query("SELECT id, payload, enqueued_at FROM pending_records ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            let raw: String = row.get("payload");
            let enqueued_at: DateTime<Utc> = row.try_get("enqueued_at")?;
            match serde_json::from_str::<RecordPayload>(&raw) {
                Ok(payload) => out.push(PendingRecord {
                    id,
                    payload,
                    enqueued_at,
                }),
                Err(err) => warn!(id, ?err, "skipping unreadable pending record"),
            }
        }
        Ok(out)
    }

    pub async fn pending_count(&self) -> Result<usize, StoreError> {
        let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(cnt as usize)
    }

    pub async fn is_pending(&self, id: i64) -> Result<bool, StoreError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM pending_records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Remove one record by id. Returns whether it was still queued.
    #[instrument(skip_all, fields(id = id))]
    pub async fn remove_pending(&self, id: i64) -> Result<bool, StoreError> {
        let res = sqlx::query("DELETE FROM pending_records WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn clear_pending(&self) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM pending_records")
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    // ---- drafts --------------------------------------------------------

    pub async fn save_draft<T: Serialize>(&self, vehicle_id: i64, data: &T) -> Result<(), StoreError> {
        self.save_snapshot(&keys::form_data(vehicle_id), data).await
    }

    pub async fn get_draft<T: DeserializeOwned>(&self, vehicle_id: i64) -> Result<Option<Snapshot<T>>, StoreError> {
        self.get_snapshot(&keys::form_data(vehicle_id)).await
    }

    /// Drop the draft of one vehicle.
    pub async fn clear_draft(&self, vehicle_id: i64) -> Result<bool, StoreError> {
        self.remove_value(&keys::form_data(vehicle_id)).await
    }

    /// Drop every vehicle's draft.
    pub async fn clear_drafts(&self) -> Result<u64, StoreError> {
        self.remove_prefix(keys::FORM_DATA_PREFIX).await
    }
}

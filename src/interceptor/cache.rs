//! Named request/response caches persisted next to the store.

use super::fetch::{InterceptedRequest, InterceptedResponse, RequestKey, RequestMode};
use crate::db::{Pool, StoreError};
use chrono::Utc;
use reqwest::{Method, Url};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::instrument;

/// A row of a cache, with the request it was stored under.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub id: i64,
    pub cache_name: String,
    pub request: InterceptedRequest,
    pub response: InterceptedResponse,
}

#[derive(Debug, Clone)]
pub struct CacheStorage {
    pool: Pool,
}

impl CacheStorage {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn open(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO caches (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn names(&self) -> Result<Vec<String>, StoreError> {
        Ok(sqlx::query_scalar("SELECT name FROM caches ORDER BY created_at, name")
            .fetch_all(&self.pool)
            .await?)
    }

    /// Drop a cache and everything in it. Returns whether it existed.
    #[instrument(skip_all, fields(name = %name))]
    pub async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cache_entries WHERE cache_name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        let res = sqlx::query("DELETE FROM caches WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(res.rows_affected() > 0)
    }

    /// Store a response, replacing any earlier one for the same request.
    pub async fn put(
        &self,
        cache: &str,
        request: &InterceptedRequest,
        response: &InterceptedResponse,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        put_tx(&mut tx, cache, request, response).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Store every pair or none.
    pub async fn put_all(
        &self,
        cache: &str,
        entries: &[(InterceptedRequest, InterceptedResponse)],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for (request, response) in entries {
            put_tx(&mut tx, cache, request, response).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Keep a request (with its body) for later replay. Captures of the same
    /// URL never overwrite each other.
    pub async fn capture(
        &self,
        cache: &str,
        request: &InterceptedRequest,
        response: &InterceptedResponse,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        ensure_cache_tx(&mut tx, cache).await?;
        let id = insert_tx(&mut tx, cache, request, response, true).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Most recent stored response for this request identity, in `cache` or
    /// in any cache when `cache` is None. Captured writes never match.
    pub async fn lookup(
        &self,
        cache: Option<&str>,
        key: &RequestKey,
    ) -> Result<Option<InterceptedResponse>, StoreError> {
        let row = match cache {
            Some(name) => {
                sqlx::query(
                    "SELECT status, response_headers, response_body FROM cache_entries \
                     WHERE cache_name = ? AND method = ? AND url = ? AND captured = 0 \
                     ORDER BY id DESC LIMIT 1",
                )
                .bind(name)
                .bind(&key.method)
                .bind(&key.url)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT status, response_headers, response_body FROM cache_entries \
                     WHERE method = ? AND url = ? AND captured = 0 \
                     ORDER BY id DESC LIMIT 1",
                )
                .bind(&key.method)
                .bind(&key.url)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.map(|r| response_from_row(&r)).transpose()
    }

    /// Captured requests in `cache`, oldest first.
    pub async fn captured(&self, cache: &str) -> Result<Vec<CachedEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, cache_name, method, url, request_headers, request_body, \
                    status, response_headers, response_body \
             FROM cache_entries WHERE cache_name = ? AND captured = 1 ORDER BY id ASC",
        )
        .bind(cache)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    pub async fn delete_entry(&self, id: i64) -> Result<bool, StoreError> {
        let res = sqlx::query("DELETE FROM cache_entries WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn len(&self, cache: &str) -> Result<usize, StoreError> {
        let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?")
            .bind(cache)
            .fetch_one(&self.pool)
            .await?;
        Ok(cnt as usize)
    }
}

async fn ensure_cache_tx(tx: &mut Transaction<'_, Sqlite>, cache: &str) -> Result<(), StoreError> {
    sqlx::query("INSERT OR IGNORE INTO caches (name) VALUES (?)")
        .bind(cache)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn put_tx(
    tx: &mut Transaction<'_, Sqlite>,
    cache: &str,
    request: &InterceptedRequest,
    response: &InterceptedResponse,
) -> Result<(), StoreError> {
    ensure_cache_tx(tx, cache).await?;
    let key = request.key();
    sqlx::query("DELETE FROM cache_entries WHERE cache_name = ? AND method = ? AND url = ? AND captured = 0")
        .bind(cache)
        .bind(&key.method)
        .bind(&key.url)
        .execute(&mut **tx)
        .await?;
    insert_tx(tx, cache, request, response, false).await?;
    Ok(())
}

async fn insert_tx(
    tx: &mut Transaction<'_, Sqlite>,
    cache: &str,
    request: &InterceptedRequest,
    response: &InterceptedResponse,
    captured: bool,
) -> Result<i64, StoreError> {
    let key = request.key();
    let id: i64 = sqlx::query(
        "INSERT INTO cache_entries \
         (cache_name, method, url, request_headers, request_body, status, response_headers, response_body, captured, stored_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(cache)
    .bind(&key.method)
    .bind(&key.url)
    .bind(serde_json::to_string(&request.headers)?)
    .bind(request.body.as_deref())
    .bind(response.status as i64)
    .bind(serde_json::to_string(&response.headers)?)
    .bind(response.body.as_slice())
    .bind(captured)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await?
    .get("id");
    Ok(id)
}

fn response_from_row(row: &SqliteRow) -> Result<InterceptedResponse, StoreError> {
    let status: i64 = row.try_get("status")?;
    let headers: String = row.try_get("response_headers")?;
    let body: Vec<u8> = row.try_get("response_body")?;
    Ok(InterceptedResponse {
        status: u16::try_from(status).map_err(|_| StoreError::Corrupt {
            key: "cache_entries.status".into(),
            reason: format!("status {} out of range", status),
        })?,
        headers: serde_json::from_str(&headers)?,
        body,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<CachedEntry, StoreError> {
    let id: i64 = row.try_get("id")?;
    let method: String = row.try_get("method")?;
    let url: String = row.try_get("url")?;
    let headers: String = row.try_get("request_headers")?;
    let body: Option<Vec<u8>> = row.try_get("request_body")?;

    let corrupt = |reason: String| StoreError::Corrupt {
        key: format!("cache_entries.{}", id),
        reason,
    };
    let method = Method::from_bytes(method.as_bytes()).map_err(|e| corrupt(e.to_string()))?;
    let url = Url::parse(&url).map_err(|e| corrupt(e.to_string()))?;

    Ok(CachedEntry {
        id,
        cache_name: row.try_get("cache_name")?,
        request: InterceptedRequest {
            method,
            url,
            mode: RequestMode::Other,
            headers: serde_json::from_str(&headers)?,
            body,
        },
        response: response_from_row(row)?,
    })
}

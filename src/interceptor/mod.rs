//! Request interception with offline caching.
//!
//! Routing, per request:
//! - paths under `/api/` go network-first. Successful GETs of the configured
//!   read endpoints are cached; when the network is unreachable the cached
//!   copy is served, or a synthetic 503. A failed write to the gas-record
//!   endpoint is captured for replay on the next background-sync signal.
//! - everything else is cache-first. Misses outside the precache manifest
//!   are stored in the runtime cache; a failed navigation gets the offline
//!   page.

use anyhow::{bail, Context, Result};
use futures::future::{join_all, try_join_all};
use regex::Regex;
use reqwest::{Method, Url};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::config;

pub mod cache;
pub mod fetch;

pub use cache::{CacheStorage, CachedEntry};
pub use fetch::{Fetcher, HttpFetcher, InterceptedRequest, InterceptedResponse, RequestKey, RequestMode};

const API_SEGMENT: &str = "/api/";

/// Which requests get which strategy.
#[derive(Debug, Clone)]
pub struct CacheRules {
    pub origin: Url,
    pub static_cache: String,
    pub runtime_cache: String,
    pub precache: Vec<String>,
    pub api_read: Vec<Regex>,
    pub write_endpoint: String,
    pub sync_tag: String,
    pub offline_page: String,
}

impl CacheRules {
    pub fn from_config(cfg: &config::Cache) -> Result<Self> {
        let api_read = cfg
            .api_read_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("invalid api read pattern {}", p)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            origin: Url::parse(&cfg.origin).context("invalid cache.origin")?,
            static_cache: cfg.static_name.clone(),
            runtime_cache: cfg.runtime_name.clone(),
            precache: cfg.precache.clone(),
            api_read,
            write_endpoint: cfg.write_endpoint.clone(),
            sync_tag: cfg.sync_tag.clone(),
            offline_page: cfg.offline_page.clone(),
        })
    }

    pub fn precache_urls(&self) -> Result<Vec<Url>> {
        self.precache
            .iter()
            .map(|p| {
                self.origin
                    .join(p)
                    .with_context(|| format!("invalid precache path {}", p))
            })
            .collect()
    }

    pub fn offline_url(&self) -> Result<Url> {
        self.origin
            .join(&self.offline_page)
            .context("invalid offline page path")
    }

    pub fn is_precached(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin() && self.precache.iter().any(|p| p == url.path())
    }

    pub fn is_api(&self, url: &Url) -> bool {
        url.path().contains(API_SEGMENT)
    }

    pub fn is_api_read(&self, request: &InterceptedRequest) -> bool {
        request.method == Method::GET && self.api_read.iter().any(|re| re.is_match(request.url.path()))
    }

    pub fn is_write(&self, url: &Url) -> bool {
        url.path().contains(&self.write_endpoint)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    pub attempted: usize,
    pub replayed: usize,
    pub failed: usize,
}

pub struct Interceptor {
    caches: CacheStorage,
    network: Arc<dyn Fetcher>,
    rules: CacheRules,
}

impl Interceptor {
    pub fn new(caches: CacheStorage, network: Arc<dyn Fetcher>, rules: CacheRules) -> Self {
        Self {
            caches,
            network,
            rules,
        }
    }

    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    pub fn rules(&self) -> &CacheRules {
        &self.rules
    }

    /// Precache the static manifest. Either every asset is fetched with a
    /// success status and stored, or nothing is stored and this fails.
    #[instrument(skip_all)]
    pub async fn install(&self) -> Result<usize> {
        let urls = self.rules.precache_urls()?;
        let fetches = urls.into_iter().map(|url| async move {
            let request = InterceptedRequest::get(url);
            let response = self
                .network
                .fetch(&request)
                .await
                .with_context(|| format!("failed to precache {}", request.url))?;
            if !response.is_success() {
                bail!("precache of {} returned {}", request.url, response.status);
            }
            Ok((request, response))
        });
        let entries = try_join_all(fetches).await?;
        self.caches.put_all(&self.rules.static_cache, &entries).await?;
        info!(count = entries.len(), cache = %self.rules.static_cache, "precached static assets");
        Ok(entries.len())
    }

    /// Delete every cache other than the current static and runtime ones.
    #[instrument(skip_all)]
    pub async fn activate(&self) -> Result<Vec<String>> {
        let mut deleted = Vec::new();
        for name in self.caches.names().await? {
            if name == self.rules.static_cache || name == self.rules.runtime_cache {
                continue;
            }
            self.caches.delete(&name).await?;
            info!(cache = %name, "deleted stale cache");
            deleted.push(name);
        }
        Ok(deleted)
    }

    /// Answer one request. `None` means nothing could answer it.
    #[instrument(skip_all, fields(method = %request.method, url = %request.url))]
    pub async fn handle(&self, request: &InterceptedRequest) -> Result<Option<InterceptedResponse>> {
        if self.rules.is_api(&request.url) {
            return self.handle_api(request).await.map(Some);
        }
        self.handle_asset(request).await
    }

    async fn handle_api(&self, request: &InterceptedRequest) -> Result<InterceptedResponse> {
        let cacheable = self.rules.is_api_read(request);
        match self.network.fetch(request).await {
            Ok(response) => {
                if cacheable && response.status == 200 {
                    if let Err(err) = self
                        .caches
                        .put(&self.rules.runtime_cache, request, &response)
                        .await
                    {
                        warn!(?err, "failed to cache api response");
                    }
                }
                Ok(response)
            }
            Err(err) => {
                debug!(?err, "network unavailable for api request");
                let fallback = InterceptedResponse::network_error();
                if request.method == Method::POST && self.rules.is_write(&request.url) {
                    let id = self
                        .caches
                        .capture(&self.rules.runtime_cache, request, &fallback)
                        .await?;
                    info!(id, "captured write request for background replay");
                    return Ok(fallback);
                }
                match self.caches.lookup(None, &request.key()).await {
                    Ok(Some(cached)) => {
                        debug!("serving cached api response");
                        Ok(cached)
                    }
                    Ok(None) => Ok(fallback),
                    Err(err) => {
                        warn!(?err, "cache lookup failed, answering with network error");
                        Ok(fallback)
                    }
                }
            }
        }
    }

    async fn handle_asset(&self, request: &InterceptedRequest) -> Result<Option<InterceptedResponse>> {
        if let Some(cached) = self.caches.lookup(None, &request.key()).await? {
            return Ok(Some(cached));
        }

        match self.network.fetch(request).await {
            Ok(response) => {
                let storable = request.method == Method::GET
                    && response.status == 200
                    && !self.rules.is_precached(&request.url);
                if storable {
                    if let Err(err) = self
                        .caches
                        .put(&self.rules.runtime_cache, request, &response)
                        .await
                    {
                        warn!(?err, "failed to cache response");
                    }
                }
                Ok(Some(response))
            }
            Err(err) => {
                debug!(?err, "network unavailable for asset");
                if !request.is_navigation() {
                    return Ok(None);
                }
                let offline = self.rules.offline_url()?;
                Ok(self
                    .caches
                    .lookup(None, &RequestKey::new(&Method::GET, &offline))
                    .await?)
            }
        }
    }

    /// Host hook for platform background-sync signals.
    pub async fn on_background_sync(&self, tag: &str) -> Result<ReplayReport> {
        if tag != self.rules.sync_tag {
            debug!(tag, "ignoring background sync tag");
            return Ok(ReplayReport::default());
        }
        self.replay_captured().await
    }

    /// Re-send every captured write. An entry is evicted only after the
    /// server accepted it; anything else stays for the next signal.
    #[instrument(skip_all)]
    pub async fn replay_captured(&self) -> Result<ReplayReport> {
        let entries: Vec<CachedEntry> = self
            .caches
            .captured(&self.rules.runtime_cache)
            .await?
            .into_iter()
            .filter(|e| self.rules.is_write(&e.request.url))
            .collect();

        let outcomes = join_all(entries.iter().map(|entry| async move {
            match self.network.fetch(&entry.request).await {
                Ok(response) if response.is_success() => {
                    if let Err(err) = self.caches.delete_entry(entry.id).await {
                        error!(?err, id = entry.id, "replayed but failed to evict");
                    }
                    true
                }
                Ok(response) => {
                    warn!(id = entry.id, status = response.status, "replay rejected, keeping");
                    false
                }
                Err(err) => {
                    warn!(?err, id = entry.id, "failed to replay, keeping");
                    false
                }
            }
        }))
        .await;

        let replayed = outcomes.iter().filter(|ok| **ok).count();
        let report = ReplayReport {
            attempted: outcomes.len(),
            replayed,
            failed: outcomes.len() - replayed,
        };
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                replayed = report.replayed,
                failed = report.failed,
                "replay finished"
            );
        }
        Ok(report)
    }
}

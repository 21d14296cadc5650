use anyhow::{anyhow, Result};
use fuel_sync::config::{self, Config};
use fuel_sync::db::Store;
use fuel_sync::interceptor::{
    CacheRules, CacheStorage, Fetcher, InterceptedRequest, InterceptedResponse, Interceptor,
};
use reqwest::Url;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct NetState {
    offline: bool,
    routes: HashMap<String, (u16, Vec<u8>)>,
    requests: Vec<InterceptedRequest>,
}

/// Origin server stand-in keyed by path. Unknown paths answer 404.
#[derive(Clone, Default)]
struct FakeNetwork {
    state: Arc<Mutex<NetState>>,
}

impl FakeNetwork {
    fn route(&self, path: &str, status: u16, body: &str) {
        self.state
            .lock()
            .unwrap()
            .routes
            .insert(path.to_string(), (status, body.as_bytes().to_vec()));
    }

    fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    fn requests(&self) -> Vec<InterceptedRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

#[async_trait::async_trait]
impl Fetcher for FakeNetwork {
    async fn fetch(&self, request: &InterceptedRequest) -> Result<InterceptedResponse> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());
        if state.offline {
            return Err(anyhow!("connection refused"));
        }
        Ok(match state.routes.get(request.url.path()) {
            Some((status, body)) => InterceptedResponse::new(*status, body.clone()),
            None => InterceptedResponse::new(404, "not found"),
        })
    }
}

fn cfg() -> Config {
    serde_yaml::from_str(config::example()).unwrap()
}

fn url(path: &str) -> Url {
    Url::parse("https://fuel.example.com").unwrap().join(path).unwrap()
}

async fn setup() -> (Interceptor, FakeNetwork) {
    let store = Store::in_memory().await.unwrap();
    let net = FakeNetwork::default();
    let rules = CacheRules::from_config(&cfg().cache).unwrap();
    let interceptor = Interceptor::new(
        CacheStorage::new(store.pool().clone()),
        Arc::new(net.clone()),
        rules,
    );
    (interceptor, net)
}

fn route_precache(net: &FakeNetwork) {
    for path in &cfg().cache.precache {
        net.route(path, 200, &format!("asset {}", path));
    }
}

#[tokio::test]
async fn install_precaches_manifest_and_serves_it_offline() {
    let (interceptor, net) = setup().await;
    route_precache(&net);

    let n = interceptor.install().await.unwrap();
    assert_eq!(n, cfg().cache.precache.len());
    assert_eq!(interceptor.caches().len("fuel-logger-v1").await.unwrap(), n);

    net.set_offline(true);
    let before = net.requests().len();
    let res = interceptor
        .handle(&InterceptedRequest::get(url("/static/js/main.bundle.js")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(res.body, b"asset /static/js/main.bundle.js");
    assert_eq!(net.requests().len(), before, "cache hit must not touch the network");
}

#[tokio::test]
async fn install_is_all_or_nothing() {
    let (interceptor, net) = setup().await;
    route_precache(&net);
    net.route("/manifest.json", 404, "missing");

    assert!(interceptor.install().await.is_err());
    assert_eq!(interceptor.caches().len("fuel-logger-v1").await.unwrap(), 0);
}

#[tokio::test]
async fn activate_deletes_only_stale_caches() {
    let (interceptor, net) = setup().await;
    route_precache(&net);
    interceptor.install().await.unwrap();
    interceptor.caches().open("runtime-cache").await.unwrap();
    interceptor
        .caches()
        .put(
            "fuel-logger-v0",
            &InterceptedRequest::get(url("/old.js")),
            &InterceptedResponse::new(200, "old"),
        )
        .await
        .unwrap();

    let deleted = interceptor.activate().await.unwrap();
    assert_eq!(deleted, vec!["fuel-logger-v0".to_string()]);
    let mut names = interceptor.caches().names().await.unwrap();
    names.sort();
    assert_eq!(names, vec!["fuel-logger-v1".to_string(), "runtime-cache".to_string()]);
}

#[tokio::test]
async fn api_reads_are_network_first_with_cache_fallback() {
    let (interceptor, net) = setup().await;
    net.route("/api/vehicles", 200, r#"[{"id":1}]"#);
    let req = InterceptedRequest::get(url("/api/vehicles"));

    let fresh = interceptor.handle(&req).await.unwrap().unwrap();
    assert_eq!(fresh.status, 200);
    assert_eq!(interceptor.caches().len("runtime-cache").await.unwrap(), 1);

    net.route("/api/vehicles", 200, r#"[{"id":1},{"id":2}]"#);
    let newer = interceptor.handle(&req).await.unwrap().unwrap();
    assert_eq!(newer.body, br#"[{"id":1},{"id":2}]"#);

    net.set_offline(true);
    let cached = interceptor.handle(&req).await.unwrap().unwrap();
    assert_eq!(cached.status, 200);
    assert_eq!(cached.body, br#"[{"id":1},{"id":2}]"#);
}

#[tokio::test]
async fn uncached_api_request_offline_gets_synthetic_503() {
    let (interceptor, net) = setup().await;
    net.set_offline(true);

    let res = interceptor
        .handle(&InterceptedRequest::get(url("/api/vehicle/info?vehicleId=3")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(res.status, 503);
    assert_eq!(res.header("Content-Type"), Some("application/json"));
    let body: serde_json::Value = serde_json::from_slice(&res.body).unwrap();
    assert_eq!(body["error"], "Network error");
}

#[tokio::test]
async fn broken_cache_still_yields_synthetic_503() {
    let store = Store::in_memory().await.unwrap();
    let net = FakeNetwork::default();
    let interceptor = Interceptor::new(
        CacheStorage::new(store.pool().clone()),
        Arc::new(net.clone()),
        CacheRules::from_config(&cfg().cache).unwrap(),
    );
    net.set_offline(true);
    store.pool().close().await;

    let res = interceptor
        .handle(&InterceptedRequest::get(url("/api/vehicles")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(res, InterceptedResponse::network_error());
}

#[tokio::test]
async fn only_successful_reads_of_listed_endpoints_are_cached() {
    let (interceptor, net) = setup().await;
    net.route("/api/vehicle/info", 500, "boom");
    net.route("/api/whoami", 200, "me");

    let info = interceptor
        .handle(&InterceptedRequest::get(url("/api/vehicle/info?vehicleId=3")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.status, 500);
    interceptor
        .handle(&InterceptedRequest::get(url("/api/whoami")))
        .await
        .unwrap();
    assert_eq!(interceptor.caches().len("runtime-cache").await.unwrap(), 0);
}

#[tokio::test]
async fn assets_fill_runtime_cache_and_navigation_falls_back_offline() {
    let (interceptor, net) = setup().await;
    route_precache(&net);
    interceptor.install().await.unwrap();
    net.route("/img/logo.png", 200, "png");

    let logo = InterceptedRequest::get(url("/img/logo.png"));
    interceptor.handle(&logo).await.unwrap().unwrap();
    assert_eq!(interceptor.caches().len("runtime-cache").await.unwrap(), 1);

    net.set_offline(true);
    assert_eq!(interceptor.handle(&logo).await.unwrap().unwrap().body, b"png");

    let page = interceptor
        .handle(&InterceptedRequest::navigate(url("/vehicles/3")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(page.body, b"asset /offline.html");

    let script = interceptor
        .handle(&InterceptedRequest::get(url("/static/js/chunk.js")))
        .await
        .unwrap();
    assert!(script.is_none());
}

#[tokio::test]
async fn failed_writes_are_captured_and_replayed_until_accepted() {
    let (interceptor, net) = setup().await;
    net.set_offline(true);

    let write = InterceptedRequest::post(
        url("/api/vehicle/gasrecords/add?vehicleId=7"),
        b"odometer=15000".to_vec(),
    )
    .with_header("Authorization", "Basic dXNlcjpwYXNz");
    let res = interceptor.handle(&write).await.unwrap().unwrap();
    assert_eq!(res.status, 503);
    assert_eq!(interceptor.caches().captured("runtime-cache").await.unwrap().len(), 1);

    // Unrelated tags are ignored.
    net.set_offline(false);
    let ignored = interceptor.on_background_sync("something-else").await.unwrap();
    assert_eq!(ignored.attempted, 0);

    net.route("/api/vehicle/gasrecords/add", 500, "server error");
    let rejected = interceptor.on_background_sync("sync-fuel-logs").await.unwrap();
    assert_eq!(rejected.attempted, 1);
    assert_eq!(rejected.replayed, 0);
    assert_eq!(interceptor.caches().captured("runtime-cache").await.unwrap().len(), 1);

    net.route("/api/vehicle/gasrecords/add", 200, r#"{"success":true}"#);
    let accepted = interceptor.on_background_sync("sync-fuel-logs").await.unwrap();
    assert_eq!(accepted.replayed, 1);
    assert!(interceptor.caches().captured("runtime-cache").await.unwrap().is_empty());

    let replayed = net.requests().into_iter().last().unwrap();
    assert_eq!(replayed.method, reqwest::Method::POST);
    assert_eq!(replayed.url, write.url);
    assert_eq!(replayed.body.as_deref(), Some(&b"odometer=15000"[..]));
    assert_eq!(replayed.headers, write.headers);
}

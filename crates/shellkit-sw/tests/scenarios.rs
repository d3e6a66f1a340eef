//! End-to-end behaviour of install, activate and routing against a
//! scripted network.

use std::sync::Arc;
use std::time::Duration;

use shellkit_net::{MockFetcher, Request, RequestMode};
use shellkit_sw::{
    CacheStorage, FetchDisposition, InstallPolicy, RequestKey, ServiceWorker, ServiceWorkerError,
    ServiceWorkerEvent, ServiceWorkerState, WorkerConfig,
};
use url::Url;

const ORIGIN: &str = "https://app.example";

fn config(version: &str) -> WorkerConfig {
    WorkerConfig::new(
        Url::parse(&format!("{ORIGIN}/")).unwrap(),
        Url::parse(&format!("{ORIGIN}/")).unwrap(),
        version,
    )
    .with_precache(["/", "/index.html", "/app.js"])
}

fn network() -> Arc<MockFetcher> {
    let net = Arc::new(MockFetcher::new());
    net.route(&format!("{ORIGIN}/"), "<shell v1>")
        .route(&format!("{ORIGIN}/index.html"), "<index v1>")
        .route(&format!("{ORIGIN}/app.js"), "console.log(1)");
    net
}

fn worker(config: WorkerConfig, storage: Arc<CacheStorage>, net: Arc<MockFetcher>) -> ServiceWorker {
    let (sw, _events) = ServiceWorker::new(config.resolve().unwrap(), storage, net);
    sw
}

fn get(path: &str) -> Request {
    Request::parse(&format!("{ORIGIN}{path}")).unwrap()
}

fn navigate(url: &str) -> Request {
    Request::parse(url).unwrap().mode(RequestMode::Navigate)
}

async fn respond(sw: &ServiceWorker, request: &Request) -> shellkit_net::Response {
    match sw.handle_fetch(request).await.unwrap() {
        FetchDisposition::Respond(response) => response,
        FetchDisposition::Passthrough => panic!("expected a response for {}", request.url),
    }
}

#[tokio::test]
async fn offline_after_install_serves_shell_and_assets_but_not_api() {
    let storage = Arc::new(CacheStorage::in_memory());
    let net = network();
    let sw = worker(config("v1"), storage.clone(), net.clone());

    let (installed, _) = sw.start().await.unwrap();
    assert_eq!(installed.cached.len(), 3);
    assert_eq!(storage.open("v1").await.unwrap().len().await, 3);

    net.set_offline(true);

    // Any navigation resolves to the cached canonical document.
    for url in [
        format!("{ORIGIN}/orders/42"),
        "https://random-words.trycloudflare.com/".to_string(),
    ] {
        let response = respond(&sw, &navigate(&url)).await;
        assert!(response.from_cache);
        assert_eq!(response.text(), "<shell v1>");
    }

    let js = respond(&sw, &get("/app.js")).await;
    assert!(js.from_cache);
    assert_eq!(js.text(), "console.log(1)");

    let before = net.hits(&format!("{ORIGIN}/api/orders"));
    let err = sw.handle_fetch(&get("/api/orders")).await.unwrap_err();
    assert!(matches!(err, ServiceWorkerError::Network { .. }));
    assert_eq!(net.hits(&format!("{ORIGIN}/api/orders")), before + 1);
}

#[tokio::test]
async fn navigation_prefers_live_canonical_document() {
    let storage = Arc::new(CacheStorage::in_memory());
    let net = network();
    let sw = worker(config("v1"), storage, net.clone());
    sw.start().await.unwrap();

    net.route(&format!("{ORIGIN}/"), "<shell v1.1>");
    let response = respond(&sw, &navigate("https://tunnel.example.net/some/page")).await;

    assert!(!response.from_cache);
    assert_eq!(response.text(), "<shell v1.1>");
    assert_eq!(net.hits("https://tunnel.example.net/some/page"), 0);
}

#[tokio::test]
async fn navigation_does_not_fall_back_on_error_status() {
    let storage = Arc::new(CacheStorage::in_memory());
    let net = network();
    let sw = worker(config("v1"), storage, net.clone());
    sw.start().await.unwrap();

    net.route_status(&format!("{ORIGIN}/"), http::StatusCode::BAD_GATEWAY, "");
    let response = respond(&sw, &navigate(&format!("{ORIGIN}/"))).await;
    assert_eq!(response.status, http::StatusCode::BAD_GATEWAY);
    assert!(!response.from_cache);
}

#[tokio::test]
async fn navigation_fails_visibly_without_network_or_cache() {
    let storage = Arc::new(CacheStorage::in_memory());
    let net = network();
    let sw = worker(config("v1").with_precache(["/app.js"]), storage, net.clone());
    sw.start().await.unwrap();

    net.set_offline(true);
    let err = sw.handle_fetch(&navigate(&format!("{ORIGIN}/"))).await.unwrap_err();
    assert!(matches!(err, ServiceWorkerError::NavigationFailed { .. }));
}

#[tokio::test]
async fn api_requests_are_always_live() {
    let storage = Arc::new(CacheStorage::in_memory());
    let net = network();
    let sw = worker(config("v1").with_cache_on_miss(true), storage.clone(), net.clone());
    sw.start().await.unwrap();

    let url = format!("{ORIGIN}/api/orders");
    net.route(&url, r#"[{"id":1}]"#);
    assert_eq!(respond(&sw, &get("/api/orders")).await.text(), r#"[{"id":1}]"#);

    net.route(&url, r#"[{"id":1},{"id":2}]"#);
    let second = respond(&sw, &get("/api/orders")).await;
    assert_eq!(second.text(), r#"[{"id":1},{"id":2}]"#);
    assert!(!second.from_cache);

    // Even a planted stale entry is ignored.
    let cache = storage.open("v1").await.unwrap();
    cache
        .put(RequestKey::get(&Url::parse(&url).unwrap()), &second)
        .await
        .unwrap();
    net.set_offline(true);
    assert!(sw.handle_fetch(&get("/api/orders")).await.is_err());
}

#[tokio::test]
async fn cache_first_miss_without_write_back() {
    let storage = Arc::new(CacheStorage::in_memory());
    let net = network();
    net.route(&format!("{ORIGIN}/late.css"), "body{}");
    let sw = worker(config("v1"), storage.clone(), net.clone());
    sw.start().await.unwrap();

    let first = respond(&sw, &get("/late.css")).await;
    assert!(!first.from_cache);
    let second = respond(&sw, &get("/late.css")).await;
    assert!(!second.from_cache);
    assert_eq!(net.hits(&format!("{ORIGIN}/late.css")), 2);
    assert_eq!(storage.open("v1").await.unwrap().len().await, 3);
}

#[tokio::test]
async fn cache_first_miss_with_write_back() {
    let storage = Arc::new(CacheStorage::in_memory());
    let net = network();
    net.route(&format!("{ORIGIN}/late.css"), "body{}");
    net.route_status(&format!("{ORIGIN}/gone.css"), http::StatusCode::NOT_FOUND, "");
    let sw = worker(config("v1").with_cache_on_miss(true), storage.clone(), net.clone());
    sw.start().await.unwrap();

    assert!(!respond(&sw, &get("/late.css")).await.from_cache);
    assert!(respond(&sw, &get("/late.css")).await.from_cache);
    assert_eq!(net.hits(&format!("{ORIGIN}/late.css")), 1);

    // Error statuses are passed on but never stored.
    respond(&sw, &get("/gone.css")).await;
    respond(&sw, &get("/gone.css")).await;
    assert_eq!(net.hits(&format!("{ORIGIN}/gone.css")), 2);
}

#[tokio::test]
async fn cache_first_miss_propagates_network_failure() {
    let storage = Arc::new(CacheStorage::in_memory());
    let net = network();
    let sw = worker(config("v1"), storage, net.clone());
    sw.start().await.unwrap();

    net.set_offline(true);
    let err = sw.handle_fetch(&get("/never-cached.png")).await.unwrap_err();
    assert!(matches!(err, ServiceWorkerError::Network { .. }));
}

#[tokio::test]
async fn unclassified_requests_pass_through() {
    let storage = Arc::new(CacheStorage::in_memory());
    let net = network();
    let sw = worker(config("v1"), storage, net.clone());
    sw.start().await.unwrap();

    let request = Request::parse("https://analytics.example.org/collect").unwrap();
    let disposition = sw.handle_fetch(&request).await.unwrap();
    assert!(matches!(disposition, FetchDisposition::Passthrough));
    assert_eq!(net.hits("https://analytics.example.org/collect"), 0);
}

#[tokio::test]
async fn new_generation_replaces_old_one() {
    let storage = Arc::new(CacheStorage::in_memory());
    let net = network();
    net.route(&format!("{ORIGIN}/legacy.js"), "old");

    let v1 = worker(
        config("v1").with_precache(["/", "/index.html", "/app.js", "/legacy.js"]),
        storage.clone(),
        net.clone(),
    );
    v1.start().await.unwrap();
    assert!(respond(&v1, &get("/legacy.js")).await.from_cache);

    let v2 = worker(config("v2"), storage.clone(), net.clone());
    let (_, activated) = v2.start().await.unwrap();

    assert_eq!(activated.deleted, vec!["v1".to_string()]);
    assert_eq!(storage.keys().await, vec!["v2".to_string()]);

    // Only cached under v1: v2 misses and goes live.
    let before = net.hits(&format!("{ORIGIN}/legacy.js"));
    let legacy = respond(&v2, &get("/legacy.js")).await;
    assert!(!legacy.from_cache);
    assert_eq!(net.hits(&format!("{ORIGIN}/legacy.js")), before + 1);
}

#[tokio::test]
async fn activation_is_idempotent() {
    let storage = Arc::new(CacheStorage::in_memory());
    let sw = worker(config("v1"), storage.clone(), network());
    sw.start().await.unwrap();

    let again = sw.activate().await.unwrap();
    assert!(again.deleted.is_empty());
    assert_eq!(storage.keys().await, vec!["v1".to_string()]);
    assert_eq!(storage.open("v1").await.unwrap().len().await, 3);
    assert_eq!(sw.current_generation().as_deref(), Some("v1"));
}

#[tokio::test]
async fn failed_v2_install_keeps_v1_serving() {
    let storage = Arc::new(CacheStorage::in_memory());
    let net = network();
    let v1 = worker(config("v1"), storage.clone(), net.clone());
    v1.start().await.unwrap();

    net.fail(&format!("{ORIGIN}/app.js"));
    let v2 = worker(config("v2"), storage.clone(), net.clone());
    assert!(v2.start().await.is_err());

    assert_eq!(storage.keys().await, vec!["v1".to_string()]);
    assert!(respond(&v1, &get("/app.js")).await.from_cache);
}

#[tokio::test]
async fn best_effort_install_retries_then_skips() {
    let storage = Arc::new(CacheStorage::in_memory());
    let net = network();
    net.fail(&format!("{ORIGIN}/app.js"));

    let mut cfg = config("v1").with_install_policy(InstallPolicy::BestEffort);
    cfg.precache_attempts = 2;
    let sw = worker(cfg, storage.clone(), net.clone());

    let (installed, _) = sw.start().await.unwrap();
    assert_eq!(installed.skipped.len(), 1);
    assert_eq!(net.hits(&format!("{ORIGIN}/app.js")), 2);
    assert_eq!(storage.open("v1").await.unwrap().len().await, 2);
}

#[tokio::test]
async fn stale_deletion_failures_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(CacheStorage::open_dir(dir.path()).await.unwrap());
    storage.open("old-a").await.unwrap();
    storage.open("old-b").await.unwrap();

    // A directory where the generation file should be cannot be removed as a file.
    let stuck = dir.path().join("old-a.json");
    std::fs::remove_file(&stuck).unwrap();
    std::fs::create_dir(&stuck).unwrap();

    let sw = worker(config("v1"), storage.clone(), network());
    let (_, activated) = sw.start().await.unwrap();

    assert_eq!(activated.deleted, vec!["old-b".to_string()]);
    assert_eq!(activated.failed.len(), 1);
    assert_eq!(activated.failed[0].0, "old-a");
    assert_eq!(sw.current_generation().as_deref(), Some("v1"));
    assert_eq!(storage.keys().await, vec!["old-a".to_string(), "v1".to_string()]);
}

#[tokio::test]
async fn durable_generation_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let net = network();

    {
        let storage = Arc::new(CacheStorage::open_dir(dir.path()).await.unwrap());
        worker(config("v1"), storage, net.clone()).start().await.unwrap();
    }

    net.set_offline(true);
    let storage = Arc::new(CacheStorage::open_dir(dir.path()).await.unwrap());
    let sw = worker(config("v1"), storage, net.clone());

    // Offline reinstall fails strictly but leaves the existing generation intact.
    assert!(sw.install().await.is_err());
    assert_eq!(sw.state().await, ServiceWorkerState::Redundant);

    let restarted = worker(
        config("v1").with_install_policy(InstallPolicy::BestEffort),
        Arc::new(CacheStorage::open_dir(dir.path()).await.unwrap()),
        net.clone(),
    );
    restarted.start().await.unwrap();
    let js = respond(&restarted, &get("/app.js")).await;
    assert!(js.from_cache);
    assert_eq!(js.text(), "console.log(1)");
}

#[tokio::test]
async fn in_flight_snapshot_is_not_torn_by_activation() {
    let storage = Arc::new(CacheStorage::in_memory());
    let net = network();
    let v1 = worker(config("v1"), storage.clone(), net.clone());
    v1.start().await.unwrap();

    let handle = storage.open("v1").await.unwrap();
    let v2 = worker(config("v2"), storage.clone(), net.clone());
    v2.start().await.unwrap();

    // The v1 handle was deleted from storage but still answers consistently.
    assert!(handle.is_deleted());
    let entry = handle
        .match_request(&RequestKey::get(&Url::parse(&format!("{ORIGIN}/app.js")).unwrap()))
        .await;
    assert!(entry.is_some());
}

#[tokio::test]
async fn activation_waits_for_precache_to_finish() {
    let storage = Arc::new(CacheStorage::in_memory());
    let net = network();
    for path in ["/", "/index.html", "/app.js"] {
        net.delay(&format!("{ORIGIN}{path}"), Duration::from_millis(50));
    }
    let (sw, mut events) =
        ServiceWorker::new(config("v1").resolve().unwrap(), storage.clone(), net.clone());

    // Install takes the lifecycle first; activation queues behind it.
    let (installed, activated) = tokio::join!(sw.install(), sw.activate());
    assert_eq!(installed.unwrap().cached.len(), 3);
    let activated = activated.unwrap();
    assert_eq!(activated.version, "v1");

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ServiceWorkerEvent::StateChange { new_state, .. } = event {
            states.push(new_state);
        }
    }
    assert_eq!(
        states,
        vec![
            ServiceWorkerState::Installing,
            ServiceWorkerState::Installed,
            ServiceWorkerState::Activating,
            ServiceWorkerState::Activated,
        ]
    );
    assert_eq!(storage.open("v1").await.unwrap().len().await, 3);
}

#[tokio::test]
async fn fetch_started_before_activation_keeps_its_snapshot() {
    let storage = Arc::new(CacheStorage::in_memory());
    let net = network();
    let late = format!("{ORIGIN}/late.css");
    net.route(&late, "body{}")
        .delay(&late, Duration::from_millis(100));
    let sw = worker(config("v1").with_cache_on_miss(true), storage.clone(), net.clone());
    sw.install().await.unwrap();

    // No generation is current yet when the fetch starts, so its late
    // response is not written into the one activated meanwhile.
    let late_req = get("/late.css");
    let (fetched, activated) = tokio::join!(sw.handle_fetch(&late_req), sw.activate());
    activated.unwrap();
    let response = fetched.unwrap().into_response().unwrap();
    assert!(!response.from_cache);

    let v1 = storage.open("v1").await.unwrap();
    assert!(v1
        .match_request(&RequestKey::get(&Url::parse(&late).unwrap()))
        .await
        .is_none());

    // Requests after activation see v1 and write back into it.
    assert!(!respond(&sw, &get("/late.css")).await.from_cache);
    assert!(respond(&sw, &get("/late.css")).await.from_cache);
    assert_eq!(net.hits(&late), 2);
}

#[tokio::test]
async fn in_flight_fetch_is_not_torn_by_replacement() {
    let storage = Arc::new(CacheStorage::in_memory());
    let net = network();
    let late = format!("{ORIGIN}/late.css");
    net.route(&late, "body{}")
        .delay(&late, Duration::from_millis(100));

    let v1 = worker(config("v1").with_cache_on_miss(true), storage.clone(), net.clone());
    v1.start().await.unwrap();
    let v2 = worker(config("v2"), storage.clone(), net.clone());

    // v1's request holds the v1 snapshot while v2 installs and deletes v1.
    let late_req = get("/late.css");
    let (fetched, started) = tokio::join!(v1.handle_fetch(&late_req), v2.start());
    let (_, activated) = started.unwrap();
    assert_eq!(activated.deleted, vec!["v1".to_string()]);

    let response = fetched.unwrap().into_response().unwrap();
    assert_eq!(response.text(), "body{}");

    assert_eq!(storage.keys().await, vec!["v2".to_string()]);
    let v2_cache = storage.open("v2").await.unwrap();
    assert!(v2_cache
        .match_request(&RequestKey::get(&Url::parse(&late).unwrap()))
        .await
        .is_none());

    // Its precached assets are still answered from v1 by the v1 worker.
    assert!(respond(&v1, &get("/app.js")).await.from_cache);
}

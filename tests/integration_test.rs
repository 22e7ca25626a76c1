use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anthropic_lb::configuration::Config;
use anthropic_lb::metric::Metrics;
use anthropic_lb::proxy::Dispatcher;
use anthropic_lb::server::{AppState, build_router};
use anthropic_lb::storage::{self, UsageStorage};
use anthropic_lb::tracker::SubscriptionTracker;
use anthropic_lb::upstream::UpstreamClient;
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::sleep;

// ---------------------------------------------------------------------------
// Mock upstream
// ---------------------------------------------------------------------------

/// Scriptable stand-in for the Anthropic API. Per-credential status scripts
/// are consumed in order; anything unscripted answers 200. Behaviour knobs
/// ride on passthrough request headers.
#[derive(Clone, Default)]
struct MockUpstream {
    scripts: Arc<Mutex<HashMap<String, VecDeque<u16>>>>,
    hits: Arc<Mutex<Vec<String>>>,
}

impl MockUpstream {
    fn script(&self, api_key: &str, statuses: &[u16]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(api_key.to_string(), statuses.iter().copied().collect());
    }

    fn hits(&self) -> Vec<String> {
        self.hits.lock().unwrap().clone()
    }
}

fn header_ms(req: &Request, name: &str) -> Option<u64> {
    req.headers()
        .get(name)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
}

async fn mock_handler(State(mock): State<MockUpstream>, req: Request) -> Response {
    let api_key = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            req.headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        })
        .unwrap_or_else(|| "<missing>".to_string());
    mock.hits.lock().unwrap().push(api_key.clone());

    let status = mock
        .scripts
        .lock()
        .unwrap()
        .get_mut(&api_key)
        .and_then(|queue| queue.pop_front())
        .unwrap_or(200);

    if let Some(latency) = header_ms(&req, "x-mock-latency-ms") {
        sleep(Duration::from_millis(latency)).await;
    }
    let chunk_delay = header_ms(&req, "x-mock-chunk-delay-ms").unwrap_or(30);

    let body = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .unwrap_or_default();
    let streaming = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("stream").and_then(serde_json::Value::as_bool))
        .unwrap_or(false);

    if status != 200 {
        return Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(format!("{{\"error\":\"status {status}\"}}")))
            .unwrap();
    }

    if streaming {
        let chunks = futures_util::stream::unfold(0u32, move |i| async move {
            if i >= 3 {
                return None;
            }
            sleep(Duration::from_millis(chunk_delay)).await;
            Some((
                Ok::<_, std::convert::Infallible>(Bytes::from(format!("c{}", i + 1))),
                i + 1,
            ))
        });
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .body(Body::from_stream(chunks))
            .unwrap()
    } else {
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .header("request-id", "req_mock_1")
            .header("content-encoding", "identity")
            .body(Body::from(format!("{{\"ok\":true,\"key\":\"{api_key}\"}}")))
            .unwrap()
    }
}

async fn spawn_mock_upstream() -> (SocketAddr, MockUpstream) {
    let mock = MockUpstream::default();
    let app = Router::new()
        .route("/{*path}", any(mock_handler))
        .with_state(mock.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock upstream failed");
    });
    (addr, mock)
}

// ---------------------------------------------------------------------------
// Proxy harness
// ---------------------------------------------------------------------------

struct Harness {
    addr: SocketAddr,
    tracker: Arc<SubscriptionTracker>,
    config_path: PathBuf,
    _tmp: tempfile::TempDir,
    _shutdown: oneshot::Sender<()>,
}

impl Harness {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

/// `upstream_yaml` holds extra keys for the `upstream:` block, indented two
/// spaces (e.g. `"  request_timeout_secs: 1\n"`).
async fn spawn_proxy(subscriptions_yaml: &str, upstream: SocketAddr, upstream_yaml: &str) -> Harness {
    let tmp = tempfile::TempDir::new().unwrap();
    let storage_path = tmp.path().join("usage.db");
    let yaml = format!(
        r#"
subscriptions:
{subscriptions_yaml}
rate_limit:
  cooldown_seconds: 60
upstream:
  base_url: "http://{upstream}"
{upstream_yaml}
storage:
  path: "{}"
"#,
        storage_path.display()
    );
    let config_path = tmp.path().join("config.yaml");
    std::fs::write(&config_path, &yaml).unwrap();

    let config = Config::load(&config_path).expect("valid harness config");

    let metrics = Arc::new(Metrics::new());
    let tracker = Arc::new(SubscriptionTracker::new(
        config.subscriptions.clone(),
        config.rate_limit.cooldown_seconds,
        metrics.clone(),
    ));
    let upstream_client = Arc::new(UpstreamClient::new(&config.upstream).unwrap());
    let usage_storage = Arc::new(UsageStorage::open(&config.storage.path).unwrap());
    let usage_tx = storage::start_writer(usage_storage.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        tracker.clone(),
        upstream_client,
        metrics,
        &config.upstream.base_url,
        Some(usage_tx),
    ));

    let state = AppState {
        config: Arc::new(RwLock::new(Arc::new(config))),
        config_path: Arc::new(config_path.clone()),
        tracker: tracker.clone(),
        dispatcher,
        storage: usage_storage,
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("proxy server failed");
    });

    Harness {
        addr,
        tracker,
        config_path,
        _tmp: tmp,
        _shutdown: shutdown_tx,
    }
}

const TWO_SUBSCRIPTIONS: &str = r#"  - name: a
    api_key: sk-ant-api03-a
    max_concurrent: 5
    priority: 1
  - name: b
    api_key: sk-ant-api03-b
    max_concurrent: 5
    priority: 2"#;

const ONE_SUBSCRIPTION: &str = r#"  - name: a
    api_key: sk-ant-api03-a
    max_concurrent: 5
    priority: 1"#;

async fn wait_until(mut probe: impl FnMut() -> bool) {
    for _ in 0..100 {
        if probe() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

fn messages_body(stream: bool) -> serde_json::Value {
    serde_json::json!({"model": "claude-sonnet-4-5", "stream": stream})
}

// ---------------------------------------------------------------------------
// End-to-end scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn forwards_to_preferred_subscription_byte_identical() {
    let (upstream, mock) = spawn_mock_upstream().await;
    let harness = spawn_proxy(TWO_SUBSCRIPTIONS, upstream, "").await;

    let client = reqwest::Client::new();
    let response = client
        .post(harness.url("/v1/messages"))
        .json(&messages_body(false))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    // Hop-by-hop headers are stripped, the rest pass through verbatim.
    assert_eq!(response.headers().get("request-id").unwrap(), "req_mock_1");
    assert!(response.headers().get("content-encoding").is_none());
    let body = response.text().await.unwrap();
    assert_eq!(body, r#"{"ok":true,"key":"sk-ant-api03-a"}"#);

    assert_eq!(mock.hits(), vec!["sk-ant-api03-a"]);
    let a = harness.tracker.get("a").unwrap();
    assert_eq!(a.active(), 0);
    assert_eq!(a.total_requests(), 1);
    assert_eq!(a.total_errors(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn retries_on_429_and_cools_down_first_choice() {
    let (upstream, mock) = spawn_mock_upstream().await;
    let harness = spawn_proxy(TWO_SUBSCRIPTIONS, upstream, "").await;
    mock.script("sk-ant-api03-a", &[429]);

    let client = reqwest::Client::new();
    let response = client
        .post(harness.url("/v1/messages"))
        .json(&messages_body(false))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.text().await.unwrap();
    assert_eq!(body, r#"{"ok":true,"key":"sk-ant-api03-b"}"#);

    assert_eq!(mock.hits(), vec!["sk-ant-api03-a", "sk-ant-api03-b"]);
    let a = harness.tracker.get("a").unwrap();
    let b = harness.tracker.get("b").unwrap();
    assert!(a.in_cooldown());
    assert_eq!(a.total_requests(), 1);
    assert_eq!(a.total_errors(), 1);
    assert_eq!(b.total_requests(), 1);
    assert!(!b.in_cooldown());
}

#[tokio::test(flavor = "multi_thread")]
async fn all_subscriptions_rate_limited() {
    let (upstream, mock) = spawn_mock_upstream().await;
    let harness = spawn_proxy(TWO_SUBSCRIPTIONS, upstream, "").await;
    mock.script("sk-ant-api03-a", &[429]);
    mock.script("sk-ant-api03-b", &[429]);

    let client = reqwest::Client::new();
    let response = client
        .post(harness.url("/v1/messages"))
        .json(&messages_body(false))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["error"]["type"], "rate_limit");
    assert!(
        json["error"]["message"]
            .as_str()
            .unwrap()
            .starts_with("All subscriptions rate limited")
    );

    assert_eq!(mock.hits().len(), 2);
    assert!(harness.tracker.get("a").unwrap().in_cooldown());
    assert!(harness.tracker.get("b").unwrap().in_cooldown());
}

#[tokio::test(flavor = "multi_thread")]
async fn sheds_load_when_disabled_or_saturated() {
    let (upstream, mock) = spawn_mock_upstream().await;
    let subs = r#"  - name: a
    api_key: sk-ant-api03-a
    enabled: false
  - name: b
    api_key: sk-ant-api03-b
    max_concurrent: 1
    priority: 2"#;
    let harness = spawn_proxy(subs, upstream, "").await;

    // Occupy b's only slot with a slow streaming response.
    let client = reqwest::Client::new();
    let held = client
        .post(harness.url("/v1/messages"))
        .header("x-mock-chunk-delay-ms", "400")
        .json(&messages_body(true))
        .send()
        .await
        .unwrap();
    assert_eq!(held.status(), StatusCode::OK);
    assert_eq!(harness.tracker.get("b").unwrap().active(), 1);

    let response = client
        .post(harness.url("/v1/messages"))
        .json(&messages_body(false))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["error"]["type"], "overloaded");
    // Only the held streaming request ever reached the upstream.
    assert_eq!(mock.hits().len(), 1);

    drop(held);
}

#[tokio::test(flavor = "multi_thread")]
async fn streams_chunks_through_in_order() {
    let (upstream, _mock) = spawn_mock_upstream().await;
    let harness = spawn_proxy(ONE_SUBSCRIPTION, upstream, "").await;

    let client = reqwest::Client::new();
    let response = client
        .post(harness.url("/v1/messages"))
        .json(&messages_body(true))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let mut collected = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(&collected[..], b"c1c2c3");

    let tracker = harness.tracker.clone();
    wait_until(move || tracker.get("a").unwrap().active() == 0).await;
    assert_eq!(harness.tracker.get("a").unwrap().total_errors(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn streaming_429_is_terminal_and_cools_down() {
    let (upstream, mock) = spawn_mock_upstream().await;
    let harness = spawn_proxy(ONE_SUBSCRIPTION, upstream, "").await;
    mock.script("sk-ant-api03-a", &[429]);

    let client = reqwest::Client::new();
    let response = client
        .post(harness.url("/v1/messages"))
        .json(&messages_body(true))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["error"]["type"], "rate_limit");

    assert_eq!(mock.hits().len(), 1);
    let a = harness.tracker.get("a").unwrap();
    assert!(a.in_cooldown());
    assert_eq!(a.active(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_body_rejected_before_upstream() {
    let (upstream, mock) = spawn_mock_upstream().await;
    let harness = spawn_proxy(ONE_SUBSCRIPTION, upstream, "").await;

    let client = reqwest::Client::new();
    let response = client
        .post(harness.url("/v1/messages"))
        .header("content-type", "application/json")
        .body(vec![b'x'; 10 * 1024 * 1024 + 1])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["error"]["type"], "request_too_large");
    assert!(mock.hits().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn client_disconnect_releases_slot_without_error() {
    let (upstream, _mock) = spawn_mock_upstream().await;
    let harness = spawn_proxy(ONE_SUBSCRIPTION, upstream, "").await;

    let client = reqwest::Client::new();
    let response = client
        .post(harness.url("/v1/messages"))
        .header("x-mock-chunk-delay-ms", "300")
        .json(&messages_body(true))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(harness.tracker.get("a").unwrap().active(), 1);

    // Walk away mid-stream.
    drop(response);

    let tracker = harness.tracker.clone();
    wait_until(move || tracker.get("a").unwrap().active() == 0).await;
    assert_eq!(harness.tracker.get("a").unwrap().total_errors(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_upstream_maps_to_502() {
    // Reserve a port and close it again so nothing is listening there.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let harness = spawn_proxy(ONE_SUBSCRIPTION, dead_addr, "").await;

    let client = reqwest::Client::new();
    let response = client
        .post(harness.url("/v1/messages"))
        .json(&messages_body(false))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["error"]["type"], "proxy_error");
    assert_eq!(harness.tracker.get("a").unwrap().total_errors(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_upstream_maps_to_504() {
    let (upstream, _mock) = spawn_mock_upstream().await;
    let harness = spawn_proxy(ONE_SUBSCRIPTION, upstream, "  request_timeout_secs: 1\n").await;

    let client = reqwest::Client::new();
    let response = client
        .post(harness.url("/v1/messages"))
        .header("x-mock-latency-ms", "2500")
        .json(&messages_body(false))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["error"]["type"], "timeout");
    assert_eq!(harness.tracker.get("a").unwrap().total_errors(), 1);
}

// ---------------------------------------------------------------------------
// Administrative surface
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn health_and_status_endpoints() {
    let (upstream, _mock) = spawn_mock_upstream().await;
    let harness = spawn_proxy(TWO_SUBSCRIPTIONS, upstream, "").await;

    let client = reqwest::Client::new();
    let health: serde_json::Value = client
        .get(harness.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");

    let status: serde_json::Value = client
        .get(harness.url("/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = status["subscriptions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["a", "b"]);
    assert_eq!(status["total_capacity"], 10);
    assert_eq!(status["total_active"], 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn utilization_ingest_feeds_the_scorer() {
    let (upstream, mock) = spawn_mock_upstream().await;
    let harness = spawn_proxy(TWO_SUBSCRIPTIONS, upstream, "").await;

    let client = reqwest::Client::new();
    // Subscription a is far ahead of pace; b should now win selection even
    // though a has the better priority.
    let samples = serde_json::json!({
        "a": {"five_hour": {"utilization": 95.0, "hours_to_reset": 4.0}},
        "b": {"five_hour": {"utilization": 5.0, "hours_to_reset": 4.0}},
    });
    let response = client
        .put(harness.url("/admin/utilization"))
        .json(&samples)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["accepted"], 2);

    let proxied = client
        .post(harness.url("/v1/messages"))
        .json(&messages_body(false))
        .send()
        .await
        .unwrap();
    assert_eq!(proxied.status(), StatusCode::OK);
    assert_eq!(mock.hits(), vec!["sk-ant-api03-b"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn runtime_disable_and_enable() {
    let (upstream, mock) = spawn_mock_upstream().await;
    let harness = spawn_proxy(ONE_SUBSCRIPTION, upstream, "").await;

    let client = reqwest::Client::new();
    let disabled: serde_json::Value = client
        .post(harness.url("/admin/subscriptions/a/disable"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(disabled["enabled"], false);

    let response = client
        .post(harness.url("/v1/messages"))
        .json(&messages_body(false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(mock.hits().is_empty());

    client
        .post(harness.url("/admin/subscriptions/a/enable"))
        .send()
        .await
        .unwrap();
    let response = client
        .post(harness.url("/v1/messages"))
        .json(&messages_body(false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let missing = client
        .post(harness.url("/admin/subscriptions/nope/enable"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn reload_installs_new_subscription_set() {
    let (upstream, _mock) = spawn_mock_upstream().await;
    let harness = spawn_proxy(ONE_SUBSCRIPTION, upstream, "").await;

    let updated = format!(
        r#"
subscriptions:
  - name: a
    api_key: sk-ant-api03-a
  - name: c
    api_key: sk-ant-api03-c
    priority: 3
upstream:
  base_url: "http://{upstream}"
"#
    );
    std::fs::write(&harness.config_path, updated).unwrap();

    let client = reqwest::Client::new();
    let reloaded: serde_json::Value = client
        .post(harness.url("/admin/reload"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reloaded["reloaded"], true);
    assert_eq!(reloaded["subscriptions"], 2);

    assert!(harness.tracker.get("c").is_some());
    let status: serde_json::Value = client
        .get(harness.url("/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["subscriptions"].as_array().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn usage_statistics_are_recorded_and_queryable() {
    let (upstream, _mock) = spawn_mock_upstream().await;
    let harness = spawn_proxy(ONE_SUBSCRIPTION, upstream, "").await;

    let client = reqwest::Client::new();
    let response = client
        .post(harness.url("/v1/messages"))
        .header("x-client-id", "test-suite")
        .json(&messages_body(false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The usage writer is fire-and-forget; poll until the record lands.
    let mut usage = serde_json::Value::Null;
    for _ in 0..100 {
        usage = client
            .get(harness.url("/admin/usage"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if usage["total_requests"] == 1 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(usage["total_requests"], 1);
    assert_eq!(usage["by_subscription"]["a"]["requests"], 1);
    assert_eq!(usage["by_client"]["test-suite"]["requests"], 1);

    let clients: serde_json::Value = client
        .get(harness.url("/admin/clients"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(clients[0]["client_id"], "test-suite");
    assert_eq!(clients[0]["total_requests"], 1);
}

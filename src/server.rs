//! Edge surface: the axum router, admission on administrative routes, and
//! process lifecycle signals (graceful shutdown, SIGHUP reload).

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;

use crate::configuration::{Config, ConfigError, Network};
use crate::proxy::{CLIENT_ID_HEADER, Dispatcher, ProxyError};
use crate::storage::UsageStorage;
use crate::tracker::{SubscriptionTracker, UtilizationSample};

/// Shared-secret header checked on remote access.
pub const API_TOKEN_HEADER: &str = "x-api-token";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<Arc<Config>>>,
    pub config_path: Arc<PathBuf>,
    pub tracker: Arc<SubscriptionTracker>,
    pub dispatcher: Arc<Dispatcher>,
    pub storage: Arc<UsageStorage>,
}

impl AppState {
    fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read().expect("config lock poisoned"))
    }
}

fn is_local_peer(config: &Config, peer: IpAddr) -> bool {
    if peer.is_loopback() {
        return true;
    }
    config
        .server
        .local_networks
        .iter()
        .any(|net| Network::parse(net).is_ok_and(|n| n.contains(peer)))
}

fn token_matches(config: &Config, headers: &HeaderMap) -> bool {
    let token = &config.external.api_token;
    !token.is_empty()
        && headers
            .get(API_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|presented| presented == token)
}

fn client_allowed(config: &Config, headers: &HeaderMap) -> bool {
    if config.external.allowed_clients.is_empty() {
        return true;
    }
    headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|id| config.external.allowed_clients.iter().any(|c| c == id))
}

/// Administrative routes: loopback and local networks pass, remote callers
/// need the shared token (and an allowlisted identity when configured).
pub fn admit_admin(config: &Config, peer: IpAddr, headers: &HeaderMap) -> Result<(), ProxyError> {
    if is_local_peer(config, peer) {
        return Ok(());
    }
    if token_matches(config, headers) && client_allowed(config, headers) {
        return Ok(());
    }
    Err(ProxyError::unauthorized())
}

/// The proxy route additionally requires external access to be enabled for
/// remote callers.
pub fn admit_proxy(config: &Config, peer: IpAddr, headers: &HeaderMap) -> Result<(), ProxyError> {
    if is_local_peer(config, peer) {
        return Ok(());
    }
    if config.external.enabled && token_matches(config, headers) && client_allowed(config, headers)
    {
        return Ok(());
    }
    Err(ProxyError::unauthorized())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy"}))
}

async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let config = state.config();
    if let Err(err) = admit_proxy(&config, peer.ip(), req.headers()) {
        return err.into_response();
    }
    let client_id = req
        .headers()
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string());
    state.dispatcher.dispatch(req, client_id).await
}

async fn status_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = admit_admin(&state.config(), peer.ip(), &headers) {
        return err.into_response();
    }
    Json(state.tracker.status()).into_response()
}

async fn utilization_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(samples): Json<HashMap<String, UtilizationSample>>,
) -> Response {
    if let Err(err) = admit_admin(&state.config(), peer.ip(), &headers) {
        return err.into_response();
    }
    let accepted = samples.len();
    state.tracker.set_utilization(samples);
    Json(serde_json::json!({"accepted": accepted})).into_response()
}

async fn reload_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = admit_admin(&state.config(), peer.ip(), &headers) {
        return err.into_response();
    }
    match reload_from_disk(&state) {
        Ok(count) => {
            Json(serde_json::json!({"reloaded": true, "subscriptions": count})).into_response()
        }
        Err(e) => {
            log::error!("config reload failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": {"type": "proxy_error", "message": e.to_string()}
                })),
            )
                .into_response()
        }
    }
}

fn set_enabled_response(state: &AppState, name: &str, enabled: bool) -> Response {
    if state.tracker.set_enabled(name, enabled) {
        Json(serde_json::json!({"name": name, "enabled": enabled})).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": {"type": "not_found", "message": format!("unknown subscription '{name}'")}
            })),
        )
            .into_response()
    }
}

async fn enable_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = admit_admin(&state.config(), peer.ip(), &headers) {
        return err.into_response();
    }
    set_enabled_response(&state, &name, true)
}

async fn disable_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = admit_admin(&state.config(), peer.ip(), &headers) {
        return err.into_response();
    }
    set_enabled_response(&state, &name, false)
}

#[derive(Deserialize)]
struct UsageQuery {
    #[serde(default = "default_period")]
    period: String,
}

fn default_period() -> String {
    "day".to_string()
}

async fn usage_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<UsageQuery>,
) -> Response {
    if let Err(err) = admit_admin(&state.config(), peer.ip(), &headers) {
        return err.into_response();
    }
    match state.storage.usage(&query.period) {
        Ok(report) => Json(report).into_response(),
        Err(e) => storage_error(e),
    }
}

async fn clients_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = admit_admin(&state.config(), peer.ip(), &headers) {
        return err.into_response();
    }
    match state.storage.clients() {
        Ok(clients) => Json(clients).into_response(),
        Err(e) => storage_error(e),
    }
}

fn storage_error(e: rusqlite::Error) -> Response {
    log::error!("usage store query failed: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "error": {"type": "proxy_error", "message": "usage store unavailable"}
        })),
    )
        .into_response()
}

/// Re-read the config file and install the new subscription set. In-flight
/// requests drain against retired records.
pub fn reload_from_disk(state: &AppState) -> Result<usize, ConfigError> {
    let config = Config::load(&state.config_path)?;
    state
        .tracker
        .replace_subscriptions(config.subscriptions.clone());
    let count = config.subscriptions.len();
    *state.config.write().expect("config lock poisoned") = Arc::new(config);
    log::info!("configuration reloaded ({count} subscriptions)");
    Ok(count)
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status_handler))
        .route("/admin/utilization", put(utilization_handler))
        .route("/admin/reload", post(reload_handler))
        .route("/admin/subscriptions/{name}/enable", post(enable_handler))
        .route("/admin/subscriptions/{name}/disable", post(disable_handler))
        .route("/admin/usage", get(usage_handler))
        .route("/admin/clients", get(clients_handler))
        .route("/v1/{*path}", any(proxy_handler))
        .with_state(state)
}

/// How long raw request-log rows are kept before the daily prune.
const USAGE_RETENTION_DAYS: i64 = 90;

fn spawn_usage_cleanup(storage: Arc<UsageStorage>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(24 * 60 * 60)).await;
            if let Err(e) = storage.cleanup_older_than(USAGE_RETENTION_DAYS) {
                log::error!("usage cleanup failed: {e}");
            }
        }
    });
}

/// Serve until SIGTERM/ctrl-c; SIGHUP reloads the config.
pub async fn run(state: AppState, listener: TcpListener) -> std::io::Result<()> {
    spawn_reload_on_sighup(state.clone());
    spawn_usage_cleanup(state.storage.clone());
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
}

#[cfg(unix)]
fn spawn_reload_on_sighup(state: AppState) {
    use tokio::signal::unix::{SignalKind, signal};
    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                log::error!("failed to install SIGHUP handler: {e}");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            if let Err(e) = reload_from_disk(&state) {
                log::error!("config reload failed: {e}");
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_sighup(_state: AppState) {}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install ctrl-c handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("received ctrl-c, shutting down"),
        _ = terminate => log::info!("received SIGTERM, shutting down"),
    }
}

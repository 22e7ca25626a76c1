//! Request dispatching: credential selection, retry-on-429 for buffered
//! requests, unbuffered streaming pass-through, and the JSON error envelope
//! for proxy-originated failures.

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, to_bytes};
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::metric::Metrics;
use crate::storage::UsageEvent;
use crate::tracker::{ClientClass, SubscriptionTracker};
use crate::upstream::{UpstreamError, UpstreamTransport};

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Extra attempts after the first one when an upstream answers 429.
pub const MAX_429_RETRIES: usize = 2;

pub const CLIENT_ID_HEADER: &str = "x-client-id";
pub const CLIENT_CLASS_HEADER: &str = "x-client-class";

const OAUTH_TOKEN_PREFIX: &str = "sk-ant-oat";
const API_KEY_PREFIX: &str = "sk-ant-api";

/// Request headers replaced per attempt and never forwarded.
const SKIP_REQUEST_HEADERS: [&str; 5] = [
    "host",
    "authorization",
    "x-api-key",
    "content-length",
    "transfer-encoding",
];

/// Hop-by-hop response headers, stripped from both forwarded directions.
const SKIP_RESPONSE_HEADERS: [&str; 4] = [
    "content-encoding",
    "content-length",
    "transfer-encoding",
    "connection",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Overloaded,
    RateLimit,
    RequestTooLarge,
    Timeout,
    ProxyError,
    Unauthorized,
    NotReady,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::RequestTooLarge => "request_too_large",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ProxyError => "proxy_error",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NotReady => "not_ready",
        }
    }

    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::Overloaded | ErrorKind::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::ProxyError => StatusCode::BAD_GATEWAY,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }
}

/// A proxy-originated failure, rendered as the wire-format error envelope.
/// Upstream-originated statuses are never wrapped in this.
#[derive(Debug, Clone)]
pub struct ProxyError {
    kind: ErrorKind,
    message: Cow<'static, str>,
}

impl ProxyError {
    pub fn overloaded() -> Self {
        Self {
            kind: ErrorKind::Overloaded,
            message: Cow::Borrowed(
                "All API subscriptions are currently at capacity. Please retry.",
            ),
        }
    }

    pub fn rate_limited() -> Self {
        Self {
            kind: ErrorKind::RateLimit,
            message: Cow::Borrowed("Rate limited. Please retry."),
        }
    }

    pub fn all_rate_limited() -> Self {
        Self {
            kind: ErrorKind::RateLimit,
            message: Cow::Borrowed("All subscriptions rate limited. Please retry later."),
        }
    }

    pub fn request_too_large() -> Self {
        Self {
            kind: ErrorKind::RequestTooLarge,
            message: Cow::Borrowed("Request body exceeds the 10 MiB limit."),
        }
    }

    pub fn timeout() -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: Cow::Borrowed("Request timed out."),
        }
    }

    pub fn transport() -> Self {
        Self {
            kind: ErrorKind::ProxyError,
            message: Cow::Borrowed("Failed to connect to upstream."),
        }
    }

    pub fn unauthorized() -> Self {
        Self {
            kind: ErrorKind::Unauthorized,
            message: Cow::Borrowed("Invalid or missing API token."),
        }
    }

    pub fn not_ready() -> Self {
        Self {
            kind: ErrorKind::NotReady,
            message: Cow::Borrowed("No subscriptions configured."),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<UpstreamError> for ProxyError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Timeout(_) => ProxyError::timeout(),
            UpstreamError::Transport(_) => ProxyError::transport(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "type": self.kind.as_str(),
                "message": self.message.as_ref(),
            }
        })
        .to_string();
        (
            self.kind.status(),
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}

/// A request declares streaming via a boolean `stream` field in its JSON
/// body. Anything unparsable is treated as non-streaming.
pub fn is_streaming_request(body: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("stream").and_then(serde_json::Value::as_bool))
        .unwrap_or(false)
}

/// Rebuild the header set for one upstream attempt: everything passes
/// through except the skip set, and authentication is derived from the
/// credential's prefix.
pub fn build_upstream_headers(incoming: &HeaderMap, api_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in incoming.iter() {
        if SKIP_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    // OAuth-style tokens and unrecognized secrets go out as Bearer; plain
    // API keys use x-api-key.
    let bearer =
        api_key.starts_with(OAUTH_TOKEN_PREFIX) || !api_key.starts_with(API_KEY_PREFIX);
    if bearer {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
            headers.insert(header::AUTHORIZATION, value);
        }
    } else if let Ok(value) = HeaderValue::from_str(api_key) {
        headers.insert(HeaderName::from_static("x-api-key"), value);
    }

    headers
}

/// Forward an upstream response, minus the hop-by-hop header set.
fn forward_response(status: StatusCode, headers: &HeaderMap, body: Body) -> Response {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers.iter() {
        if SKIP_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder.body(body).unwrap_or_else(|e| {
        log::error!("failed to assemble forwarded response: {e}");
        ProxyError::transport().into_response()
    })
}

fn short_request_id() -> String {
    let id = uuid::Uuid::now_v7().simple().to_string();
    // trailing chars hold the random bits
    id[id.len() - 8..].to_string()
}

struct RequestContext {
    id: String,
    method: Method,
    url: String,
    path: String,
    headers: HeaderMap,
    body: Bytes,
    client_id: String,
    classification: Option<ClientClass>,
}

/// The request-handling path between the edge and the upstream client.
pub struct Dispatcher {
    tracker: Arc<SubscriptionTracker>,
    transport: Arc<dyn UpstreamTransport>,
    metrics: Arc<Metrics>,
    base_url: String,
    usage: Option<mpsc::UnboundedSender<UsageEvent>>,
}

impl Dispatcher {
    pub fn new(
        tracker: Arc<SubscriptionTracker>,
        transport: Arc<dyn UpstreamTransport>,
        metrics: Arc<Metrics>,
        base_url: &str,
        usage: Option<mpsc::UnboundedSender<UsageEvent>>,
    ) -> Self {
        Self {
            tracker,
            transport,
            metrics,
            base_url: base_url.trim_end_matches('/').to_string(),
            usage,
        }
    }

    /// Proxy one inbound request. `client_id` is the caller identity the
    /// edge resolved (header or peer address).
    pub async fn dispatch(&self, req: Request, client_id: String) -> Response {
        let (parts, body) = req.into_parts();

        if let Some(advertised) = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok())
        {
            if advertised > MAX_BODY_BYTES {
                return ProxyError::request_too_large().into_response();
            }
        }

        let body = match to_bytes(body, MAX_BODY_BYTES).await {
            Ok(body) => body,
            Err(_) => return ProxyError::request_too_large().into_response(),
        };

        if self.tracker.is_empty() {
            return ProxyError::not_ready().into_response();
        }

        let path_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string());

        let classification = parts
            .headers
            .get(CLIENT_CLASS_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(ClientClass::parse);

        let ctx = RequestContext {
            id: short_request_id(),
            url: format!("{}{}", self.base_url, path_query),
            path: parts.uri.path().to_string(),
            method: parts.method,
            headers: parts.headers,
            body,
            client_id,
            classification,
        };

        if is_streaming_request(&ctx.body) {
            log::info!("[{}] {} {} (streaming)", ctx.id, ctx.method, ctx.path);
            self.dispatch_streaming(ctx).await
        } else {
            log::info!("[{}] {} {}", ctx.id, ctx.method, ctx.path);
            self.dispatch_buffered(ctx).await
        }
    }

    /// Streaming requests are never retried: once upstream bytes may have
    /// flowed, the only options are pass-through or a terminal error.
    async fn dispatch_streaming(&self, ctx: RequestContext) -> Response {
        let start = Instant::now();
        let Some(state) = self.tracker.select(Some(&ctx.client_id), ctx.classification) else {
            return ProxyError::overloaded().into_response();
        };
        let Some(guard) = self.tracker.try_acquire(&state) else {
            return ProxyError::overloaded().into_response();
        };
        self.tracker.record_affinity(&ctx.client_id, state.name());

        let headers = build_upstream_headers(&ctx.headers, state.api_key());
        log::info!("[{}] routing to {} (streaming)", ctx.id, state.name());

        let upstream = match self
            .transport
            .request_streaming(ctx.method.clone(), &ctx.url, headers, ctx.body.clone())
            .await
        {
            Ok(upstream) => upstream,
            Err(err) => {
                self.tracker.record_error(&state);
                log::error!("[{}] {} (subscription {})", ctx.id, err, state.name());
                return ProxyError::from(err).into_response();
            }
        };

        self.metrics.record(state.name(), upstream.status.as_u16());
        if upstream.status == StatusCode::TOO_MANY_REQUESTS {
            // drops the upstream body without draining it
            self.tracker.record_rate_limit(&state);
            self.report_usage(&ctx, state.name(), upstream.status.as_u16(), start);
            return ProxyError::rate_limited().into_response();
        }
        self.report_usage(&ctx, state.name(), upstream.status.as_u16(), start);

        // The slot guard rides inside the stream: it drops when the body
        // finishes or the downstream client goes away, and a disconnect is
        // not an error.
        let request_id = ctx.id.clone();
        let subscription = state.name().to_string();
        let body = upstream.body.map(move |chunk| {
            let _guard = &guard;
            if let Err(err) = &chunk {
                log::error!("[{request_id}] stream error from {subscription}: {err}");
            }
            chunk
        });

        forward_response(upstream.status, &upstream.headers, Body::from_stream(body))
    }

    /// Buffered requests retry on 429 with the rate-limited subscription
    /// excluded, up to `1 + MAX_429_RETRIES` attempts.
    async fn dispatch_buffered(&self, ctx: RequestContext) -> Response {
        let start = Instant::now();
        let mut excluded: HashSet<String> = HashSet::new();

        for _ in 0..=MAX_429_RETRIES {
            let Some(state) = self.tracker.select(Some(&ctx.client_id), ctx.classification)
            else {
                if excluded.is_empty() {
                    return ProxyError::overloaded().into_response();
                }
                break;
            };
            if excluded.contains(state.name()) {
                break;
            }
            let Some(guard) = self.tracker.try_acquire(&state) else {
                // lost the select/acquire race; pick again
                continue;
            };
            self.tracker.record_affinity(&ctx.client_id, state.name());

            let headers = build_upstream_headers(&ctx.headers, state.api_key());
            log::info!("[{}] routing to {}", ctx.id, state.name());

            let result = self
                .transport
                .request(ctx.method.clone(), &ctx.url, headers, ctx.body.clone())
                .await;
            drop(guard);

            match result {
                Ok(response) => {
                    self.metrics.record(state.name(), response.status.as_u16());
                    if response.status == StatusCode::TOO_MANY_REQUESTS {
                        self.tracker.record_rate_limit(&state);
                        excluded.insert(state.name().to_string());
                        continue;
                    }
                    if response.status.is_server_error() {
                        self.tracker.record_error(&state);
                    }
                    self.report_usage(&ctx, state.name(), response.status.as_u16(), start);
                    return forward_response(
                        response.status,
                        &response.headers,
                        Body::from(response.body),
                    );
                }
                Err(err) => {
                    // the upstream may already have executed the request, so
                    // a transport failure is terminal rather than retried
                    self.tracker.record_error(&state);
                    log::error!("[{}] {} (subscription {})", ctx.id, err, state.name());
                    return ProxyError::from(err).into_response();
                }
            }
        }

        log::warn!("[{}] all subscriptions rate limited", ctx.id);
        ProxyError::all_rate_limited().into_response()
    }

    fn report_usage(&self, ctx: &RequestContext, subscription: &str, status: u16, start: Instant) {
        if let Some(tx) = &self.usage {
            let event = UsageEvent {
                client_id: ctx.client_id.clone(),
                subscription: subscription.to_string(),
                method: ctx.method.to_string(),
                path: ctx.path.clone(),
                status_code: status,
                latency_ms: start.elapsed().as_millis() as u64,
            };
            let _ = tx.send(event);
        }
    }
}

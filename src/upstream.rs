//! Upstream HTTP transport.
//!
//! One long-lived client with a bounded keep-alive pool serves every
//! request, buffered or streamed. Non-2xx statuses are not transport
//! failures; they are handed back so the dispatcher can apply its retry
//! and cooldown policy.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::configuration::UpstreamConfig;

const MAX_IDLE_CONNECTIONS_PER_HOST: usize = 20;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request timed out: {0}")]
    Timeout(String),
    #[error("upstream transport failure: {0}")]
    Transport(String),
}

fn classify(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Timeout(err.to_string())
    } else {
        UpstreamError::Transport(err.to_string())
    }
}

pub struct BufferedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct StreamingResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Body chunks in upstream order. Dropping the stream closes the
    /// upstream connection without draining it.
    pub body: BoxStream<'static, Result<Bytes, UpstreamError>>,
}

/// The transport seam between the dispatcher and the network.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Send a request and collect the whole response body.
    async fn request(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<BufferedResponse, UpstreamError>;

    /// Send a request and hand the response body back as a chunk stream.
    async fn request_streaming(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<StreamingResponse, UpstreamError>;
}

/// Long-lived `reqwest` client shared by all requests.
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS_PER_HOST)
            .build()?;
        log::info!(
            "upstream client initialized (connect timeout {}s, request timeout {}s)",
            config.connect_timeout_secs,
            config.request_timeout_secs
        );
        Ok(Self { client })
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, UpstreamError> {
        self.client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(classify)
    }
}

#[async_trait]
impl UpstreamTransport for UpstreamClient {
    async fn request(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<BufferedResponse, UpstreamError> {
        let response = self.send(method, url, headers, body).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(classify)?;
        Ok(BufferedResponse {
            status,
            headers,
            body,
        })
    }

    async fn request_streaming(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<StreamingResponse, UpstreamError> {
        let response = self.send(method, url, headers, body).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(classify))
            .boxed();
        Ok(StreamingResponse {
            status,
            headers,
            body,
        })
    }
}

//! Outbound HTTP to target services

use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, Method, Response},
};
use bytes::Bytes;
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::{Error, GatewayError, Result};

/// Request body handed to an [`Upstream`]
#[derive(Debug)]
pub enum UpstreamBody {
    /// No body
    Empty,
    /// Fully buffered; may be replayed across attempts
    Full(Bytes),
    /// Streamed through once
    Stream(Body),
}

impl From<Option<Bytes>> for UpstreamBody {
    fn from(bytes: Option<Bytes>) -> Self {
        match bytes {
            Some(b) if !b.is_empty() => Self::Full(b),
            _ => Self::Empty,
        }
    }
}

/// One attempt against a target
#[derive(Debug)]
pub struct UpstreamRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute target URL
    pub url: Url,
    /// Headers after forwarding rules have been applied
    pub headers: HeaderMap,
    /// Body
    pub body: UpstreamBody,
    /// Deadline for the response head
    pub timeout: Duration,
}

impl UpstreamRequest {
    /// `GET` with no body, used by health probes
    #[must_use]
    pub fn get(url: Url, timeout: Duration) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: UpstreamBody::Empty,
            timeout,
        }
    }
}

/// Transport to target services.
///
/// Implementations map connection failures to
/// [`GatewayError::upstream_unreachable`] and missed deadlines to
/// [`GatewayError::upstream_timeout`]. Any HTTP response, whatever its status,
/// is `Ok`.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send one request and return the response with a streaming body
    async fn send(&self, request: UpstreamRequest) -> std::result::Result<Response<Body>, GatewayError>;
}

/// `reqwest`-backed upstream with a shared connection pool
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: Client,
}

impl HttpUpstream {
    /// Create a pooled client
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .connect_timeout(Duration::from_secs(10))
            // Redirects are the client's business
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn send(&self, request: UpstreamRequest) -> std::result::Result<Response<Body>, GatewayError> {
        let UpstreamRequest {
            method,
            url,
            headers,
            body,
            timeout,
        } = request;

        let mut builder = self.client.request(method, url.clone()).headers(headers);
        builder = match body {
            UpstreamBody::Empty => builder,
            UpstreamBody::Full(bytes) => builder.body(bytes),
            UpstreamBody::Stream(body) => builder.body(reqwest::Body::wrap_stream(body.into_data_stream())),
        };

        // Deadline covers connect and response head; the body then streams freely
        let response = match tokio::time::timeout(timeout, builder.send()).await {
            Err(_) => {
                return Err(GatewayError::upstream_timeout(format!(
                    "{url} did not respond within {}ms",
                    timeout.as_millis()
                )));
            }
            Ok(Err(e)) if e.is_timeout() => {
                return Err(GatewayError::upstream_timeout(format!("{url}: {e}")));
            }
            Ok(Err(e)) => return Err(GatewayError::upstream_unreachable(format!("{url}: {e}"))),
            Ok(Ok(response)) => response,
        };

        debug!(url = %url, status = %response.status(), "Upstream responded");

        let mut out = Response::builder().status(response.status());
        if let Some(headers) = out.headers_mut() {
            *headers = response.headers().clone();
        }
        out.body(Body::from_stream(response.bytes_stream()))
            .map_err(|e| GatewayError::internal(format!("failed to build response: {e}")))
    }
}

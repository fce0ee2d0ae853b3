//! Forwarding admitted requests to target services
//!
//! The dispatcher owns the per-request policy: path rewrite, forwarding
//! headers, the route timeout and the retry budget. The actual transport sits
//! behind [`Upstream`] so the policy can be exercised without sockets.

mod headers;
mod upstream;

pub use headers::{forward_request_headers, strip_hop_by_hop};
pub use upstream::{HttpUpstream, Upstream, UpstreamBody, UpstreamRequest};

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{Body, HttpBody},
    http::{Request, Response, header},
};
use bytes::Bytes;
use tracing::{debug, warn};

use crate::GatewayError;
use crate::failsafe::{RetryPolicy, with_retry};
use crate::routing::Route;

/// Forwards requests to the resolved route's target
#[derive(Clone)]
pub struct ProxyDispatcher {
    upstream: Arc<dyn Upstream>,
    retry: RetryPolicy,
    replay_buffer_limit: usize,
}

impl ProxyDispatcher {
    /// Create a dispatcher
    #[must_use]
    pub fn new(upstream: Arc<dyn Upstream>, retry: RetryPolicy, replay_buffer_limit: usize) -> Self {
        Self {
            upstream,
            retry,
            replay_buffer_limit,
        }
    }

    /// Forward `request` to `route`.
    ///
    /// Small bodies of known length are buffered and retried on connection
    /// failures and timeouts; anything else is streamed in a single attempt.
    /// Upstream responses are returned as-is whatever their status.
    ///
    /// # Errors
    ///
    /// `RouteUnconfigured` for a disabled route, `UpstreamUnreachable` or
    /// `UpstreamTimeout` once attempts are exhausted.
    pub async fn dispatch(
        &self,
        request: Request<Body>,
        route: &Route,
        client_ip: Option<IpAddr>,
    ) -> Result<Response<Body>, GatewayError> {
        let path = request.uri().path().to_string();
        let Some(url) = route.upstream_url(&path, request.uri().query()) else {
            warn!(route = route.name(), path = %path, "Route has no target configured");
            return Err(GatewayError::route_unconfigured(route.name()).with_path(path));
        };

        let started = Instant::now();
        let (parts, body) = request.into_parts();
        let headers = forward_request_headers(&parts.headers, client_ip);

        let replayable_len = HttpBody::size_hint(&body)
            .exact()
            .and_then(|n| usize::try_from(n).ok())
            .filter(|n| *n <= self.replay_buffer_limit)
            .filter(|_| !parts.headers.contains_key(header::TRANSFER_ENCODING));

        let result = if let Some(len) = replayable_len {
            let bytes: Option<Bytes> = if len == 0 {
                None
            } else {
                Some(
                    axum::body::to_bytes(body, self.replay_buffer_limit)
                        .await
                        .map_err(|e| {
                            GatewayError::validation(format!("request body could not be read: {e}"))
                                .with_path(path.clone())
                        })?,
                )
            };

            with_retry(&self.retry, route.max_retries(), route.name(), || {
                let attempt = UpstreamRequest {
                    method: parts.method.clone(),
                    url: url.clone(),
                    headers: headers.clone(),
                    body: UpstreamBody::from(bytes.clone()),
                    timeout: route.timeout(),
                };
                let upstream = Arc::clone(&self.upstream);
                async move { upstream.send(attempt).await }
            })
            .await
        } else {
            debug!(route = route.name(), "Streaming request body; retries disabled");
            self.upstream
                .send(UpstreamRequest {
                    method: parts.method.clone(),
                    url: url.clone(),
                    headers,
                    body: UpstreamBody::Stream(body),
                    timeout: route.timeout(),
                })
                .await
        };

        let mut response = result.map_err(|e| e.with_path(path.clone()))?;
        strip_hop_by_hop(response.headers_mut());

        debug!(
            route = route.name(),
            method = %parts.method,
            upstream = %url,
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis(),
            "Proxied request"
        );
        telemetry_metrics::counter!(
            "gateway_requests_total",
            "route" => route.name().to_string(),
            "status" => response.status().as_u16().to_string()
        )
        .increment(1);

        Ok(response)
    }
}

impl std::fmt::Debug for ProxyDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyDispatcher")
            .field("retry", &self.retry)
            .field("replay_buffer_limit", &self.replay_buffer_limit)
            .finish_non_exhaustive()
    }
}

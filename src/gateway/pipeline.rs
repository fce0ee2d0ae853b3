//! Admission pipeline: authenticate, throttle, route
//!
//! Each stage passes a value forward or rejects with a [`GatewayError`]; the
//! first rejection short-circuits before any downstream call.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::http::{HeaderMap, Method, header};

use super::auth::{AuthGate, Principal};
use crate::GatewayError;
use crate::failsafe::{RateDecision, RateLimiter};
use crate::routing::{Route, RouteTable};

/// What the pipeline needs to know about an inbound request
#[derive(Debug, Clone, Copy)]
pub struct RequestHead<'a> {
    /// HTTP method
    pub method: &'a Method,
    /// Request path
    pub path: &'a str,
    /// Raw query string
    pub query: Option<&'a str>,
    /// Request headers
    pub headers: &'a HeaderMap,
    /// TCP peer address
    pub peer: Option<SocketAddr>,
}

impl RequestHead<'_> {
    /// Whether this is a WebSocket upgrade request
    #[must_use]
    pub fn is_upgrade(&self) -> bool {
        self.headers
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    }

    /// `token` query parameter, used by WebSocket handshakes
    #[must_use]
    pub fn query_token(&self) -> Option<String> {
        url::form_urlencoded::parse(self.query?.as_bytes())
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.into_owned())
    }
}

/// A request cleared by every stage
#[derive(Debug, Clone)]
pub struct Admission {
    /// Verified identity; `None` on public paths, with auth disabled, or for an
    /// upgrade deferring its credential to the first frame
    pub principal: Option<Principal>,
    /// Rate-limit key
    pub client_key: String,
    /// Client address behind the rate-limit key (first `X-Forwarded-For` hop
    /// when trusted, else the peer)
    pub client_ip: Option<IpAddr>,
    /// Resolved route
    pub route: Arc<Route>,
    /// WebSocket upgrade to be served by the realtime bridge
    pub upgrade: bool,
}

/// Ordered admission stages
#[derive(Debug)]
pub struct Pipeline {
    auth: Arc<AuthGate>,
    limiter: Arc<RateLimiter>,
    routes: Arc<RouteTable>,
    trust_forwarded_for: bool,
    realtime_enabled: bool,
}

impl Pipeline {
    /// Assemble the stages
    #[must_use]
    pub fn new(
        auth: Arc<AuthGate>,
        limiter: Arc<RateLimiter>,
        routes: Arc<RouteTable>,
        trust_forwarded_for: bool,
        realtime_enabled: bool,
    ) -> Self {
        Self {
            auth,
            limiter,
            routes,
            trust_forwarded_for,
            realtime_enabled,
        }
    }

    /// Route table
    #[must_use]
    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Run every stage
    ///
    /// # Errors
    ///
    /// The first stage's rejection, with the request path attached.
    pub fn admit(&self, head: &RequestHead<'_>) -> Result<Admission, GatewayError> {
        self.run(head).map_err(|e| e.with_path(head.path))
    }

    fn run(&self, head: &RequestHead<'_>) -> Result<Admission, GatewayError> {
        let upgrade = head.is_upgrade();
        let principal = self.authenticate(head, upgrade)?;
        let client_ip = self.client_ip(head);
        let client_key = match (&principal, client_ip) {
            (Some(p), _) => format!("sub:{}", p.subject()),
            (None, Some(ip)) => format!("ip:{ip}"),
            (None, None) => "ip:unknown".to_string(),
        };
        self.throttle(&client_key)?;
        let route = self.route(head, upgrade)?;

        Ok(Admission {
            principal,
            client_key,
            client_ip,
            route,
            upgrade,
        })
    }

    /// Authentication stage
    fn authenticate(&self, head: &RequestHead<'_>, upgrade: bool) -> Result<Option<Principal>, GatewayError> {
        if !self.auth.is_enabled() || self.auth.is_public_path(head.path) {
            return Ok(None);
        }
        if upgrade {
            // Browsers cannot set headers on upgrades: the credential rides in
            // the query, or in the first frame once the channel is open
            return match head.query_token() {
                Some(token) => self.auth.authenticate(Some(&token)).map(Some),
                None => Ok(None),
            };
        }
        self.auth.authenticate_header(head.headers).map(Some)
    }

    /// Rate-limit stage
    fn throttle(&self, client_key: &str) -> Result<(), GatewayError> {
        match self.limiter.admit(client_key) {
            RateDecision::Allowed { .. } => Ok(()),
            RateDecision::Throttled { retry_after } => Err(GatewayError::throttled(retry_after)),
        }
    }

    /// Routing stage
    fn route(&self, head: &RequestHead<'_>, upgrade: bool) -> Result<Arc<Route>, GatewayError> {
        let route = self
            .routes
            .resolve(head.path)
            .ok_or_else(GatewayError::route_not_found)?;
        if !route.is_configured() {
            tracing::warn!(route = route.name(), path = %head.path, "Route has no target configured");
            return Err(GatewayError::route_unconfigured(route.name()));
        }
        if upgrade && !(self.realtime_enabled && route.websocket_enabled()) {
            return Err(GatewayError::validation(
                "WebSocket upgrades are not accepted on this route",
            ));
        }
        Ok(route)
    }

    fn client_ip(&self, head: &RequestHead<'_>) -> Option<IpAddr> {
        if self.trust_forwarded_for {
            let forwarded = head
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|ip| ip.trim().parse().ok());
            if forwarded.is_some() {
                return forwarded;
            }
        }
        head.peer.map(|addr| addr.ip())
    }
}

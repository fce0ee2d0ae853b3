//! HTTP router and handlers

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, FromRequestParts, State, WebSocketUpgrade},
    http::{HeaderValue, Method, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowHeaders, AllowOrigin, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{debug, error, warn};

use super::auth::Principal;
use super::context::GatewayContext;
use super::pipeline::{Admission, Pipeline, RequestHead};
use crate::GatewayError;
use crate::config::CorsConfig;
use crate::health::HealthAggregator;
use crate::proxy::ProxyDispatcher;
use crate::realtime::RealtimeBridge;

/// Shared application state
pub struct AppState {
    /// Admission stages
    pub pipeline: Pipeline,
    /// HTTP forwarding
    pub dispatcher: ProxyDispatcher,
    /// Fleet health
    pub health: Arc<HealthAggregator>,
    /// Realtime rooms; `None` when realtime is disabled
    pub realtime: Option<Arc<RealtimeBridge>>,
    /// Process-wide state
    pub context: Arc<GatewayContext>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>, cors: &CorsConfig) -> Router {
    Router::new()
        .route("/healthz", get(liveness_handler))
        .route("/health/liveness", get(alive_handler))
        .route("/readyz", get(readiness_handler))
        .route("/health/readiness", get(readiness_handler))
        .route("/health", get(health_handler))
        .route("/api/v1/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(gateway_handler)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(CatchPanicLayer::custom(panic_response))
                .layer(cors_layer(cors))
                .layer(SetResponseHeaderLayer::if_not_present(
                    header::X_CONTENT_TYPE_OPTIONS,
                    HeaderValue::from_static("nosniff"),
                ))
                .layer(SetResponseHeaderLayer::if_not_present(
                    header::X_FRAME_OPTIONS,
                    HeaderValue::from_static("DENY"),
                ))
                .layer(SetResponseHeaderLayer::if_not_present(
                    header::REFERRER_POLICY,
                    HeaderValue::from_static("no-referrer"),
                )),
        )
        .with_state(state)
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers(AllowHeaders::mirror_request());

    if config.allowed_origins.iter().any(|o| o == "*") {
        // Wildcard origins cannot be combined with credentials
        return layer.allow_origin(AllowOrigin::any());
    }

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(config.allow_credentials)
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(detail = %detail, "Handler panicked");
    GatewayError::internal(detail.to_string()).into_response()
}

/// GET /healthz
async fn liveness_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /health/liveness
async fn alive_handler() -> impl IntoResponse {
    Json(json!({ "status": "alive" }))
}

/// GET /readyz, /health/readiness
async fn readiness_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ready = state.health.latest().is_ready() && !state.context.is_shutting_down();
    let (status, label) = if ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    };
    (status, Json(json!({ "status": label, "timestamp": Utc::now() })))
}

/// GET /health, /api/v1/health
async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let health = state.health.snapshot();
    let status = if health.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health.report())).into_response()
}

/// GET /metrics
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.context.render_metrics() {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => GatewayError::route_not_found().with_path("/metrics").into_response(),
    }
}

/// Everything else: admission pipeline, then proxy or realtime bridge
async fn gateway_handler(State(state): State<Arc<AppState>>, mut request: Request<Body>) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let admission = {
        let uri = request.uri();
        let head = RequestHead {
            method: request.method(),
            path: uri.path(),
            query: uri.query(),
            headers: request.headers(),
            peer,
        };
        match state.pipeline.admit(&head) {
            Ok(admission) => admission,
            Err(e) => return e.into_response(),
        }
    };

    if admission.upgrade {
        return upgrade(&state, request, admission).await;
    }

    attach_principal(&mut request, admission.principal);
    match state
        .dispatcher
        .dispatch(request, &admission.route, peer.map(|addr| addr.ip()))
        .await
    {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Make the verified identity available to everything handling the request
/// after admission
fn attach_principal(request: &mut Request<Body>, principal: Option<Principal>) {
    if let Some(principal) = principal {
        request.extensions_mut().insert(principal);
    }
}

async fn upgrade(state: &AppState, request: Request<Body>, admission: Admission) -> Response {
    let path = request.uri().path().to_string();
    let Some(bridge) = state.realtime.clone() else {
        return GatewayError::validation("WebSocket upgrades are not accepted on this route")
            .with_path(path)
            .into_response();
    };

    let (mut parts, _body) = request.into_parts();
    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(path = %path, error = %rejection, "WebSocket upgrade rejected");
            return GatewayError::validation("Invalid WebSocket upgrade request")
                .with_path(path)
                .into_response();
        }
    };

    debug!(route = admission.route.name(), client = %admission.client_key, "Upgrading to WebSocket");
    let principal = admission.principal;
    ws.on_upgrade(move |socket| bridge.serve(socket, principal))
}

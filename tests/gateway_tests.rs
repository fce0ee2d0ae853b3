//! HTTP surface tests driven through the assembled router

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{HeaderMap, Method, Request, Response, StatusCode, header};
use edge_gateway::GatewayError;
use edge_gateway::config::Config;
use edge_gateway::gateway::Gateway;
use edge_gateway::gateway::auth::{AuthGate, Claims};
use edge_gateway::proxy::{Upstream, UpstreamBody, UpstreamRequest};
use edge_gateway::realtime::MemoryBroker;
use pretty_assertions::assert_eq;
use serde_json::Value;
use tower::ServiceExt;

const SECRET: &str = "gateway-test-secret";

/// Records forwarded requests and replays a scripted sequence of outcomes,
/// answering 200 once the script runs out
#[derive(Default)]
struct ScriptedUpstream {
    script: Mutex<VecDeque<Result<StatusCode, GatewayError>>>,
    seen: Mutex<Vec<(Method, String, HeaderMap)>>,
    bodies: Mutex<Vec<&'static str>>,
}

impl ScriptedUpstream {
    fn with_script(outcomes: Vec<Result<StatusCode, GatewayError>>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            seen: Mutex::default(),
            bodies: Mutex::default(),
        }
    }

    /// How each attempt carried its body: `empty`, `full` or `stream`
    fn bodies(&self) -> Vec<&'static str> {
        self.bodies.lock().unwrap().clone()
    }

    fn seen(&self) -> Vec<(Method, String, HeaderMap)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<Response<Body>, GatewayError> {
        self.seen
            .lock()
            .unwrap()
            .push((request.method.clone(), request.url.to_string(), request.headers.clone()));
        self.bodies.lock().unwrap().push(match &request.body {
            UpstreamBody::Empty => "empty",
            UpstreamBody::Full(_) => "full",
            UpstreamBody::Stream(_) => "stream",
        });
        let outcome = self.script.lock().unwrap().pop_front().unwrap_or(Ok(StatusCode::OK));
        outcome.map(|status| {
            Response::builder()
                .status(status)
                .header(header::CONNECTION, "keep-alive")
                .header("x-upstream", "scripted")
                .body(Body::from(format!("{{\"upstream\":\"{}\"}}", request.url.path())))
                .unwrap()
        })
    }
}

fn config(extra_routes: &str) -> Config {
    config_with("", extra_routes)
}

fn config_with(server: &str, extra_routes: &str) -> Config {
    Config::from_yaml(&format!(
        r#"
{server}
auth:
  jwt_secret: "{SECRET}"
rate_limit:
  max_requests: 3
  window: 60s
retry:
  initial_backoff: 1ms
  max_backoff: 2ms
routes:
  - prefix: /api/v1/users
    target: http://users.test
    max_retries: 2
    path_rewrite:
      - pattern: "^/api/v1/users"
        replacement: ""
  - prefix: /api/v1/messages
    target: http://messages.test
    websocket: true
{extra_routes}"#
    ))
    .unwrap()
}

fn gateway(config: Config, upstream: Arc<ScriptedUpstream>) -> Gateway {
    Gateway::with_components(config, upstream, Arc::new(MemoryBroker::default())).unwrap()
}

fn token(subject: &str) -> String {
    let config = config("");
    AuthGate::from_config(&config.auth)
        .unwrap()
        .issue(subject, Duration::from_secs(300), Claims::new())
        .unwrap()
}

fn get(path: &str, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(Method::GET).uri(path);
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn json_body(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_missing_credential_returns_envelope() {
    let upstream = Arc::new(ScriptedUpstream::default());
    let gateway = gateway(config(""), Arc::clone(&upstream));

    let response = gateway.router().oneshot(get("/api/v1/users/1", None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
    let body = json_body(response).await;
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "UNAUTHORIZED");
    assert_eq!(body["message"], "Unauthorized");
    assert_eq!(body["path"], "/api/v1/users/1");
    assert!(body["timestamp"].is_string());
    assert!(upstream.seen().is_empty());
}

#[tokio::test]
async fn test_invalid_credential_is_rejected() {
    let gateway = gateway(config(""), Arc::new(ScriptedUpstream::default()));

    let response = gateway
        .router()
        .oneshot(get("/api/v1/users/1", Some("not.a.jwt")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_authenticated_request_is_proxied() {
    let upstream = Arc::new(ScriptedUpstream::default());
    let gateway = gateway(config(""), Arc::clone(&upstream));
    let token = token("alice");

    let response = gateway
        .router()
        .oneshot(get("/api/v1/users/42?expand=true", Some(&token)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-upstream"], "scripted");
    assert!(response.headers().get(header::CONNECTION).is_none());
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(json_body(response).await["upstream"], "/42");

    let seen = upstream.seen();
    assert_eq!(seen.len(), 1);
    let (method, url, headers) = &seen[0];
    assert_eq!(method, Method::GET);
    assert_eq!(url, "http://users.test/42?expand=true");
    assert!(headers.contains_key(header::AUTHORIZATION));
    assert_eq!(headers["x-forwarded-proto"], "http");
}

#[tokio::test]
async fn test_throttled_after_limit() {
    let gateway = gateway(config(""), Arc::new(ScriptedUpstream::default()));
    let router = gateway.router();
    let token = token("alice");

    for _ in 0..3 {
        let response = router
            .clone()
            .oneshot(get("/api/v1/users", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = router.clone().oneshot(get("/api/v1/users", Some(&token))).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));
    assert_eq!(json_body(response).await["code"], "TOO_MANY_REQUESTS");

    // Another subject has its own window
    let response = router.oneshot(get("/api/v1/users", Some(&self::token("bob")))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_prefix_is_not_found() {
    let gateway = gateway(config(""), Arc::new(ScriptedUpstream::default()));

    let response = gateway
        .router()
        .oneshot(get("/api/v1/usersettings", Some(&token("alice"))))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["code"], "ROUTE_NOT_FOUND");
    assert_eq!(body["path"], "/api/v1/usersettings");
}

#[tokio::test]
async fn test_public_path_skips_authentication() {
    let gateway = gateway(config(""), Arc::new(ScriptedUpstream::default()));

    // /api/v1/auth is public by default but has no route in this table
    let response = gateway.router().oneshot(get("/api/v1/auth/login", None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unconfigured_route_is_unavailable() {
    let upstream = Arc::new(ScriptedUpstream::default());
    let gateway = gateway(config("  - prefix: /api/v1/legacy\n"), Arc::clone(&upstream));

    let response = gateway
        .router()
        .oneshot(get("/api/v1/legacy/report", Some(&token("alice"))))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["code"], "ROUTE_UNCONFIGURED");
    assert!(upstream.seen().is_empty());
}

#[tokio::test]
async fn test_connection_failures_are_retried() {
    let upstream = Arc::new(ScriptedUpstream::with_script(vec![
        Err(GatewayError::upstream_unreachable("connection refused")),
        Err(GatewayError::upstream_unreachable("connection refused")),
    ]));
    let gateway = gateway(config(""), Arc::clone(&upstream));

    let response = gateway
        .router()
        .oneshot(get("/api/v1/users/1", Some(&token("alice"))))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(upstream.seen().len(), 3);
}

#[tokio::test]
async fn test_exhausted_retries_return_bad_gateway() {
    let refused = || Err(GatewayError::upstream_unreachable("connection refused to 10.0.0.9"));
    let upstream = Arc::new(ScriptedUpstream::with_script(vec![refused(), refused(), refused(), refused()]));
    let gateway = gateway(config(""), Arc::clone(&upstream));

    let response = gateway
        .router()
        .oneshot(get("/api/v1/users/1", Some(&token("alice"))))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    // max_retries: 2 means three attempts
    assert_eq!(upstream.seen().len(), 3);
    let body = json_body(response).await;
    assert_eq!(body["code"], "UPSTREAM_UNREACHABLE");
    assert!(!body.to_string().contains("10.0.0.9"));
}

fn post(path: &str, body: Body) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::AUTHORIZATION, format!("Bearer {}", token("alice")))
        .body(body)
        .unwrap()
}

fn small_buffer_config() -> Config {
    config_with("server:\n  replay_buffer_limit: 16", "")
}

#[tokio::test]
async fn test_large_body_is_streamed_in_one_attempt() {
    let refused = || Err(GatewayError::upstream_unreachable("connection refused"));
    let upstream = Arc::new(ScriptedUpstream::with_script(vec![refused(), refused(), refused()]));
    let gateway = gateway(small_buffer_config(), Arc::clone(&upstream));

    let response = gateway
        .router()
        .oneshot(post("/api/v1/users", Body::from(vec![b'x'; 64])))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(upstream.bodies(), vec!["stream"]);
    assert_eq!(json_body(response).await["code"], "UPSTREAM_UNREACHABLE");
}

#[tokio::test]
async fn test_body_of_unknown_length_is_streamed_in_one_attempt() {
    let refused = || Err(GatewayError::upstream_unreachable("connection refused"));
    let upstream = Arc::new(ScriptedUpstream::with_script(vec![refused(), refused(), refused()]));
    let gateway = gateway(small_buffer_config(), Arc::clone(&upstream));
    let chunks = futures::stream::iter(vec![
        Ok::<_, std::io::Error>(bytes::Bytes::from_static(b"ab")),
        Ok(bytes::Bytes::from_static(b"cd")),
    ]);

    let response = gateway
        .router()
        .oneshot(post("/api/v1/users", Body::from_stream(chunks)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(upstream.bodies(), vec!["stream"]);
}

#[tokio::test]
async fn test_small_body_is_buffered_and_retried() {
    let refused = || Err(GatewayError::upstream_unreachable("connection refused"));
    let upstream = Arc::new(ScriptedUpstream::with_script(vec![refused(), refused(), refused()]));
    let gateway = gateway(small_buffer_config(), Arc::clone(&upstream));

    let response = gateway
        .router()
        .oneshot(post("/api/v1/users", Body::from("tiny")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(upstream.bodies(), vec!["full", "full", "full"]);
}

#[tokio::test]
async fn test_upstream_timeout_maps_to_gateway_timeout() {
    let upstream = Arc::new(ScriptedUpstream::with_script(vec![
        Err(GatewayError::upstream_timeout("30s elapsed")),
        Err(GatewayError::upstream_timeout("30s elapsed")),
        Err(GatewayError::upstream_timeout("30s elapsed")),
    ]));
    let gateway = gateway(config(""), upstream);

    let response = gateway
        .router()
        .oneshot(get("/api/v1/users/1", Some(&token("alice"))))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(json_body(response).await["code"], "UPSTREAM_TIMEOUT");
}

#[tokio::test]
async fn test_upstream_errors_pass_through_without_retry() {
    let upstream = Arc::new(ScriptedUpstream::with_script(vec![Ok(StatusCode::INTERNAL_SERVER_ERROR)]));
    let gateway = gateway(config(""), Arc::clone(&upstream));

    let response = gateway
        .router()
        .oneshot(get("/api/v1/users/1", Some(&token("alice"))))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(upstream.seen().len(), 1);
}

#[tokio::test]
async fn test_upgrade_on_plain_route_is_rejected() {
    let gateway = gateway(config(""), Arc::new(ScriptedUpstream::default()));
    let request = Request::builder()
        .uri(format!("/api/v1/users/socket?token={}", token("alice")))
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_VERSION, "13")
        .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
        .body(Body::empty())
        .unwrap();

    let response = gateway.router().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "VALIDATION_FAILED");
}

#[tokio::test]
async fn test_liveness_is_unconditional() {
    let gateway = gateway(config(""), Arc::new(ScriptedUpstream::default()));

    let response = gateway.router().oneshot(get("/healthz", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ok");

    let response = gateway.router().oneshot(get("/health/liveness", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_readiness_follows_health_cycles() {
    let gateway = gateway(config(""), Arc::new(ScriptedUpstream::default()));

    let response = gateway.router().oneshot(get("/readyz", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    gateway.health().run_cycle().await;

    let response = gateway.router().oneshot(get("/readyz", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ready");

    gateway.context().shutdown();
    let response = gateway.router().oneshot(get("/health/readiness", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_health_report_lists_services() {
    let gateway = gateway(config("  - prefix: /api/v1/legacy\n"), Arc::new(ScriptedUpstream::default()));
    gateway.health().run_cycle().await;

    let response = gateway.router().oneshot(get("/api/v1/health", None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["gateway"]["status"], "healthy");
    assert_eq!(body["gateway"]["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["services"]["users"]["status"], "healthy");
    assert!(body["services"]["users"]["responseTime"].is_u64());
    assert_eq!(body["services"]["legacy"]["status"], "unavailable");
    assert_eq!(body["services"]["legacy"]["error"], "Service URL not configured");
}

#[tokio::test]
async fn test_security_headers_on_every_response() {
    let gateway = gateway(config(""), Arc::new(ScriptedUpstream::default()));

    let response = gateway.router().oneshot(get("/nowhere", None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
    assert_eq!(response.headers()[header::X_FRAME_OPTIONS], "DENY");
}

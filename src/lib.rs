//! Edge Gateway Library
//!
//! Sits in front of a fleet of backend services and routes HTTP and WebSocket
//! traffic to them by path prefix.
//!
//! # Features
//!
//! - **Routing**: longest-prefix route table with regex path rewriting
//! - **Authentication**: HMAC-signed JWT bearer credentials, public path whitelist
//! - **Rate Limiting**: fixed-window counters per subject or client address
//! - **Proxying**: streaming bodies, per-route timeouts, retries with backoff
//! - **Health**: concurrent fleet probing behind `/health` and `/readyz`
//! - **Realtime**: WebSocket rooms fanned out across instances via Redis pub/sub
//!
//! Request flow: authenticate, throttle, resolve route, then dispatch to the
//! proxy or the realtime bridge.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod gateway;
pub mod health;
pub mod proxy;
pub mod realtime;
pub mod routing;

pub use error::{Error, ErrorEnvelope, ErrorKind, GatewayError, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging. `RUST_LOG` takes precedence over `level`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Internal(format!("tracing already initialised: {e}")))
}

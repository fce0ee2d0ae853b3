//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::auth::AuthGate;
use super::context::GatewayContext;
use super::pipeline::Pipeline;
use super::router::{AppState, create_router};
use crate::config::{BrokerKind, Config};
use crate::failsafe::{RateLimiter, RetryPolicy};
use crate::health::HealthAggregator;
use crate::proxy::{HttpUpstream, ProxyDispatcher, Upstream};
use crate::realtime::{Broker, MemoryBroker, RealtimeBridge, RedisBroker};
use crate::routing::RouteTable;
use crate::{Error, Result};

/// Edge gateway server
///
/// [`Gateway::new`] is the single place where components are constructed and
/// wired together.
pub struct Gateway {
    config: Config,
    context: Arc<GatewayContext>,
    routes: Arc<RouteTable>,
    limiter: Arc<RateLimiter>,
    health: Arc<HealthAggregator>,
    realtime: Option<Arc<RealtimeBridge>>,
    state: Arc<AppState>,
}

impl Gateway {
    /// Create a gateway with the configured upstream client and broker
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the broker cannot
    /// be reached.
    pub async fn new(config: Config) -> Result<Self> {
        let upstream: Arc<dyn Upstream> = Arc::new(HttpUpstream::new()?);
        let broker: Arc<dyn Broker> = match config.broker.kind {
            BrokerKind::Memory => Arc::new(MemoryBroker::new(config.realtime.buffer_size)),
            BrokerKind::Redis => {
                let url = config
                    .broker
                    .redis_url
                    .as_deref()
                    .ok_or_else(|| Error::Config("broker.redis_url is required".to_string()))?;
                Arc::new(RedisBroker::connect(url, &config.broker.channel_prefix).await?)
            }
        };
        Self::with_components(config, upstream, broker)
    }

    /// Create a gateway with explicit transport and broker
    ///
    /// # Errors
    ///
    /// Returns an error if the routes or auth settings are invalid.
    pub fn with_components(config: Config, upstream: Arc<dyn Upstream>, broker: Arc<dyn Broker>) -> Result<Self> {
        let context = Arc::new(GatewayContext::init());
        let routes = Arc::new(RouteTable::new(&config.routes)?);
        let auth = Arc::new(AuthGate::from_config(&config.auth)?);
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));

        for route in routes.routes() {
            match route.target() {
                Some(target) => info!(
                    route = route.name(),
                    prefix = route.prefix(),
                    target = %target,
                    timeout_ms = route.timeout().as_millis(),
                    retries = route.max_retries(),
                    websocket = route.websocket_enabled(),
                    "Registered route"
                ),
                None => warn!(route = route.name(), prefix = route.prefix(), "Route has no target; requests will fail"),
            }
        }

        let health = Arc::new(HealthAggregator::new(
            &routes,
            Arc::clone(&upstream),
            &config.health,
            context.started(),
        ));

        let realtime = config.realtime.enabled.then(|| {
            Arc::new(RealtimeBridge::new(
                context.instance_id(),
                broker,
                Arc::clone(&auth),
                config.realtime.clone(),
                context.shutdown_token().child_token(),
            ))
        });

        let state = Arc::new(AppState {
            pipeline: Pipeline::new(
                auth,
                Arc::clone(&limiter),
                Arc::clone(&routes),
                config.server.trust_forwarded_for,
                config.realtime.enabled,
            ),
            dispatcher: ProxyDispatcher::new(
                upstream,
                RetryPolicy::new(&config.retry),
                config.server.replay_buffer_limit,
            ),
            health: Arc::clone(&health),
            realtime: realtime.clone(),
            context: Arc::clone(&context),
        });

        Ok(Self {
            config,
            context,
            routes,
            limiter,
            health,
            realtime,
            state,
        })
    }

    /// The assembled axum router
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state), &self.config.cors)
    }

    /// Process-wide state
    #[must_use]
    pub fn context(&self) -> &Arc<GatewayContext> {
        &self.context
    }

    /// Health aggregator
    #[must_use]
    pub fn health(&self) -> &Arc<HealthAggregator> {
        &self.health
    }

    /// Realtime bridge, when enabled
    #[must_use]
    pub fn realtime(&self) -> Option<&Arc<RealtimeBridge>> {
        self.realtime.as_ref()
    }

    /// Start background tasks: health probing and counter sweeping
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let shutdown = self.context.shutdown_token().clone();
        let mut tasks = vec![Arc::clone(&self.limiter).spawn_sweeper(
            self.config.rate_limit.sweep_interval,
            shutdown.clone(),
        )];
        if self.config.health.enabled {
            tasks.push(Arc::clone(&self.health).spawn(self.config.health.interval, shutdown));
        }
        tasks
    }

    /// Serve on an already-bound listener until shutdown
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        let tasks = self.spawn_background();
        let app = self.router();

        info!("Edge Gateway v{}", env!("CARGO_PKG_VERSION"));
        info!("  Listening: http://{addr}");
        info!("  Instance: {}", self.context.instance_id());
        info!("  Routes: {}", self.routes.len());
        info!(
            "  Rate limit: {} req / {}s per client",
            self.config.rate_limit.max_requests,
            self.config.rate_limit.window.as_secs()
        );
        info!(
            "  Realtime: {}",
            if self.realtime.is_some() { "enabled" } else { "disabled" }
        );

        let shutdown = self.context.shutdown_token().clone();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        });

        let grace = self.config.server.shutdown_timeout;
        let outcome = tokio::select! {
            result = &mut server => Some(result),
            () = self.context.shutdown_token().cancelled() => None,
        };

        let outcome = match outcome {
            Some(result) => Some(result),
            None => {
                if let Some(realtime) = &self.realtime {
                    realtime.shutdown().await;
                }
                info!(grace_secs = grace.as_secs(), "Draining in-flight requests");
                match tokio::time::timeout(grace, &mut server).await {
                    Ok(result) => Some(result),
                    Err(_) => {
                        warn!("Shutdown grace period elapsed; aborting remaining connections");
                        server.abort();
                        None
                    }
                }
            }
        };

        for task in tasks {
            task.abort();
        }

        match outcome {
            Some(Ok(Ok(()))) | None => {
                info!("Gateway stopped");
                Ok(())
            }
            Some(Ok(Err(e))) => Err(Error::Io(e)),
            Some(Err(e)) => Err(Error::Internal(format!("server task failed: {e}"))),
        }
    }

    /// Bind the configured address and run until SIGINT/SIGTERM
    ///
    /// # Errors
    ///
    /// Returns an error if binding or serving fails.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );
        let listener = TcpListener::bind(addr).await?;

        let context = Arc::clone(&self.context);
        tokio::spawn(async move {
            shutdown_signal().await;
            context.shutdown();
        });

        self.serve(listener).await
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

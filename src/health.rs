//! Fleet health aggregation
//!
//! A background loop probes every route's target on an interval and swaps in
//! a complete snapshot once all probes of the cycle have settled. Readers only
//! ever see whole snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Serialize, Serializer};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::HealthConfig;
use crate::proxy::{Upstream, UpstreamRequest};
use crate::routing::RouteTable;

/// Probe outcome for one service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Answered with a success status in time
    Healthy,
    /// Non-success status, timeout or connection failure
    Unhealthy,
    /// No target configured; never probed
    Unavailable,
}

/// Latest known state of one service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHealth {
    /// Service name
    #[serde(skip)]
    pub name: String,
    /// Probe outcome
    pub status: ServiceStatus,
    /// Time to response head
    #[serde(
        rename = "responseTime",
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_millis"
    )]
    pub latency: Option<Duration>,
    /// When the probe finished
    #[serde(rename = "lastCheck", skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
    /// Failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[allow(clippy::ref_option)]
fn serialize_millis<S>(latency: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match latency {
        Some(d) => serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        None => serializer.serialize_none(),
    }
}

impl ServiceHealth {
    fn unavailable(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ServiceStatus::Unavailable,
            latency: None,
            last_check: Some(Utc::now()),
            error: Some("Service URL not configured".to_string()),
        }
    }

    /// Whether the service is healthy
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == ServiceStatus::Healthy
    }
}

/// Result of one complete probe cycle
#[derive(Debug, Clone, Default)]
pub struct HealthSnapshot {
    /// When the cycle finished; `None` before the first cycle
    pub completed_at: Option<DateTime<Utc>>,
    /// Per-service state
    pub services: BTreeMap<String, ServiceHealth>,
}

impl HealthSnapshot {
    /// Ready iff a cycle has completed and every service is healthy
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.completed_at.is_some() && self.services.values().all(ServiceHealth::is_healthy)
    }
}

/// Gateway self-report plus the latest snapshot
#[derive(Debug, Clone)]
pub struct GatewayHealth {
    /// Time since start
    pub uptime: Duration,
    /// Gateway version
    pub version: String,
    /// Latest completed snapshot
    pub snapshot: Arc<HealthSnapshot>,
}

impl GatewayHealth {
    /// See [`HealthSnapshot::is_ready`]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.snapshot.is_ready()
    }

    /// Payload served by the health endpoints
    #[must_use]
    pub fn report(&self) -> HealthReport<'_> {
        HealthReport {
            status: if self.is_ready() { "healthy" } else { "unhealthy" },
            timestamp: Utc::now(),
            gateway: GatewayReport {
                status: "healthy",
                uptime: self.uptime.as_secs_f64(),
                version: &self.version,
            },
            services: &self.snapshot.services,
        }
    }
}

/// Serialized health payload
#[derive(Debug, Serialize)]
pub struct HealthReport<'a> {
    /// `healthy` or `unhealthy`
    pub status: &'static str,
    /// When the report was rendered
    pub timestamp: DateTime<Utc>,
    /// Gateway self-status
    pub gateway: GatewayReport<'a>,
    /// Per-service state
    pub services: &'a BTreeMap<String, ServiceHealth>,
}

/// Gateway block of [`HealthReport`]
#[derive(Debug, Serialize)]
pub struct GatewayReport<'a> {
    /// Always `healthy` while the process serves
    pub status: &'static str,
    /// Seconds since start
    pub uptime: f64,
    /// Gateway version
    pub version: &'a str,
}

#[derive(Debug, Clone)]
struct HealthTarget {
    name: String,
    url: Option<Url>,
}

/// Periodic prober for every routed service
pub struct HealthAggregator {
    targets: Vec<HealthTarget>,
    upstream: Arc<dyn Upstream>,
    timeout: Duration,
    version: String,
    started: Instant,
    current: RwLock<Arc<HealthSnapshot>>,
}

impl HealthAggregator {
    /// One probe target per distinct route name, in route order
    #[must_use]
    pub fn new(routes: &RouteTable, upstream: Arc<dyn Upstream>, config: &HealthConfig, started: Instant) -> Self {
        let mut targets: Vec<HealthTarget> = Vec::with_capacity(routes.len());
        for route in routes.routes() {
            if targets.iter().any(|t| t.name == route.name()) {
                warn!(service = route.name(), "Duplicate service name; probing the first route only");
                continue;
            }
            targets.push(HealthTarget {
                name: route.name().to_string(),
                url: route.health_url(&config.path),
            });
        }

        Self {
            targets,
            upstream,
            timeout: config.timeout,
            version: config.version.clone(),
            started,
            current: RwLock::new(Arc::new(HealthSnapshot::default())),
        }
    }

    async fn probe(&self, target: &HealthTarget) -> ServiceHealth {
        let Some(url) = target.url.clone() else {
            return ServiceHealth::unavailable(&target.name);
        };

        let started = Instant::now();
        let request = UpstreamRequest::get(url, self.timeout);
        let outcome = tokio::time::timeout(self.timeout, self.upstream.send(request)).await;
        let latency = started.elapsed();

        let (status, latency, error) = match outcome {
            Ok(Ok(response)) if response.status().is_success() => (ServiceStatus::Healthy, Some(latency), None),
            Ok(Ok(response)) => (
                ServiceStatus::Unhealthy,
                Some(latency),
                Some(format!("HTTP {}", response.status().as_u16())),
            ),
            Ok(Err(e)) => (
                ServiceStatus::Unhealthy,
                None,
                Some(e.detail().unwrap_or_else(|| e.public_message()).to_string()),
            ),
            Err(_) => (
                ServiceStatus::Unhealthy,
                None,
                Some(format!("Timeout after {}ms", self.timeout.as_millis())),
            ),
        };

        if status != ServiceStatus::Healthy {
            debug!(service = %target.name, error = ?error, "Health probe failed");
        }

        ServiceHealth {
            name: target.name.clone(),
            status,
            latency,
            last_check: Some(Utc::now()),
            error,
        }
    }

    /// Probe every target concurrently and publish the new snapshot
    pub async fn run_cycle(&self) -> Arc<HealthSnapshot> {
        let results = join_all(self.targets.iter().map(|t| self.probe(t))).await;

        let services: BTreeMap<String, ServiceHealth> = results
            .into_iter()
            .map(|health| {
                telemetry_metrics::gauge!("gateway_service_healthy", "service" => health.name.clone())
                    .set(if health.is_healthy() { 1.0 } else { 0.0 });
                (health.name.clone(), health)
            })
            .collect();

        let snapshot = Arc::new(HealthSnapshot {
            completed_at: Some(Utc::now()),
            services,
        });
        *self.current.write() = Arc::clone(&snapshot);

        debug!(
            services = snapshot.services.len(),
            ready = snapshot.is_ready(),
            "Health cycle complete"
        );
        snapshot
    }

    /// Latest completed snapshot
    #[must_use]
    pub fn latest(&self) -> Arc<HealthSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Gateway self-report combined with the latest snapshot
    #[must_use]
    pub fn snapshot(&self) -> GatewayHealth {
        GatewayHealth {
            uptime: self.started.elapsed(),
            version: self.version.clone(),
            snapshot: self.latest(),
        }
    }

    /// Run cycles every `interval` until `shutdown` fires. The first cycle
    /// starts immediately.
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                services = self.targets.len(),
                interval_secs = interval.as_secs(),
                "Health aggregator started"
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = self.run_cycle().await;
                        if !snapshot.is_ready() {
                            let failing: Vec<&str> = snapshot
                                .services
                                .values()
                                .filter(|s| !s.is_healthy())
                                .map(|s| s.name.as_str())
                                .collect();
                            warn!(failing = ?failing, "Gateway not ready");
                        }
                    }
                    () = shutdown.cancelled() => break,
                }
            }
            debug!("Health aggregator stopped");
        })
    }
}

impl std::fmt::Debug for HealthAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthAggregator")
            .field("targets", &self.targets)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_not_ready_before_first_cycle() {
        assert!(!HealthSnapshot::default().is_ready());
    }

    #[test]
    fn test_ready_requires_all_healthy() {
        let healthy = ServiceHealth {
            name: "users".to_string(),
            status: ServiceStatus::Healthy,
            latency: Some(Duration::from_millis(3)),
            last_check: Some(Utc::now()),
            error: None,
        };
        let mut snapshot = HealthSnapshot {
            completed_at: Some(Utc::now()),
            services: BTreeMap::from([("users".to_string(), healthy)]),
        };
        assert!(snapshot.is_ready());

        snapshot
            .services
            .insert("auth".to_string(), ServiceHealth::unavailable("auth"));
        assert!(!snapshot.is_ready());
    }

    #[test]
    fn test_service_health_serialization() {
        let health = ServiceHealth {
            name: "users".to_string(),
            status: ServiceStatus::Unhealthy,
            latency: Some(Duration::from_millis(12)),
            last_check: None,
            error: Some("HTTP 500".to_string()),
        };
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "unhealthy", "responseTime": 12, "error": "HTTP 500"})
        );
    }
}

//! Process-wide gateway state

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

#[cfg(feature = "metrics")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Start instant, instance identity, shutdown token and metrics handle.
///
/// Built once by the composition root and shared by reference.
#[derive(Debug)]
pub struct GatewayContext {
    started: Instant,
    instance_id: String,
    shutdown: CancellationToken,
    closed: AtomicBool,
    #[cfg(feature = "metrics")]
    metrics: Option<PrometheusHandle>,
}

impl GatewayContext {
    /// Capture the start instant and install the metrics recorder (once per
    /// process; later contexts reuse the same handle)
    #[must_use]
    pub fn init() -> Self {
        Self {
            started: Instant::now(),
            instance_id: Uuid::new_v4().to_string(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            #[cfg(feature = "metrics")]
            metrics: prometheus_handle(),
        }
    }

    /// When the gateway started
    #[must_use]
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Time since start
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Random per-process id
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Token cancelled on shutdown
    #[must_use]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Whether shutdown has begun
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Begin shutdown. Returns `true` only for the first call.
    pub fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!(instance = %self.instance_id, "Shutdown initiated");
        self.shutdown.cancel();
        true
    }

    /// Prometheus text exposition, if the recorder is installed
    #[must_use]
    pub fn render_metrics(&self) -> Option<String> {
        #[cfg(feature = "metrics")]
        {
            self.metrics.as_ref().map(PrometheusHandle::render)
        }
        #[cfg(not(feature = "metrics"))]
        {
            None
        }
    }
}

#[cfg(feature = "metrics")]
fn prometheus_handle() -> Option<PrometheusHandle> {
    use std::sync::OnceLock;

    static HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();
    HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "Metrics recorder not installed");
                None
            }
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_is_idempotent() {
        let ctx = GatewayContext::init();
        assert!(!ctx.is_shutting_down());
        assert!(ctx.shutdown());
        assert!(!ctx.shutdown());
        assert!(ctx.shutdown_token().is_cancelled());
        assert!(ctx.is_shutting_down());
    }

    #[test]
    fn test_instance_ids_differ() {
        assert_ne!(GatewayContext::init().instance_id(), GatewayContext::init().instance_id());
    }
}

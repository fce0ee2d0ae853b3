//! Retry logic with exponential backoff

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::time::sleep;
use tracing::debug;

use crate::GatewayError;
use crate::config::RetryConfig;

/// Backoff shape shared by all routes; the attempt budget is per route
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    pub max_backoff: Duration,
    /// Growth factor per attempt
    pub multiplier: f32,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            multiplier: config.multiplier,
        }
    }

    /// Policy with no delay between attempts
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delays for up to `max_retries` retries
    #[must_use]
    pub fn backoff(&self, max_retries: u32) -> impl Iterator<Item = Duration> {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(self.multiplier)
            .with_max_times(max_retries as usize)
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

/// Execute a future with retry logic. Total attempts are `1 + max_retries`.
///
/// # Errors
///
/// Returns the last error from `f` if all attempts are exhausted or the error
/// is not retryable.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    max_retries: u32,
    name: &str,
    mut f: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut backoff = policy.backoff(max_retries);
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !e.is_retryable() {
                    return Err(e);
                }

                let Some(delay) = backoff.next() else {
                    debug!(operation = name, attempts, "Max retry attempts reached");
                    return Err(e);
                };

                debug!(
                    operation = name,
                    attempt = attempts,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "Retrying after backoff"
                );
                telemetry_metrics::counter!("gateway_upstream_retries_total", "route" => name.to_string())
                    .increment(1);
                sleep(delay).await;
            }
        }
    }
}

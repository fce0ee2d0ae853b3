//! Rate limiting implementation
//!
//! [`RateLimiter`] is the per-client fixed-window counter applied to every
//! gated request. [`MessageQuota`] is a smoothed per-connection quota for
//! inbound WebSocket frames.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::{
    Quota, RateLimiter as GovernorLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RateLimitConfig;

/// Counter state for one client key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    /// When the current window opened
    pub window_start: Instant,
    /// Requests admitted in the current window
    pub count: u32,
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Admitted; `remaining` more requests fit in this window
    Allowed {
        /// Requests left in the window
        remaining: u32,
    },
    /// Limit reached; the window reopens after `retry_after`
    Throttled {
        /// Time until the window resets
        retry_after: Duration,
    },
}

impl RateDecision {
    /// Whether the request was admitted
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Fixed-window request limiter keyed by client
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    limit: u32,
    window: Duration,
    evict_after: Duration,
    windows: DashMap<String, RateWindow>,
}

impl RateLimiter {
    /// Create a new rate limiter
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            limit: config.max_requests,
            window: config.window,
            evict_after: config.evict_after(),
            windows: DashMap::new(),
        }
    }

    /// Whether throttling is active
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Requests admitted per window
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Admit or throttle a request for `key` now
    pub fn admit(&self, key: &str) -> RateDecision {
        self.admit_at(key, Instant::now())
    }

    /// Admit or throttle a request for `key` at `now`.
    ///
    /// The entry is locked for the whole read-modify-write, so concurrent
    /// callers for the same key never admit more than `limit` per window.
    pub fn admit_at(&self, key: &str, now: Instant) -> RateDecision {
        if !self.enabled {
            return RateDecision::Allowed {
                remaining: self.limit,
            };
        }

        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| RateWindow {
                window_start: now,
                count: 0,
            });
        let window = entry.value_mut();

        if now.saturating_duration_since(window.window_start) >= self.window {
            window.window_start = now;
            window.count = 0;
        }

        if window.count < self.limit {
            window.count += 1;
            RateDecision::Allowed {
                remaining: self.limit - window.count,
            }
        } else {
            let retry_after = (window.window_start + self.window).saturating_duration_since(now);
            debug!(client = %key, retry_after_ms = retry_after.as_millis(), "Rate limit exceeded");
            RateDecision::Throttled { retry_after }
        }
    }

    /// Drop counters whose window opened more than `evict_after` ago.
    /// Returns the number of evicted keys.
    pub fn evict_stale(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.window_start) < self.evict_after);
        before.saturating_sub(self.windows.len())
    }

    /// Number of keys currently tracked
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Periodically evict stale counters until `shutdown` fires
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = self.evict_stale(Instant::now());
                        if evicted > 0 {
                            debug!(evicted, remaining = self.tracked_keys(), "Swept rate-limit counters");
                        }
                    }
                    () = shutdown.cancelled() => break,
                }
            }
        })
    }
}

/// Per-connection quota for inbound realtime frames
pub struct MessageQuota {
    inner: GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl MessageQuota {
    /// Allow `per_second` frames per second, bursting up to the same amount
    #[must_use]
    pub fn per_second(per_second: u32) -> Self {
        let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            inner: GovernorLimiter::direct(Quota::per_second(rate)),
        }
    }

    /// Try to take one permit
    pub fn try_acquire(&self) -> bool {
        self.inner.check().is_ok()
    }
}

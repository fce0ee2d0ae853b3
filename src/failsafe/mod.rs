//! Failsafe mechanisms: rate limiting and retry

mod rate_limiter;
mod retry;

pub use rate_limiter::{MessageQuota, RateDecision, RateLimiter, RateWindow};
pub use retry::{RetryPolicy, with_retry};

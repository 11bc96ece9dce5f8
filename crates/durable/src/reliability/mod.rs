//! Reliability patterns for outbound calls
//!
//! This module provides:
//! - [`SlidingWindowRateLimiter`] - distributed per-API rate limit
//! - [`RetryPolicy`] - attempt limit and delays for callback runs
//! - [`RetryingHttpExecutor`] - fixed-delay retry for throttled providers

mod http;
mod rate_limiter;
mod retry;

pub(crate) use http::client_with_timeout;
pub use http::{HttpRetryConfig, ProviderBody, ProviderRequest, RetryingHttpExecutor};
pub use rate_limiter::{RateLimitPolicy, SlidingWindowRateLimiter, RATE_LIMIT_KEY_PREFIX};
pub use retry::{RetryPolicy, MAX_ATTEMPTS};

//! Distributed sliding-window rate limiter
//!
//! Each external API gets a sorted set in the coordination store whose
//! members are request timestamps (epoch milliseconds). A request is
//! admitted when fewer than `capacity` timestamps fall inside the trailing
//! window. Pruning, counting and adding happen in one atomic store call, so
//! concurrent workers cannot both see the last free slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::coordination::{CoordinationStore, StoreError, WindowDecision};

/// Key prefix for rate limit windows
pub const RATE_LIMIT_KEY_PREFIX: &str = "rateLimit:";

/// Capacity and window for one external API
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Requests allowed per window
    pub capacity: u32,

    /// Length of the trailing window
    #[serde(with = "crate::duration_millis")]
    pub window: Duration,
}

impl Default for RateLimitPolicy {
    /// One request every two seconds
    fn default() -> Self {
        Self {
            capacity: 1,
            window: Duration::from_millis(2000),
        }
    }
}

impl RateLimitPolicy {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
        }
    }

    /// Same policy with a capacity of at least one
    ///
    /// A zero capacity (from a struct literal or deserialized config) would
    /// reject every request forever.
    fn admitting(self) -> Self {
        Self::new(self.capacity, self.window)
    }
}

/// Rate limiter shared by every worker connected to the same store
///
/// # Example
///
/// ```ignore
/// use jobguard_durable::reliability::{RateLimitPolicy, SlidingWindowRateLimiter};
///
/// let limiter = SlidingWindowRateLimiter::new(store)
///     .with_policy("TS_API", RateLimitPolicy::new(5, Duration::from_secs(1)));
///
/// limiter.acquire("TS_API").await?; // waits for a free slot, then holds it
/// call_partner().await;
/// ```
#[derive(Clone)]
pub struct SlidingWindowRateLimiter {
    store: Arc<dyn CoordinationStore>,
    default_policy: RateLimitPolicy,
    policies: HashMap<String, RateLimitPolicy>,
}

impl SlidingWindowRateLimiter {
    /// Create a limiter applying [`RateLimitPolicy::default`] to every API
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            default_policy: RateLimitPolicy::default(),
            policies: HashMap::new(),
        }
    }

    /// Policy for APIs without an explicit override
    pub fn with_default_policy(mut self, policy: RateLimitPolicy) -> Self {
        self.default_policy = policy.admitting();
        self
    }

    /// Override the policy for one API
    pub fn with_policy(mut self, api_name: impl Into<String>, policy: RateLimitPolicy) -> Self {
        self.policies.insert(api_name.into(), policy.admitting());
        self
    }

    /// Policy in effect for an API; capacity is never below one
    pub fn policy_for(&self, api_name: &str) -> RateLimitPolicy {
        self.policies
            .get(api_name)
            .copied()
            .unwrap_or(self.default_policy)
            .admitting()
    }

    fn key(api_name: &str) -> String {
        format!("{RATE_LIMIT_KEY_PREFIX}{api_name}")
    }

    fn member(now_ms: i64) -> String {
        format!("{now_ms}-{}", Uuid::now_v7())
    }

    /// Wait until the API has capacity, then reserve a slot
    ///
    /// The calling task sleeps until the oldest entry leaves the window;
    /// there is no fairness between concurrent waiters.
    #[instrument(skip(self))]
    pub async fn acquire(&self, api_name: &str) -> Result<(), StoreError> {
        let policy = self.policy_for(api_name);
        let key = Self::key(api_name);
        let window_ms = policy.window.as_millis() as i64;

        loop {
            let now = now_ms();
            let decision = self
                .store
                .window_admit(&key, &Self::member(now), now, policy.window, policy.capacity)
                .await?;

            match decision {
                WindowDecision::Admitted => return Ok(()),
                WindowDecision::Rejected { oldest_ms } => {
                    let wait = oldest_ms + window_ms - now;
                    debug!(api = %api_name, wait_ms = wait, "rate limit reached, waiting");
                    if wait > 0 {
                        tokio::time::sleep(Duration::from_millis(wait as u64)).await;
                    }
                }
            }
        }
    }

    /// Reserve a slot if one is free right now
    pub async fn try_acquire(&self, api_name: &str) -> Result<bool, StoreError> {
        let policy = self.policy_for(api_name);
        let now = now_ms();
        let decision = self
            .store
            .window_admit(
                &Self::key(api_name),
                &Self::member(now),
                now,
                policy.window,
                policy.capacity,
            )
            .await?;
        Ok(decision == WindowDecision::Admitted)
    }

    /// Count a request that was made without going through [`acquire`]
    ///
    /// [`acquire`]: Self::acquire
    pub async fn record(&self, api_name: &str) -> Result<(), StoreError> {
        let now = now_ms();
        self.store
            .sorted_add(&Self::key(api_name), &Self::member(now), now)
            .await
    }

    /// Requests currently inside the window (prunes expired entries)
    pub async fn in_window(&self, api_name: &str) -> Result<u64, StoreError> {
        let policy = self.policy_for(api_name);
        let key = Self::key(api_name);
        let cutoff = now_ms() - policy.window.as_millis() as i64;
        self.store.sorted_remove_up_to(&key, cutoff).await?;
        self.store.sorted_count(&key).await
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

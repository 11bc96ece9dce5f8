//! Worker configuration from environment variables

use std::collections::BTreeMap;
use std::time::Duration;

use jobguard_durable::callback::ApiName;
use jobguard_durable::job::DEFAULT_LOCK_TTL;
use jobguard_durable::reliability::RateLimitPolicy;
use uuid::Uuid;

/// Header carrying the partner API key unless overridden
pub const DEFAULT_API_KEY_HEADER: &str = "x-api-key";

/// Where callbacks for one external API are delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackEndpoint {
    pub url: String,
    /// `(header, value)` sent with every call
    pub api_key: Option<(String, String)>,
}

/// Worker process configuration
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Worker identifier, used in logs
    pub worker_id: String,

    /// Coordination store; in-memory (single process only) when unset
    pub redis_url: Option<String>,

    /// Callback store; in-memory when unset
    pub database_url: Option<String>,

    /// Apply bundled migrations on startup
    pub run_migrations: bool,

    /// Lock TTL for every job
    pub job_lock_ttl: Duration,

    /// Period of the pending callback sweep
    pub sweep_interval: Duration,

    /// Rate limit applied to every external API
    pub rate_limit: RateLimitPolicy,

    /// Operator webhook for job failure alerts; alerts are only logged when unset
    pub alert_webhook_url: Option<String>,

    /// Force-release job locks before starting the timers
    pub clear_locks_on_startup: bool,

    /// Handler endpoints per external API
    pub callback_endpoints: BTreeMap<ApiName, CallbackEndpoint>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            redis_url: None,
            database_url: None,
            run_migrations: false,
            job_lock_ttl: DEFAULT_LOCK_TTL,
            sweep_interval: Duration::from_secs(60),
            rate_limit: RateLimitPolicy::default(),
            alert_webhook_url: None,
            clear_locks_on_startup: false,
            callback_endpoints: BTreeMap::new(),
        }
    }
}

impl WorkerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `WORKER_ID`: Worker identifier (default: `worker-<uuid>`)
    /// - `REDIS_URL`: Coordination store
    /// - `DATABASE_URL`: PostgreSQL callback store
    /// - `RUN_MIGRATIONS`: `true` to migrate on startup
    /// - `JOB_LOCK_TTL_MS`: Job lock TTL (default: 40000)
    /// - `SWEEP_INTERVAL_MS`: Pending callback sweep period (default: 60000)
    /// - `RATE_LIMIT_WINDOW_MS` / `RATE_LIMIT_CAPACITY`: Per-API limit (default: 1 per 2000 ms)
    /// - `ALERT_WEBHOOK_URL`: Operator alert webhook
    /// - `JOBGUARD_CLEAR_LOCKS_ON_STARTUP`: `true` to clear stale job locks
    /// - `CALLBACK_ENDPOINT_<API>`: Handler URL, e.g. `CALLBACK_ENDPOINT_TS_API`
    /// - `CALLBACK_API_KEY_<API>` / `CALLBACK_API_KEY_HEADER_<API>`: Optional API key
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str| parse::<u64>(&lookup, key).map(Duration::from_millis);

        let rate_limit = RateLimitPolicy::new(
            parse(&lookup, "RATE_LIMIT_CAPACITY").unwrap_or(defaults.rate_limit.capacity),
            millis("RATE_LIMIT_WINDOW_MS").unwrap_or(defaults.rate_limit.window),
        );

        let callback_endpoints = ApiName::ALL
            .iter()
            .filter_map(|api| {
                let url = non_empty(lookup(&format!("CALLBACK_ENDPOINT_{api}")))?;
                let api_key = non_empty(lookup(&format!("CALLBACK_API_KEY_{api}"))).map(|key| {
                    let header = non_empty(lookup(&format!("CALLBACK_API_KEY_HEADER_{api}")))
                        .unwrap_or_else(|| DEFAULT_API_KEY_HEADER.to_string());
                    (header, key)
                });
                Some((*api, CallbackEndpoint { url, api_key }))
            })
            .collect();

        Self {
            worker_id: non_empty(lookup("WORKER_ID")).unwrap_or(defaults.worker_id),
            redis_url: non_empty(lookup("REDIS_URL")),
            database_url: non_empty(lookup("DATABASE_URL")),
            run_migrations: flag(&lookup, "RUN_MIGRATIONS"),
            job_lock_ttl: millis("JOB_LOCK_TTL_MS").unwrap_or(defaults.job_lock_ttl),
            sweep_interval: millis("SWEEP_INTERVAL_MS").unwrap_or(defaults.sweep_interval),
            rate_limit,
            alert_webhook_url: non_empty(lookup("ALERT_WEBHOOK_URL")),
            clear_locks_on_startup: flag(&lookup, "JOBGUARD_CLEAR_LOCKS_ON_STARTUP"),
            callback_endpoints,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    lookup(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::from_lookup(lookup(&[]));

        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.redis_url, None);
        assert_eq!(config.job_lock_ttl, Duration::from_secs(40));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.rate_limit, RateLimitPolicy::default());
        assert!(!config.clear_locks_on_startup);
        assert!(!config.run_migrations);
        assert!(config.callback_endpoints.is_empty());
    }

    #[test]
    fn test_overrides() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("WORKER_ID", "w-1"),
            ("REDIS_URL", "redis://cache:6379"),
            ("DATABASE_URL", "postgres://db/jobs"),
            ("RUN_MIGRATIONS", "true"),
            ("JOB_LOCK_TTL_MS", "15000"),
            ("SWEEP_INTERVAL_MS", "5000"),
            ("RATE_LIMIT_CAPACITY", "5"),
            ("RATE_LIMIT_WINDOW_MS", "1000"),
            ("ALERT_WEBHOOK_URL", "https://alerts.example.test/hook"),
            ("JOBGUARD_CLEAR_LOCKS_ON_STARTUP", "TRUE"),
        ]));

        assert_eq!(config.worker_id, "w-1");
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert!(config.run_migrations);
        assert_eq!(config.job_lock_ttl, Duration::from_secs(15));
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(
            config.rate_limit,
            RateLimitPolicy::new(5, Duration::from_secs(1))
        );
        assert!(config.clear_locks_on_startup);
    }

    #[test]
    fn test_invalid_numbers_fall_back() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("JOB_LOCK_TTL_MS", "soon"),
            ("RATE_LIMIT_CAPACITY", "-3"),
        ]));

        assert_eq!(config.job_lock_ttl, DEFAULT_LOCK_TTL);
        assert_eq!(config.rate_limit.capacity, 1);
    }

    #[test]
    fn test_callback_endpoints() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("CALLBACK_ENDPOINT_TONFEST", "https://tonfest.example.test/hooks"),
            ("CALLBACK_API_KEY_TONFEST", "secret"),
            ("CALLBACK_ENDPOINT_TS_API", "https://ts.example.test/cb"),
            ("CALLBACK_API_KEY_TS_API", "k2"),
            ("CALLBACK_API_KEY_HEADER_TS_API", "authorization"),
            ("CALLBACK_ENDPOINT_PRIDIPIE_API", ""),
        ]));

        assert_eq!(config.callback_endpoints.len(), 2);
        assert_eq!(
            config.callback_endpoints[&ApiName::Tonfest],
            CallbackEndpoint {
                url: "https://tonfest.example.test/hooks".to_string(),
                api_key: Some(("x-api-key".to_string(), "secret".to_string())),
            }
        );
        assert_eq!(
            config.callback_endpoints[&ApiName::TsApi].api_key,
            Some(("authorization".to_string(), "k2".to_string()))
        );
    }
}

//! Integration tests for RedisCoordinationStore
//!
//! Run with: cargo test -p jobguard-durable --test redis_integration_test -- --ignored
//!
//! Requirements:
//! - Redis running with REDIS_URL set or redis://localhost:6379

use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use jobguard_durable::coordination::{CoordinationStore, RedisCoordinationStore, WindowDecision};
use jobguard_durable::lock::DistributedMutex;
use jobguard_durable::reliability::{RateLimitPolicy, SlidingWindowRateLimiter};

fn get_redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

/// Store with a per-test key prefix so runs never collide
async fn create_test_store() -> Arc<RedisCoordinationStore> {
    let store = RedisCoordinationStore::connect(&get_redis_url())
        .await
        .expect("Failed to connect to Redis. Set REDIS_URL or ensure redis is running.")
        .with_key_prefix(format!("jobguard-test:{}:", Uuid::now_v7()));
    Arc::new(store)
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_set_if_absent_and_conditional_ops() {
    let store = create_test_store().await;
    let ttl = Duration::from_secs(5);

    assert!(store.set_if_absent("k", "a", ttl).await.unwrap());
    assert!(!store.set_if_absent("k", "b", ttl).await.unwrap());
    assert_eq!(store.get("k").await.unwrap(), Some("a".to_string()));

    assert!(!store.expire_if_value("k", "b", ttl).await.unwrap());
    assert!(store.expire_if_value("k", "a", ttl).await.unwrap());

    assert!(!store.delete_if_value("k", "b").await.unwrap());
    assert!(store.delete_if_value("k", "a").await.unwrap());
    assert_eq!(store.get("k").await.unwrap(), None);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_key_expires() {
    let store = create_test_store().await;

    assert!(store
        .set_if_absent("short", "v", Duration::from_millis(100))
        .await
        .unwrap());
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(store.set_if_absent("short", "w", Duration::from_secs(5)).await.unwrap());
    store.delete("short").await.unwrap();
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_window_admit() {
    let store = create_test_store().await;
    let window = Duration::from_secs(10);

    assert_eq!(
        store.window_admit("w", "1", 1_000, window, 2).await.unwrap(),
        WindowDecision::Admitted
    );
    assert_eq!(
        store.window_admit("w", "2", 2_000, window, 2).await.unwrap(),
        WindowDecision::Admitted
    );
    assert_eq!(
        store.window_admit("w", "3", 3_000, window, 2).await.unwrap(),
        WindowDecision::Rejected { oldest_ms: 1_000 }
    );
    assert_eq!(store.sorted_count("w").await.unwrap(), 2);

    // Once the first entry leaves the window there is room again
    assert_eq!(
        store.window_admit("w", "4", 11_500, window, 2).await.unwrap(),
        WindowDecision::Admitted
    );
    assert_eq!(
        store.sorted_oldest("w").await.unwrap(),
        Some(("2".to_string(), 2_000))
    );
    store.delete("w").await.unwrap();
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_mutex_across_handles() {
    let store = create_test_store().await;
    let a = DistributedMutex::new(store.clone());
    let b = DistributedMutex::new(store.clone());
    let ttl = Duration::from_secs(5);

    let lease = a.acquire("createRewards", ttl).await.unwrap().unwrap();
    assert!(b.acquire("createRewards", ttl).await.unwrap().is_none());
    assert!(a.renew(&lease, ttl).await.unwrap());
    assert!(a.release(&lease).await.unwrap());
    assert!(b.acquire("createRewards", ttl).await.unwrap().is_some());
    b.force_release("createRewards").await.unwrap();
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_rate_limiter_spacing() {
    let store = create_test_store().await;
    let limiter = SlidingWindowRateLimiter::new(store)
        .with_default_policy(RateLimitPolicy::new(1, Duration::from_millis(300)));
    let started = Instant::now();

    limiter.acquire("TS_API").await.unwrap();
    limiter.acquire("TS_API").await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(295));
}

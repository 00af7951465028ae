//! Runs against a live Redis when `REDIS_URL` is set; otherwise each test is a no-op.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use turnstile::ratelimit::{RateLimiter, Rule, RuleSet};
use turnstile::reload::ConfigStore;
use turnstile::store::{CounterStore, RedisStore};

fn redis_url() -> Option<String> {
    env::var("REDIS_URL").ok()
}

fn unique_namespace() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("turnstile_test_{}_{nanos}", std::process::id())
}

async fn ttl(url: &str, key: &str) -> i64 {
    let client = redis::Client::open(url).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    redis::cmd("TTL").arg(key).query_async(&mut conn).await.unwrap()
}

#[tokio::test]
async fn test_increment_with_expiry_sets_ttl_once() {
    let Some(url) = redis_url() else {
        return;
    };
    let store = RedisStore::connect(&url).await.unwrap();
    store.ping().await.unwrap();
    let key = format!("{}:counter", unique_namespace());

    assert_eq!(store.increment_with_expiry(&key, Duration::from_secs(30)).await.unwrap(), 1);
    let first_ttl = ttl(&url, &key).await;
    assert!(first_ttl > 0 && first_ttl <= 30, "unexpected ttl {first_ttl}");

    assert_eq!(store.increment_with_expiry(&key, Duration::from_secs(300)).await.unwrap(), 2);
    assert!(ttl(&url, &key).await <= 30);
}

#[tokio::test]
async fn test_plain_commands() {
    let Some(url) = redis_url() else {
        return;
    };
    let store = RedisStore::connect(&url).await.unwrap();
    let key = format!("{}:plain", unique_namespace());

    assert_eq!(store.increment(&key).await.unwrap(), 1);
    assert_eq!(store.increment(&key).await.unwrap(), 2);
    assert_eq!(ttl(&url, &key).await, -1);

    store.set_expiry(&key, Duration::from_secs(5)).await.unwrap();
    let remaining = ttl(&url, &key).await;
    assert!(remaining > 0 && remaining <= 5, "unexpected ttl {remaining}");
}

#[tokio::test]
async fn test_limiter_over_redis() {
    let Some(url) = redis_url() else {
        return;
    };
    let store = Arc::new(RedisStore::connect(&url).await.unwrap());
    let rules = RuleSet::new(vec![Rule::ip("1.2.3.4", 2, 60).unwrap()]);
    let config = Arc::new(ConfigStore::new("rules.yaml", rules));
    let limiter = RateLimiter::new(config, store).with_namespace(unique_namespace());

    assert!(limiter.is_allowed("1.2.3.4", "/items").await);
    assert!(limiter.is_allowed("1.2.3.4", "/items").await);
    assert!(!limiter.is_allowed("1.2.3.4", "/items").await);
    assert!(limiter.is_allowed("9.9.9.9", "/items").await);
}

#[tokio::test]
async fn test_unreachable_redis_fails_open() {
    // Nothing listens on the discard port.
    let store = match RedisStore::connect("redis://127.0.0.1:9/").await {
        Ok(store) => Arc::new(store),
        // Connection managers may fail eagerly; that is the startup error path.
        Err(_) => return,
    };
    let rules = RuleSet::new(vec![Rule::ip("1.2.3.4", 1, 60).unwrap()]);
    let config = Arc::new(ConfigStore::new("rules.yaml", rules));
    let limiter = RateLimiter::new(config, store).with_store_timeout(Duration::from_millis(200));

    assert!(limiter.is_allowed("1.2.3.4", "/").await);
    assert!(limiter.is_allowed("1.2.3.4", "/").await);
}

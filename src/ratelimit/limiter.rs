//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

use super::rules::Rule;
use crate::reload::ConfigStore;
use crate::store::{CounterStore, StoreError};

/// Default bound on a single counting store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// The outcome of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No matching rule was over its limit.
    Admitted,
    /// `rule` counted `count` hits in its current window, more than it allows.
    Denied { rule: Rule, key: String, count: u64 },
    /// The counting store failed while checking `key`; the request is let through.
    FailedOpen { key: String, error: String },
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Decision::Denied { .. })
    }
}

/// Fixed-window rate limiter over a shared counting store.
///
/// Each request is checked against the rules published in a `ConfigStore`,
/// in order. Every matching rule counts the request against its own key; the
/// first rule whose count goes over its limit denies the request and stops
/// evaluation. Store failures and timeouts admit the request.
pub struct RateLimiter<S: CounterStore> {
    rules: Arc<ConfigStore>,
    store: Arc<S>,
    store_timeout: Duration,
    namespace: Option<String>,
}

impl<S: CounterStore> Clone for RateLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            rules: self.rules.clone(),
            store: self.store.clone(),
            store_timeout: self.store_timeout,
            namespace: self.namespace.clone(),
        }
    }
}

impl<S: CounterStore> RateLimiter<S> {
    /// Create a new rate limiter with the default store timeout and no key namespace.
    pub fn new(rules: Arc<ConfigStore>, store: Arc<S>) -> Self {
        Self {
            rules,
            store,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            namespace: None,
        }
    }

    /// Bound every store call by `timeout`. A call that runs over counts as a store failure.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Prefix every counter key with `namespace:`.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.rules
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Whether a request from `client` for `path` may be forwarded.
    pub async fn is_allowed(&self, client: &str, path: &str) -> bool {
        self.check(client, path).await.is_admitted()
    }

    /// Evaluate a request and report why it was admitted or denied.
    ///
    /// The rule snapshot is taken once up front, so a reload that lands while
    /// this runs does not affect it.
    #[instrument(level = "debug", skip(self))]
    pub async fn check(&self, client: &str, path: &str) -> Decision {
        let rules = self.rules.current();

        for rule in rules.iter() {
            if !rule.matches(client, path) {
                trace!(rule = %rule, "Rule does not apply");
                continue;
            }

            let key = self.counter_key(rule);
            let count = match self.hit(&key, rule.window()).await {
                Ok(count) => count,
                Err(e) => {
                    warn!(
                        key = %key,
                        error = %e,
                        "Counting store failed, admitting request"
                    );
                    return Decision::FailedOpen {
                        key,
                        error: e.to_string(),
                    };
                }
            };

            trace!(key = %key, count, limit = rule.limit(), "Counted request");

            if count > rule.limit() {
                warn!(
                    key = %key,
                    count,
                    limit = rule.limit(),
                    "Rate limit exceeded"
                );
                return Decision::Denied {
                    rule: rule.clone(),
                    key,
                    count,
                };
            }
        }

        debug!(rules = rules.len(), "Request admitted");
        Decision::Admitted
    }

    fn counter_key(&self, rule: &Rule) -> String {
        match &self.namespace {
            Some(namespace) => format!("{}:{}", namespace, rule.key()),
            None => rule.key(),
        }
    }

    async fn hit(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        tokio::time::timeout(
            self.store_timeout,
            self.store.increment_with_expiry(key, window),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.store_timeout))?
    }
}

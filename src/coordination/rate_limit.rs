//! Fixed-window request limiting on the coordination store.
//!
//! Each check increments a per-key counter that expires at the end of its
//! window.  All nodes sharing the store share the budget.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::store::CoordinationStore;
use crate::config::RateLimitConfig;
use crate::error::StoreError;
use crate::metrics::MetricsRegistry;

/// Result of one [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The call fits in the current window.
    Allowed { remaining: u64 },
    /// The window's budget is spent; try again after `retry_after`.
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CoordinationStore>,
    key_prefix: String,
    limit: u64,
    window: Duration,
    metrics: MetricsRegistry,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        config: &RateLimitConfig,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            store,
            key_prefix: config.key_prefix.clone(),
            limit: config.limit,
            window: config.window(),
            metrics,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count one call against `key`.  Store failures propagate; whether to
    /// let the call through is the caller's decision.
    pub async fn check(&self, key: &str) -> Result<RateDecision, StoreError> {
        let store_key = format!("{}{key}", self.key_prefix);
        let count = self.store.incr_window(&store_key, self.window).await?;

        if count <= self.limit {
            self.metrics.metrics.rate_limit_allowed.inc();
            return Ok(RateDecision::Allowed {
                remaining: self.limit - count,
            });
        }

        self.metrics.metrics.rate_limit_limited.inc();
        let retry_after = self
            .store
            .ttl_remaining(&store_key)
            .await?
            .unwrap_or(self.window);
        debug!(%key, count, limit = self.limit, ?retry_after, "rate limited");
        Ok(RateDecision::Limited { retry_after })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::memory::MemoryStore;

    fn limiter(limit: u64, window_ms: u64) -> RateLimiter {
        let config = RateLimitConfig {
            key_prefix: "test:rate:".into(),
            limit,
            window_ms,
        };
        RateLimiter::new(Arc::new(MemoryStore::new()), &config, MetricsRegistry::new())
    }

    #[tokio::test(start_paused = true)]
    async fn allows_up_to_limit_then_limits() {
        let limiter = limiter(3, 1_000);
        assert_eq!(
            limiter.check("api").await.unwrap(),
            RateDecision::Allowed { remaining: 2 }
        );
        assert!(limiter.check("api").await.unwrap().is_allowed());
        assert_eq!(
            limiter.check("api").await.unwrap(),
            RateDecision::Allowed { remaining: 0 }
        );

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(
            limiter.check("api").await.unwrap(),
            RateDecision::Limited {
                retry_after: Duration::from_millis(600)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets() {
        let limiter = limiter(1, 500);
        assert!(limiter.check("api").await.unwrap().is_allowed());
        assert!(!limiter.check("api").await.unwrap().is_allowed());
        tokio::time::advance(Duration::from_millis(501)).await;
        assert!(limiter.check("api").await.unwrap().is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_have_separate_budgets() {
        let limiter = limiter(1, 1_000);
        assert!(limiter.check("a").await.unwrap().is_allowed());
        assert!(limiter.check("b").await.unwrap().is_allowed());
        assert!(!limiter.check("a").await.unwrap().is_allowed());
    }
}

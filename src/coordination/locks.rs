//! Distributed mutual-exclusion locks on a [`CoordinationStore`].
//!
//! A grant is a store key holding a fresh [`LockToken`] with a TTL.  Acquire
//! is a single `SET NX` with expiry, release a single server-side
//! compare-and-delete, so exclusion rests entirely on the store's atomicity.
//! Nothing about lock state is cached here.
//!
//! Locks are never renewed.  If the TTL runs out before `release`, the
//! holder silently loses the grant and a later `release` reports
//! [`ReleaseError::NotHeld`].  Pick TTLs well above the expected critical
//! section, keeping in mind that expiry is judged by the store's clock.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::backoff::BackoffPolicy;
use super::node::LockToken;
use super::store::{ttl_millis, CoordinationStore};
use crate::config::LockConfig;
use crate::error::{
    BlockingAcquireError, InvalidRequest, NotAcquired, ReleaseError, StoreError, Timeout,
};
use crate::metrics::MetricsRegistry;

/// Lower bound on the sleep between blocking acquire attempts.
const MIN_POLL_DELAY: Duration = Duration::from_millis(1);

/// Deadline used when `started + max_wait` does not fit in an `Instant`.
const MAX_WAIT_CAP: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Marker returned by a successful [`LockService::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released;

/// Defaults applied by the convenience entry points.
#[derive(Debug, Clone)]
pub struct LockSettings {
    pub key_prefix: String,
    pub default_ttl: Duration,
    pub max_wait: Duration,
    pub backoff: BackoffPolicy,
    /// Prefix of every generated token, for diagnostics only.
    pub node_id: String,
}

impl LockSettings {
    pub fn from_config(config: &LockConfig, node_id: impl Into<String>) -> Self {
        Self {
            key_prefix: config.key_prefix.clone(),
            default_ttl: config.default_ttl(),
            max_wait: config.max_wait(),
            backoff: config.backoff.clone(),
            node_id: node_id.into(),
        }
    }
}

/// Acquire / release front end over an injected store client.
///
/// Cheap to clone; clones share the same store and metrics.
#[derive(Clone)]
pub struct LockService {
    store: Arc<dyn CoordinationStore>,
    settings: Arc<LockSettings>,
    metrics: MetricsRegistry,
}

impl LockService {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        settings: LockSettings,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            store,
            settings: Arc::new(settings),
            metrics,
        }
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}{key}", self.settings.key_prefix)
    }

    /// Try once to take the lock on `key` for `ttl`.
    ///
    /// Contention is reported as [`NotAcquired::Contended`].  If the store
    /// cannot confirm the write the grant is treated as not acquired and the
    /// store error is returned in [`NotAcquired::Unconfirmed`].
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockToken, NotAcquired> {
        validate(key, ttl)?;
        let store_key = self.store_key(key);
        let token = LockToken::generate(&self.settings.node_id);
        let metrics = &self.metrics.metrics;

        match self
            .store
            .set_if_absent_with_ttl(&store_key, token.as_str(), ttl)
            .await
        {
            Ok(true) => {
                metrics.lock_acquisitions.inc();
                debug!(%key, ttl_ms = ttl_millis(ttl), "lock acquired");
                Ok(token)
            }
            Ok(false) => {
                metrics.lock_contended.inc();
                debug!(%key, "lock held by another owner");
                Err(NotAcquired::Contended {
                    key: key.to_string(),
                })
            }
            Err(e) => {
                metrics.lock_unconfirmed.inc();
                warn!(%key, error = %e, "lock acquire unconfirmed; treating as not acquired");
                Err(NotAcquired::Unconfirmed {
                    key: key.to_string(),
                    source: e,
                })
            }
        }
    }

    /// [`acquire`](Self::acquire) with the configured default TTL.
    pub async fn acquire_default(&self, key: &str) -> Result<LockToken, NotAcquired> {
        self.acquire(key, self.settings.default_ttl).await
    }

    /// Give back the grant identified by `token`.
    ///
    /// Only deletes the key if `token` is still its current value.
    /// [`ReleaseError::NotHeld`] means the grant was already gone;
    /// [`ReleaseError::Communication`] means the outcome is unknown.
    pub async fn release(&self, key: &str, token: &LockToken) -> Result<Released, ReleaseError> {
        let store_key = self.store_key(key);
        let metrics = &self.metrics.metrics;

        match self
            .store
            .compare_and_delete(&store_key, token.as_str())
            .await
        {
            Ok(true) => {
                metrics.lock_releases.inc();
                debug!(%key, "lock released");
                Ok(Released)
            }
            Ok(false) => {
                metrics.lock_release_not_held.inc();
                debug!(%key, "lock release: key missing or owned by another token");
                Err(ReleaseError::NotHeld {
                    key: key.to_string(),
                })
            }
            Err(e) => {
                metrics.lock_release_errors.inc();
                warn!(%key, error = %e, "lock release unconfirmed");
                Err(ReleaseError::Communication {
                    key: key.to_string(),
                    source: e,
                })
            }
        }
    }

    /// Poll [`acquire`](Self::acquire) until it succeeds or `max_wait`
    /// elapses, sleeping per `backoff` between attempts.
    ///
    /// The last sleep is clipped to the remaining budget and one final
    /// attempt is made at the deadline.  Waiters are not queued: whichever
    /// attempt the store accepts first wins.  Giving up (or dropping the
    /// future) writes nothing to the store.
    pub async fn try_acquire_blocking(
        &self,
        key: &str,
        ttl: Duration,
        max_wait: Duration,
        backoff: &BackoffPolicy,
    ) -> Result<LockToken, BlockingAcquireError> {
        validate(key, ttl)?;
        let metrics = &self.metrics.metrics;
        metrics.lock_waits.inc();

        let started = Instant::now();
        let deadline = started
            .checked_add(max_wait)
            .unwrap_or_else(|| started + MAX_WAIT_CAP);
        let mut attempts: u32 = 0;
        let mut last_error: Option<StoreError> = None;

        loop {
            attempts = attempts.saturating_add(1);
            match self.acquire(key, ttl).await {
                Ok(token) => {
                    let waited = started.elapsed();
                    metrics
                        .lock_wait_duration_seconds
                        .observe(waited.as_secs_f64());
                    debug!(%key, attempts, ?waited, "lock acquired after waiting");
                    return Ok(token);
                }
                Err(NotAcquired::Contended { .. }) => {}
                Err(NotAcquired::Unconfirmed { source, .. }) => last_error = Some(source),
                Err(NotAcquired::InvalidRequest(e)) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(poll_delay(backoff, attempts, deadline - now)).await;
        }

        let waited = started.elapsed();
        metrics.lock_timeouts.inc();
        metrics
            .lock_wait_duration_seconds
            .observe(waited.as_secs_f64());
        warn!(%key, attempts, ?waited, "timed out waiting for lock");
        Err(Timeout {
            key: key.to_string(),
            waited,
            attempts,
            last_error,
        }
        .into())
    }

    /// [`try_acquire_blocking`](Self::try_acquire_blocking) with the
    /// configured default TTL, wait budget and backoff.
    pub async fn try_acquire_blocking_default(
        &self,
        key: &str,
    ) -> Result<LockToken, BlockingAcquireError> {
        let settings = Arc::clone(&self.settings);
        self.try_acquire_blocking(key, settings.default_ttl, settings.max_wait, &settings.backoff)
            .await
    }

    /// Token currently stored for `key`, if any.  Diagnostic only: the
    /// answer may be stale by the time it is returned.
    pub async fn holder(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.store.get(&self.store_key(key)).await
    }

    /// Time left on the current grant for `key`, if any.
    pub async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.store.ttl_remaining(&self.store_key(key)).await
    }
}

/// Sleep after `attempts` failed tries (one-based), clipped to `remaining`.
fn poll_delay(backoff: &BackoffPolicy, attempts: u32, remaining: Duration) -> Duration {
    backoff
        .delay(attempts.saturating_sub(1))
        .max(MIN_POLL_DELAY)
        .min(remaining)
}

fn validate(key: &str, ttl: Duration) -> Result<(), InvalidRequest> {
    if key.is_empty() {
        return Err(InvalidRequest::EmptyKey);
    }
    if ttl_millis(ttl) == 0 {
        return Err(InvalidRequest::ZeroTtl(ttl));
    }
    // PX takes a signed 64-bit millisecond count.
    if ttl_millis(ttl) > i64::MAX as u64 {
        return Err(InvalidRequest::TtlTooLarge(ttl));
    }
    Ok(())
}

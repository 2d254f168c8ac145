use std::sync::Arc;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the lock service.
pub struct Metrics {
    // -- acquire --
    pub lock_acquisitions: Counter,
    pub lock_contended: Counter,
    pub lock_unconfirmed: Counter,

    // -- release --
    pub lock_releases: Counter,
    pub lock_release_not_held: Counter,
    pub lock_release_errors: Counter,

    // -- blocking acquire --
    pub lock_waits: Counter,
    pub lock_timeouts: Counter,
    pub lock_wait_duration_seconds: Histogram,

    // -- rate limiting --
    pub rate_limit_allowed: Counter,
    pub rate_limit_limited: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let lock_acquisitions = Counter::default();
        registry.register(
            "keylock_lock_acquisitions",
            "Distributed lock grants confirmed by the store",
            lock_acquisitions.clone(),
        );

        let lock_contended = Counter::default();
        registry.register(
            "keylock_lock_contended",
            "Acquire attempts rejected because the key was held",
            lock_contended.clone(),
        );

        let lock_unconfirmed = Counter::default();
        registry.register(
            "keylock_lock_unconfirmed",
            "Acquire attempts the store could not confirm",
            lock_unconfirmed.clone(),
        );

        let lock_releases = Counter::default();
        registry.register(
            "keylock_lock_releases",
            "Distributed lock releases",
            lock_releases.clone(),
        );

        let lock_release_not_held = Counter::default();
        registry.register(
            "keylock_lock_release_not_held",
            "Releases whose token was no longer current",
            lock_release_not_held.clone(),
        );

        let lock_release_errors = Counter::default();
        registry.register(
            "keylock_lock_release_errors",
            "Releases that failed to reach the store",
            lock_release_errors.clone(),
        );

        let lock_waits = Counter::default();
        registry.register(
            "keylock_lock_waits",
            "Blocking acquire calls",
            lock_waits.clone(),
        );

        let lock_timeouts = Counter::default();
        registry.register(
            "keylock_lock_timeouts",
            "Blocking acquire calls that exhausted their wait budget",
            lock_timeouts.clone(),
        );

        let lock_wait_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 16));
        registry.register(
            "keylock_lock_wait_duration_seconds",
            "Time spent in blocking acquire, in seconds",
            lock_wait_duration_seconds.clone(),
        );

        let rate_limit_allowed = Counter::default();
        registry.register(
            "keylock_rate_limit_allowed",
            "Rate limiter checks that were allowed",
            rate_limit_allowed.clone(),
        );

        let rate_limit_limited = Counter::default();
        registry.register(
            "keylock_rate_limit_limited",
            "Rate limiter checks that were over the limit",
            rate_limit_limited.clone(),
        );

        Self {
            lock_acquisitions,
            lock_contended,
            lock_unconfirmed,
            lock_releases,
            lock_release_not_held,
            lock_release_errors,
            lock_waits,
            lock_timeouts,
            lock_wait_duration_seconds,
            rate_limit_allowed,
            rate_limit_limited,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, handed to every service.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all lock metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

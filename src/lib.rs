//! Distributed mutual-exclusion locks on a shared KeyDB / Redis store.
//!
//! Build one store client at startup, inject it into a [`LockService`] and
//! share the service (it is cheap to clone):
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use keylock::{KeyDbStore, LockService, LockSettings, MetricsRegistry};
//!
//! let config = keylock::config::load_config("/etc/keylock/config.yaml")?;
//! let store = KeyDbStore::connect(&config.keydb).await?;
//! let settings = LockSettings::from_config(&config.lock, keylock::coordination::node::node_id());
//! let locks = LockService::new(Arc::new(store), settings, MetricsRegistry::new());
//!
//! if let Ok(token) = locks.acquire("invoice:42", Duration::from_secs(5)).await {
//!     // ... exclusive work ...
//!     locks.release("invoice:42", &token).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordination;
pub mod error;
pub mod metrics;

pub use coordination::backoff::BackoffPolicy;
pub use coordination::locks::{LockService, LockSettings, Released};
pub use coordination::memory::MemoryStore;
pub use coordination::node::LockToken;
pub use coordination::rate_limit::{RateDecision, RateLimiter};
pub use coordination::redis::KeyDbStore;
pub use coordination::store::CoordinationStore;
pub use error::{
    BlockingAcquireError, InvalidRequest, NotAcquired, ReleaseError, StoreError, Timeout,
};
pub use metrics::MetricsRegistry;

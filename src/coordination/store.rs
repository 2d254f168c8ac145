//! Coordination store abstraction.
//!
//! Every mutating operation here must be a single indivisible operation on
//! the store side.  Implementations never report success they have not seen
//! confirmed: any transport failure is a [`StoreError`].

use std::time::Duration;

use crate::error::StoreError;

/// Shared key-value store offering TTL-bearing conditional writes and an
/// atomic compare-and-delete.
#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create `key` holding `value` with the given TTL, only if `key` is
    /// absent.  Returns `true` if the key was created.
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Read the current value of `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Delete `key` only if its current value equals `expected`.  Returns
    /// `true` if the key was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Time left before `key` expires.  `None` if the key is absent or has
    /// no expiry.
    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Increment the counter at `key`, starting a new expiry `window` when
    /// the counter is created.  Returns the value after the increment.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, StoreError>;

    /// Round-trip to the store without touching any key.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Milliseconds for a store TTL argument.  Sub-millisecond remainders round
/// up so a non-zero duration never becomes a zero TTL.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    let millis = ttl.as_millis();
    let rounded = if ttl.subsec_nanos() % 1_000_000 != 0 {
        millis + 1
    } else {
        millis
    };
    u64::try_from(rounded).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_millis_whole() {
        assert_eq!(ttl_millis(Duration::from_secs(3)), 3000);
        assert_eq!(ttl_millis(Duration::from_millis(1)), 1);
    }

    #[test]
    fn ttl_millis_rounds_up_fraction() {
        assert_eq!(ttl_millis(Duration::from_micros(1500)), 2);
        assert_eq!(ttl_millis(Duration::from_nanos(1)), 1);
    }

    #[test]
    fn ttl_millis_zero_stays_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 0);
    }
}

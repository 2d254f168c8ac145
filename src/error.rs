//! Error and outcome types shared by the store clients and the lock service.
//!
//! Contention and "not held" are ordinary outcomes of a lock call, so they
//! live in the same enums as the store failures but are never logged above
//! `debug`.  A [`StoreError`] always means the store's answer is unknown.

use std::time::Duration;

/// Boxed transport error carried by [`StoreError::Communication`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure to get a confirmed answer from the coordination store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The command could not be delivered or the connection failed.
    #[error("store command {op} failed: {source}")]
    Communication {
        op: &'static str,
        #[source]
        source: BoxError,
    },

    /// No reply arrived within the configured command timeout.
    #[error("store command {op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// The store answered with something the client cannot interpret.
    #[error("store command {op} returned an unexpected reply: {detail}")]
    UnexpectedReply { op: &'static str, detail: String },
}

impl StoreError {
    pub fn communication(op: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Communication {
            op,
            source: source.into(),
        }
    }

    /// Name of the store command that failed.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Communication { op, .. }
            | Self::Timeout { op, .. }
            | Self::UnexpectedReply { op, .. } => op,
        }
    }
}

/// A lock request rejected before reaching the store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidRequest {
    #[error("lock key must not be empty")]
    EmptyKey,
    #[error("lock ttl must be at least one millisecond, got {0:?}")]
    ZeroTtl(Duration),
    #[error("lock ttl must be at most i64::MAX milliseconds, got {0:?}")]
    TtlTooLarge(Duration),
}

/// Why `acquire` did not return a token.
#[derive(Debug, thiserror::Error)]
pub enum NotAcquired {
    /// Another owner currently holds the key.
    #[error("lock {key} is held by another owner")]
    Contended { key: String },

    /// The store could not confirm the grant, so none is assumed.
    #[error("lock {key} could not be confirmed by the store: {source}")]
    Unconfirmed {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    InvalidRequest(#[from] InvalidRequest),
}

impl NotAcquired {
    pub fn is_contended(&self) -> bool {
        matches!(self, Self::Contended { .. })
    }
}

/// Why `release` did not delete the grant.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    /// The token is not the key's current value: the grant expired, was
    /// taken over, or was never held.
    #[error("lock {key} is not held by the presented token")]
    NotHeld { key: String },

    /// The store did not answer; the grant may or may not have been deleted.
    #[error("release of lock {key} is unconfirmed: {source}")]
    Communication {
        key: String,
        #[source]
        source: StoreError,
    },
}

impl ReleaseError {
    pub fn is_not_held(&self) -> bool {
        matches!(self, Self::NotHeld { .. })
    }
}

/// A blocking acquire that ran out of its wait budget.
#[derive(Debug, thiserror::Error)]
#[error("timed out after {waited:?} waiting for lock {key} ({attempts} attempts)")]
pub struct Timeout {
    pub key: String,
    pub waited: Duration,
    pub attempts: u32,
    /// Most recent store failure seen while polling, if any.
    #[source]
    pub last_error: Option<StoreError>,
}

/// Failure of `try_acquire_blocking`.
#[derive(Debug, thiserror::Error)]
pub enum BlockingAcquireError {
    #[error(transparent)]
    Timeout(#[from] Timeout),
    #[error(transparent)]
    InvalidRequest(#[from] InvalidRequest),
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn store_error_reports_op() {
        let err = StoreError::Timeout {
            op: "SET",
            after: Duration::from_millis(5),
        };
        assert_eq!(err.op(), "SET");
        assert!(err.to_string().contains("timed out"));

        let err = StoreError::communication("EVAL", "connection reset");
        assert_eq!(err.op(), "EVAL");
        assert!(err.source().is_some());
    }

    #[test]
    fn release_error_keeps_not_held_apart_from_communication() {
        let not_held = ReleaseError::NotHeld { key: "k".into() };
        assert!(not_held.is_not_held());
        assert!(not_held.source().is_none());

        let comm = ReleaseError::Communication {
            key: "k".into(),
            source: StoreError::communication("EVAL", "broken pipe"),
        };
        assert!(!comm.is_not_held());
        assert!(comm.source().is_some());
    }

    #[test]
    fn timeout_display_mentions_attempts() {
        let err = Timeout {
            key: "res1".into(),
            waited: Duration::from_millis(250),
            attempts: 4,
            last_error: None,
        };
        let text = err.to_string();
        assert!(text.contains("res1"));
        assert!(text.contains("4 attempts"));
    }
}

//! In-process [`CoordinationStore`].
//!
//! Gives the same atomicity as the KeyDB store within one process: every
//! mutation runs while holding the key's `DashMap` shard lock.  Expiry is
//! lazy and measured on the tokio clock, so paused-time tests can move past
//! a TTL without sleeping.  Dead records are swept every [`PURGE_EVERY`]
//! writes so keys that are never touched again do not pile up.
//!
//! TTLs are rounded up to whole milliseconds, matching what the KeyDB store
//! sends as `PX`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::trace;

use super::store::{ttl_millis, CoordinationStore};
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct Record {
    value: String,
    expires_at: Option<Instant>,
}

/// Writes between two sweeps of expired records.
pub const PURGE_EVERY: u64 = 256;

/// Deadline `ttl` after `now`.  `None` when it lies past what the clock can
/// represent, which is treated as never expiring.
fn expiry(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(Duration::from_millis(ttl_millis(ttl)))
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Key-value store kept in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<DashMap<String, Record>>,
    writes: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.records.iter().filter(|r| r.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired record.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.records.retain(|_, record| record.is_live(now));
    }

    /// Count one write and sweep when due.  Must not be called while holding
    /// an entry guard: `retain` locks every shard.
    fn note_write(&self) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.purge_expired();
        }
    }
}

#[async_trait::async_trait]
impl CoordinationStore for MemoryStore {
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let fresh = Record {
            value: value.to_string(),
            expires_at: expiry(now, ttl),
        };
        let created = match self.records.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                if slot.get().is_live(now) {
                    false
                } else {
                    slot.insert(fresh);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                true
            }
        };
        trace!(%key, created, "memory set-if-absent");
        self.note_write();
        Ok(created)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .records
            .get(key)
            .filter(|r| r.is_live(now))
            .map(|r| r.value.clone()))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let deleted = self
            .records
            .remove_if(key, |_, r| r.is_live(now) && r.value == expected)
            .is_some();
        trace!(%key, deleted, "memory compare-and-delete");
        Ok(deleted)
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = Instant::now();
        Ok(self
            .records
            .get(key)
            .filter(|r| r.is_live(now))
            .and_then(|r| r.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let now = Instant::now();
        let next = {
            let mut slot = self.records.entry(key.to_string()).or_insert_with(|| Record {
                value: "0".to_string(),
                expires_at: expiry(now, window),
            });
            if !slot.is_live(now) {
                *slot = Record {
                    value: "0".to_string(),
                    expires_at: expiry(now, window),
                };
            }
            let current: u64 = slot
                .value
                .parse()
                .map_err(|_| StoreError::UnexpectedReply {
                    op: "INCR",
                    detail: format!("value of {key} is not an integer"),
                })?;
            let next = current.saturating_add(1);
            slot.value = next.to_string();
            if slot.expires_at.is_none() {
                slot.expires_at = expiry(now, window);
            }
            next
        };
        self.note_write();
        Ok(next)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

//! Distributed coordination backed by KeyDB (Redis-compatible).
//!
//! Provides distributed locks and a fixed-window rate limiter on top of the
//! [`store::CoordinationStore`] seam.  The KeyDB client is the production
//! store; the in-memory store gives the same atomicity inside one process.

pub mod backoff;
pub mod locks;
pub mod memory;
pub mod node;
pub mod rate_limit;
pub mod redis;
pub mod store;

//! Lease store contract
//!
//! This module provides:
//! - `LeaseStore`, the contract any backing store must satisfy (two atomic
//!   record operations plus a publish/subscribe channel)
//! - typed outcomes for the two record operations, with mapping from the raw
//!   integer protocol spoken by script-based stores
//! - the canonical protocol scripts (`scripts`) and an in-process store
//!   (`MemoryLeaseStore`) for tests and single-process use

mod memory;
pub mod scripts;

pub use memory::MemoryLeaseStore;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{LockError, Result};

/// Saturating `start + wait`. `Duration::MAX` means no bound, so an
/// unrepresentable deadline lands decades out instead of panicking the
/// clock arithmetic.
pub(crate) fn deadline_after(start: Instant, wait: Duration) -> Instant {
    start
        .checked_add(wait)
        .unwrap_or_else(|| start + Duration::from_secs(86400 * 365 * 30))
}

/// Outcome of an atomic acquire attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireReply {
    /// Record created for this owner, or its hold count incremented.
    Acquired,
    /// Record held by another owner; its lease expires within `remaining`.
    Held { remaining: Duration },
}

impl AcquireReply {
    /// Map a raw acquire reply onto the typed outcome.
    ///
    /// `nil` or `0` signals success; a positive integer is the held record's
    /// remaining lease in milliseconds. Anything negative cannot be produced
    /// by a well-formed store and is a protocol violation.
    pub fn from_raw(reply: Option<i64>) -> Result<Self> {
        match reply {
            None | Some(0) => Ok(Self::Acquired),
            Some(ms) if ms > 0 => Ok(Self::Held {
                remaining: Duration::from_millis(ms as u64),
            }),
            Some(ms) => Err(LockError::Protocol(format!(
                "acquire returned negative remaining ttl {ms}"
            ))),
        }
    }
}

/// Outcome of an atomic release attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The owner held no entry under this key.
    Absent,
    /// Hold count decremented but still positive; the record remains.
    StillHeld,
    /// Hold count reached zero and the record was deleted.
    FullyReleased,
}

impl ReleaseOutcome {
    /// Map a raw release reply (`nil` = absent, `0` = still held, `1` =
    /// fully released) onto the typed outcome.
    pub fn from_raw(reply: Option<i64>) -> Result<Self> {
        match reply {
            None => Ok(Self::Absent),
            Some(0) => Ok(Self::StillHeld),
            Some(1) => Ok(Self::FullyReleased),
            Some(code) => Err(LockError::Protocol(format!(
                "release returned unexpected code {code}"
            ))),
        }
    }
}

/// Contract of the shared store backing the lock protocol.
///
/// Both record operations must execute as single atomic server-side steps;
/// the manager's mutual-exclusion guarantee rests on that, not on any client
/// coordination. Publication is driven by the manager after `try_release`
/// reports [`ReleaseOutcome::FullyReleased`], so a subscriber observing a
/// published key may assume the record is gone.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create the record with hold count 1 and the given lease, or increment
    /// the hold count when `owner` already holds it (without touching the
    /// lease). Reports the remaining lease when another owner holds the key.
    async fn try_acquire(&self, key: &str, owner: &str, lease: Duration) -> Result<AcquireReply>;

    /// Decrement `owner`'s hold count, deleting the record when it reaches
    /// zero.
    async fn try_release(&self, key: &str, owner: &str) -> Result<ReleaseOutcome>;

    /// Publish a release notification for `key`.
    async fn publish_release(&self, key: &str) -> Result<()>;

    /// Subscribe to release notifications for every key matching `pattern`
    /// (a literal prefix followed by `*`). The stream yields published keys;
    /// dropping the receiver tears the subscription down.
    async fn subscribe_releases(&self, pattern: &str) -> Result<mpsc::Receiver<String>>;
}

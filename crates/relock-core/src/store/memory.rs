//! In-process lease store
//!
//! Backed by a concurrent map of lease records and an in-process broadcast
//! channel standing in for the store's pub/sub fabric. Record leases expire
//! lazily, on the next access to the key. Intended for tests and for
//! single-process deployments that still want the lock API.

use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::warn;

use super::{AcquireReply, LeaseStore, ReleaseOutcome, deadline_after};
use crate::error::{LockError, Result};

/// One lock record: per-owner hold counts plus the lease deadline.
struct LeaseRecord {
    holds: HashMap<String, u32>,
    expires_at: Instant,
}

impl LeaseRecord {
    fn new(expires_at: Instant) -> Self {
        Self {
            holds: HashMap::new(),
            expires_at,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// In-process [`LeaseStore`] implementation.
///
/// All record mutation for a key happens under that key's map shard lock,
/// which gives the same atomicity the protocol expects from a server-side
/// script.
pub struct MemoryLeaseStore {
    records: DashMap<String, LeaseRecord>,
    releases: broadcast::Sender<String>,
}

impl MemoryLeaseStore {
    /// Capacity of the release fan-out and subscription delivery channels.
    const CHANNEL_CAPACITY: usize = 1024;

    pub fn new() -> Self {
        let (releases, _) = broadcast::channel(Self::CHANNEL_CAPACITY);
        Self {
            records: DashMap::new(),
            releases,
        }
    }

    /// Number of live (possibly lapsed but not yet reclaimed) records.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(&self, key: &str, owner: &str, lease: Duration) -> Result<AcquireReply> {
        let now = Instant::now();
        let expires_at = deadline_after(now, lease);
        let mut record = self
            .records
            .entry(key.to_owned())
            .or_insert_with(|| LeaseRecord::new(expires_at));

        // A lapsed record is gone as far as the protocol is concerned
        if record.is_expired(now) {
            record.holds.clear();
        }

        if record.holds.is_empty() {
            record.holds.insert(owner.to_owned(), 1);
            record.expires_at = expires_at;
            return Ok(AcquireReply::Acquired);
        }

        if let Some(count) = record.holds.get_mut(owner) {
            // Reentrant hold; the lease is deliberately not refreshed
            *count += 1;
            return Ok(AcquireReply::Acquired);
        }

        let remaining = record
            .expires_at
            .duration_since(now)
            .max(Duration::from_millis(1));
        Ok(AcquireReply::Held { remaining })
    }

    async fn try_release(&self, key: &str, owner: &str) -> Result<ReleaseOutcome> {
        let now = Instant::now();
        let Some(mut record) = self.records.get_mut(key) else {
            return Ok(ReleaseOutcome::Absent);
        };

        if record.is_expired(now) {
            drop(record);
            self.records
                .remove_if(key, |_, r| r.is_expired(Instant::now()));
            return Ok(ReleaseOutcome::Absent);
        }

        let Some(count) = record.holds.get_mut(owner) else {
            return Ok(ReleaseOutcome::Absent);
        };

        *count -= 1;
        if *count > 0 {
            return Ok(ReleaseOutcome::StillHeld);
        }

        record.holds.remove(owner);
        let empty = record.holds.is_empty();
        drop(record);
        if empty {
            // Re-checked under the shard lock so a racing acquire that just
            // took the key over is not swept away
            self.records.remove_if(key, |_, r| r.holds.is_empty());
        }
        Ok(ReleaseOutcome::FullyReleased)
    }

    async fn publish_release(&self, key: &str) -> Result<()> {
        // No subscribers is fine; notifications are a latency optimization
        let _ = self.releases.send(key.to_owned());
        Ok(())
    }

    async fn subscribe_releases(&self, pattern: &str) -> Result<mpsc::Receiver<String>> {
        let Some(prefix) = pattern.strip_suffix('*') else {
            return Err(LockError::Protocol(format!(
                "unsupported subscription pattern {pattern:?}, expected a trailing *"
            )));
        };

        let prefix = prefix.to_owned();
        let mut events = self.releases.subscribe();
        let (tx, rx) = mpsc::channel(Self::CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = events.recv() => match event {
                        Ok(key) => {
                            if key.starts_with(&prefix) && tx.send(key).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("release subscription lagged, dropped {missed} notifications");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_create_and_contend() {
        let store = MemoryLeaseStore::new();
        let lease = Duration::from_secs(30);

        let reply = store.try_acquire("LOCK:a", "owner-1", lease).await.unwrap();
        assert_eq!(reply, AcquireReply::Acquired);

        match store.try_acquire("LOCK:a", "owner-2", lease).await.unwrap() {
            AcquireReply::Held { remaining } => {
                assert!(remaining > Duration::ZERO);
                assert!(remaining <= lease);
            }
            other => panic!("expected Held, got {other:?}"),
        }

        let outcome = store.try_release("LOCK:a", "owner-1").await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::FullyReleased);

        let reply = store.try_acquire("LOCK:a", "owner-2", lease).await.unwrap();
        assert_eq!(reply, AcquireReply::Acquired);
    }

    #[tokio::test]
    async fn test_reentrant_acquire_and_release() {
        let store = MemoryLeaseStore::new();
        let lease = Duration::from_secs(30);

        for _ in 0..2 {
            let reply = store.try_acquire("LOCK:re", "owner-1", lease).await.unwrap();
            assert_eq!(reply, AcquireReply::Acquired);
        }
        assert_eq!(store.record_count(), 1);

        assert_eq!(
            store.try_release("LOCK:re", "owner-1").await.unwrap(),
            ReleaseOutcome::StillHeld
        );
        assert_eq!(
            store.try_release("LOCK:re", "owner-1").await.unwrap(),
            ReleaseOutcome::FullyReleased
        );
        // The record itself goes with the full release
        assert_eq!(store.record_count(), 0);
        assert_eq!(
            store.try_release("LOCK:re", "owner-1").await.unwrap(),
            ReleaseOutcome::Absent
        );
    }

    #[tokio::test]
    async fn test_unbounded_lease_does_not_overflow() {
        let store = MemoryLeaseStore::new();

        let reply = store
            .try_acquire("LOCK:max", "owner-1", Duration::MAX)
            .await
            .unwrap();
        assert_eq!(reply, AcquireReply::Acquired);

        match store
            .try_acquire("LOCK:max", "owner-2", Duration::from_secs(1))
            .await
            .unwrap()
        {
            AcquireReply::Held { remaining } => {
                assert!(remaining > Duration::from_secs(86400));
            }
            other => panic!("expected Held, got {other:?}"),
        }

        assert_eq!(
            store.try_release("LOCK:max", "owner-1").await.unwrap(),
            ReleaseOutcome::FullyReleased
        );
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_absent() {
        let store = MemoryLeaseStore::new();
        store
            .try_acquire("LOCK:x", "owner-1", Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(
            store.try_release("LOCK:x", "owner-2").await.unwrap(),
            ReleaseOutcome::Absent
        );
        // The actual holder is unaffected
        assert_eq!(
            store.try_release("LOCK:x", "owner-1").await.unwrap(),
            ReleaseOutcome::FullyReleased
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reentrant_acquire_keeps_original_lease() {
        let store = MemoryLeaseStore::new();

        store
            .try_acquire("LOCK:lease", "owner-1", Duration::from_millis(100))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(60)).await;
        // Reentry with a much longer lease must not extend the original one
        let reply = store
            .try_acquire("LOCK:lease", "owner-1", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(reply, AcquireReply::Acquired);

        tokio::time::advance(Duration::from_millis(50)).await;
        let reply = store
            .try_acquire("LOCK:lease", "owner-2", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, AcquireReply::Acquired);

        // The lapsed holder's release finds nothing of its own
        assert_eq!(
            store.try_release("LOCK:lease", "owner-1").await.unwrap(),
            ReleaseOutcome::Absent
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_record_can_be_reacquired() {
        let store = MemoryLeaseStore::new();

        store
            .try_acquire("LOCK:exp", "owner-1", Duration::from_millis(100))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;

        let reply = store
            .try_acquire("LOCK:exp", "owner-2", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(reply, AcquireReply::Acquired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_filters_by_pattern() {
        let store = MemoryLeaseStore::new();
        let mut rx = store.subscribe_releases("LOCK:*").await.unwrap();

        store.publish_release("OTHER:b").await.unwrap();
        store.publish_release("LOCK:a").await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), "LOCK:a");
        let next = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(next.is_err(), "non-matching key must be filtered out");
    }

    #[tokio::test]
    async fn test_subscribe_rejects_pattern_without_wildcard() {
        let store = MemoryLeaseStore::new();
        let err = store.subscribe_releases("LOCK:").await.unwrap_err();
        assert!(matches!(err, LockError::Protocol(_)));
    }
}

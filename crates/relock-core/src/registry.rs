//! Local wait registry
//!
//! This module provides:
//! - a process-local table mapping lock keys to broadcastable waiter entries
//! - `wait`/`begin_wait` for callers blocked on a contended key
//! - `signal` to wake every local waiter on a key at once
//! - `evict_idle` to bound the table when notifications never arrive
//!
//! All local waiters on one key share one entry, so a single release
//! notification fans out to every one of them; each then re-attempts the
//! store-level acquire independently, and the store lets only one win.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;
use tracing::debug;

use crate::metrics;

/// One waiter entry: the broadcast wake handle plus the idle timestamp.
struct WaitSlot {
    wake: broadcast::Sender<()>,
    last_used: Instant,
}

impl WaitSlot {
    fn new(now: Instant) -> Self {
        let (wake, _) = broadcast::channel(WaitRegistry::WAKE_CAPACITY);
        Self {
            wake,
            last_used: now,
        }
    }
}

/// A registered wait that has not been blocked on yet.
///
/// The receiver inside is subscribed at registration time, so a signal
/// arriving between [`WaitRegistry::begin_wait`] and [`PendingWait::wait`]
/// is buffered, not lost. Dropping a `PendingWait` without awaiting it just
/// releases the receiver; the shared entry stays until it is signaled or
/// evicted.
pub struct PendingWait {
    rx: broadcast::Receiver<()>,
    timeout: Duration,
}

impl PendingWait {
    /// Block until the entry is signaled or `timeout` elapses.
    ///
    /// Returns true when signaled; false on timeout, and also when the
    /// entry was evicted out from under the waiter.
    pub async fn wait(mut self) -> bool {
        match tokio::time::timeout(self.timeout, self.rx.recv()).await {
            Ok(Ok(())) => true,
            // Lagging behind still means a signal was sent
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => true,
            // The sender was dropped by eviction
            Ok(Err(broadcast::error::RecvError::Closed)) => false,
            Err(_) => false,
        }
    }
}

struct SweepState {
    last_sweep: Option<Instant>,
}

/// Process-local coalescing table for callers blocked on contended keys.
pub struct WaitRegistry {
    slots: DashMap<String, WaitSlot>,
    sweep: Mutex<SweepState>,
}

impl WaitRegistry {
    /// A waiter entry is signaled at most once before it is replaced, so a
    /// single buffered message per receiver suffices.
    const WAKE_CAPACITY: usize = 1;

    /// How long `evict_idle` waits for the sweep lock before skipping.
    const SWEEP_GRACE: Duration = Duration::from_secs(1);

    /// Minimum spacing between two completed sweeps.
    const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            sweep: Mutex::new(SweepState { last_sweep: None }),
        }
    }

    /// Register interest in `key` and return the pending wait.
    ///
    /// Entry creation and lookup are atomic per key: concurrent callers on
    /// the same key converge on one shared entry.
    pub fn begin_wait(&self, key: &str, timeout: Duration) -> PendingWait {
        let now = Instant::now();
        let rx = {
            let mut slot = self
                .slots
                .entry(key.to_owned())
                .or_insert_with(|| WaitSlot::new(now));
            slot.last_used = slot.last_used.max(now);
            slot.wake.subscribe()
        };
        metrics::record_waiter_entries(self.slots.len());
        PendingWait { rx, timeout }
    }

    /// Block on `key` until signaled or `timeout` elapses.
    pub async fn wait(&self, key: &str, timeout: Duration) -> bool {
        self.begin_wait(key, timeout).wait().await
    }

    /// Wake every local waiter on `key` and drop the entry.
    ///
    /// Idempotent: a duplicate or late signal for an absent key is a no-op.
    /// Returns the number of waiters woken.
    pub fn signal(&self, key: &str) -> usize {
        let Some((_, slot)) = self.slots.remove(key) else {
            return 0;
        };
        let woken = slot.wake.send(()).unwrap_or(0);
        metrics::record_waiter_entries(self.slots.len());
        woken
    }

    /// Remove every entry idle for at least `max_idle`, resolving any wait
    /// still blocked on it as timed out.
    ///
    /// Skipped entirely when the sweep lock cannot be taken within a short
    /// grace period or when the previous sweep finished less than
    /// [`Self::MIN_SWEEP_INTERVAL`] ago. Returns the number of evicted
    /// entries.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let Ok(mut state) = tokio::time::timeout(Self::SWEEP_GRACE, self.sweep.lock()).await
        else {
            // Another sweep is running long; skip, do not queue
            return 0;
        };

        let now = Instant::now();
        if let Some(last) = state.last_sweep
            && now.duration_since(last) < Self::MIN_SWEEP_INTERVAL
        {
            return 0;
        }

        let stale: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| now.duration_since(entry.last_used) >= max_idle)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for key in stale {
            // Re-checked under the shard lock; a freshly touched entry stays
            if self
                .slots
                .remove_if(&key, |_, slot| {
                    now.duration_since(slot.last_used) >= max_idle
                })
                .is_some()
            {
                evicted += 1;
            }
        }
        state.last_sweep = Some(now);

        if evicted > 0 {
            debug!("evicted {} idle waiter entries", evicted);
            metrics::record_evictions(evicted);
        }
        metrics::record_waiter_entries(self.slots.len());
        evicted
    }

    /// Number of live waiter entries.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for WaitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_resolves_true_on_signal() {
        let registry = Arc::new(WaitRegistry::new());

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait("LOCK:k", Duration::from_secs(5)).await })
        };
        // Let the waiter register before signaling
        while registry.is_empty() {
            tokio::task::yield_now().await;
        }

        assert_eq!(registry.signal("LOCK:k"), 1);
        assert!(waiter.await.unwrap());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let registry = WaitRegistry::new();
        let signaled = registry.wait("LOCK:k", Duration::from_millis(100)).await;
        assert!(!signaled);
        // The entry lingers until signal or eviction
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_signal_without_entry_is_noop() {
        let registry = WaitRegistry::new();
        assert_eq!(registry.signal("LOCK:missing"), 0);
        assert_eq!(registry.signal("LOCK:missing"), 0);
    }

    #[tokio::test]
    async fn test_signal_before_block_is_not_lost() {
        let registry = WaitRegistry::new();

        let pending = registry.begin_wait("LOCK:k", Duration::from_secs(5));
        assert_eq!(registry.signal("LOCK:k"), 1);

        // The signal was buffered at registration time
        assert!(pending.wait().await);
    }

    #[tokio::test]
    async fn test_waiters_on_same_key_coalesce() {
        let registry = WaitRegistry::new();

        let a = registry.begin_wait("LOCK:k", Duration::from_secs(5));
        let b = registry.begin_wait("LOCK:k", Duration::from_secs(5));
        let c = registry.begin_wait("LOCK:k", Duration::from_secs(5));
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.signal("LOCK:k"), 3);
        assert!(a.wait().await);
        assert!(b.wait().await);
        assert!(c.wait().await);
    }

    #[tokio::test]
    async fn test_abandoned_pending_wait_is_harmless() {
        let registry = WaitRegistry::new();

        let pending = registry.begin_wait("LOCK:k", Duration::from_secs(5));
        drop(pending);

        // Entry remains but has no receivers left to wake
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.signal("LOCK:k"), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_removes_stale_and_wakes_as_timed_out() {
        let registry = WaitRegistry::new();

        let stale = registry.begin_wait("LOCK:old", Duration::from_secs(600));
        tokio::time::advance(Duration::from_secs(61)).await;
        let fresh = registry.begin_wait("LOCK:new", Duration::from_secs(600));

        assert_eq!(registry.evict_idle(Duration::from_secs(60)).await, 1);
        assert_eq!(registry.len(), 1);

        // The evicted wait resolves immediately, as timed out
        assert!(!stale.wait().await);

        registry.signal("LOCK:new");
        assert!(fresh.wait().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_is_rate_limited() {
        let registry = WaitRegistry::new();

        registry.begin_wait("LOCK:a", Duration::from_secs(600));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(registry.evict_idle(Duration::from_secs(60)).await, 1);

        // Stale by a zero threshold, but the sweep just ran
        registry.begin_wait("LOCK:b", Duration::from_secs(600));
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(registry.evict_idle(Duration::ZERO).await, 0);
        assert_eq!(registry.len(), 1);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(registry.evict_idle(Duration::ZERO).await, 1);
        assert!(registry.is_empty());
    }
}

//! Shared test utilities for relock integration tests
//!
//! This crate provides shared test infrastructure including:
//! - manager constructors over one in-process store, where each manager
//!   stands in for a separate process against the shared endpoint
//! - ExclusionProbe: an instrumented critical section for verifying mutual
//!   exclusion under concurrency
//! - unique key generation to avoid conflicts between tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use relock_core::{LockManager, LockManagerConfig, MemoryLeaseStore};

/// Default lease for tests that do not probe expiry behavior.
pub const TEST_LEASE: Duration = Duration::from_secs(30);

/// Fresh in-process store standing in for the shared store endpoint.
pub fn shared_store() -> Arc<MemoryLeaseStore> {
    Arc::new(MemoryLeaseStore::new())
}

/// A manager on `store` with the background sweeper disabled, so tests
/// control eviction explicitly.
pub fn manager_on(store: &Arc<MemoryLeaseStore>) -> Arc<LockManager> {
    let config = LockManagerConfig {
        sweep_interval: None,
        ..LockManagerConfig::default()
    };
    Arc::new(LockManager::with_config(store.clone(), config))
}

/// A manager on `store` with its notification bridge running.
pub async fn started_manager_on(store: &Arc<MemoryLeaseStore>) -> Arc<LockManager> {
    let manager = manager_on(store);
    manager.start().await.expect("start lock manager");
    manager
}

/// Generate a unique lock key to avoid conflicts between tests.
pub fn unique_key(prefix: &str) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{}_{}", prefix, timestamp)
}

/// Instrumented critical section for mutual-exclusion checks.
///
/// Callers bracket the work done while holding a lock with
/// [`enter`](Self::enter)/[`exit`](Self::exit); the probe records the
/// highest number of simultaneous holders it ever observed. Mutual
/// exclusion holds iff that maximum never exceeds 1.
pub struct ExclusionProbe {
    current: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
}

impl ExclusionProbe {
    pub fn new() -> Self {
        Self {
            current: Arc::new(AtomicUsize::new(0)),
            max_seen: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Enter the guarded section.
    pub fn enter(&self) {
        let inside = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(inside, Ordering::SeqCst);
    }

    /// Leave the guarded section.
    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    /// Number of holders currently inside.
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous holders ever observed.
    pub fn max_seen(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }
}

impl Clone for ExclusionProbe {
    fn clone(&self) -> Self {
        Self {
            current: Arc::clone(&self.current),
            max_seen: Arc::clone(&self.max_seen),
        }
    }
}

impl Default for ExclusionProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusion_probe_tracks_maximum() {
        let probe = ExclusionProbe::new();
        assert_eq!(probe.max_seen(), 0);

        probe.enter();
        assert_eq!(probe.current(), 1);
        assert_eq!(probe.max_seen(), 1);

        let shared = probe.clone();
        shared.enter();
        assert_eq!(probe.current(), 2);
        assert_eq!(probe.max_seen(), 2);

        shared.exit();
        probe.exit();
        assert_eq!(probe.current(), 0);
        // The maximum is sticky
        assert_eq!(probe.max_seen(), 2);
    }

    #[test]
    fn test_unique_key_does_not_collide() {
        assert_ne!(unique_key("k"), unique_key("k"));
    }
}

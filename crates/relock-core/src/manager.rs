//! Lock manager
//!
//! This module provides:
//! - the acquire/release state machine driving the store's atomic operations
//! - the notification bridge (one wildcard subscription per manager feeding
//!   the local wait registry)
//! - the optional background eviction sweeper
//! - explicit-token and ambient-token API forms
//!
//! A manager works unstarted: acquires still succeed and contended waits
//! still resolve via their bounded timeouts. `start` only adds the
//! low-latency wake-up path and the sweeper.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval};
use tracing::{debug, info, trace, warn};

use crate::context::OwnerToken;
use crate::error::{LockError, Result};
use crate::metrics;
use crate::registry::WaitRegistry;
use crate::store::{AcquireReply, LeaseStore, ReleaseOutcome, deadline_after};

/// Configuration for a [`LockManager`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LockManagerConfig {
    /// Prefix prepended to every key at the API boundary; the wildcard
    /// subscription pattern is this prefix followed by `*`.
    pub key_prefix: String,
    /// Idle threshold after which a waiter entry may be evicted.
    pub entry_max_idle: Duration,
    /// Cadence of the background eviction sweeper; `None` disables it.
    pub sweep_interval: Option<Duration>,
    /// The sweeper only sweeps while the waiter table is larger than this.
    pub sweep_threshold: usize,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            key_prefix: "LOCK:".to_string(),
            entry_max_idle: Duration::from_secs(60),
            sweep_interval: Some(Duration::from_secs(1)),
            sweep_threshold: 5000,
        }
    }
}

/// Background tasks owned by a started manager.
struct RuntimeState {
    bridge: JoinHandle<()>,
    sweeper: Option<JoinHandle<()>>,
}

impl RuntimeState {
    fn shutdown(self) {
        self.bridge.abort();
        if let Some(sweeper) = self.sweeper {
            sweeper.abort();
        }
    }
}

/// Reentrant distributed lock manager over a [`LeaseStore`].
///
/// One instance per process and store is the expected shape; all state is
/// instance-scoped and torn down by [`LockManager::stop`] or drop.
pub struct LockManager {
    store: Arc<dyn LeaseStore>,
    registry: Arc<WaitRegistry>,
    config: LockManagerConfig,
    runtime: RwLock<Option<RuntimeState>>,
}

impl LockManager {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self::with_config(store, LockManagerConfig::default())
    }

    pub fn with_config(store: Arc<dyn LeaseStore>, config: LockManagerConfig) -> Self {
        Self {
            store,
            registry: Arc::new(WaitRegistry::new()),
            config,
            runtime: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    /// Number of keys with local waiter entries.
    pub fn waiter_count(&self) -> usize {
        self.registry.len()
    }

    pub async fn is_started(&self) -> bool {
        self.runtime.read().await.is_some()
    }

    /// Establish the namespace subscription and spawn the sweeper.
    ///
    /// The subscription must be up before contended acquires can rely on
    /// prompt wake-ups; until then they fall back to their bounded timeouts.
    pub async fn start(&self) -> Result<()> {
        if self.runtime.read().await.is_some() {
            return Err(LockError::AlreadyStarted);
        }

        let pattern = format!("{}*", self.config.key_prefix);
        let mut notifications = self.store.subscribe_releases(&pattern).await?;

        let registry = self.registry.clone();
        let bridge = tokio::spawn(async move {
            while let Some(key) = notifications.recv().await {
                let woken = registry.signal(&key);
                metrics::record_notification();
                debug!("release notification for {}, woke {} waiters", key, woken);
            }
            warn!("release notification stream ended");
        });

        let sweeper = self.config.sweep_interval.map(|period| {
            let registry = self.registry.clone();
            let max_idle = self.config.entry_max_idle;
            let threshold = self.config.sweep_threshold;
            // interval() panics on a zero period, which a deserialized
            // config can carry
            let period = period.max(Duration::from_millis(1));
            tokio::spawn(async move {
                let mut ticker = interval(period);
                loop {
                    ticker.tick().await;
                    if registry.len() > threshold {
                        registry.evict_idle(max_idle).await;
                    }
                }
            })
        });

        let mut runtime = self.runtime.write().await;
        if runtime.is_some() {
            // Lost a start race; tear down what was just spawned
            RuntimeState { bridge, sweeper }.shutdown();
            return Err(LockError::AlreadyStarted);
        }
        *runtime = Some(RuntimeState { bridge, sweeper });

        info!(
            "lock manager started, prefix={} sweep_interval={:?}",
            self.config.key_prefix, self.config.sweep_interval
        );
        Ok(())
    }

    /// Tear down the subscription and the sweeper. Idempotent.
    pub async fn stop(&self) {
        if let Some(runtime) = self.runtime.write().await.take() {
            runtime.shutdown();
            info!("lock manager stopped");
        }
    }

    /// Acquire `key` for `owner`, waiting up to `timeout`.
    ///
    /// Returns false only when the lock could not be acquired within
    /// `timeout`; plain contention never surfaces as an error. A zero
    /// `timeout` means one attempt without waiting, and `Duration::MAX`
    /// waits without bound. Reentrant: an owner already holding the key
    /// acquires again immediately, and the lease is not refreshed by
    /// reentry.
    ///
    /// Contended calls register with the wait registry and then retry the
    /// store once more before blocking, closing the window where a release
    /// notification fires between reading the remaining lease and
    /// registering interest. Each individual wait is bounded by both the
    /// caller's deadline and the holder's remaining lease.
    pub async fn acquire(
        &self,
        key: &str,
        owner: &OwnerToken,
        lease: Duration,
        timeout: Duration,
    ) -> Result<bool> {
        if lease.is_zero() {
            return Err(LockError::InvalidLease);
        }

        let key = self.full_key(key);
        let started = Instant::now();
        let deadline = deadline_after(started, timeout);
        let mut contended = false;

        loop {
            trace!("attempting acquire of {} for {}", key, owner);
            let remaining = match self.store.try_acquire(&key, owner.as_str(), lease).await? {
                AcquireReply::Acquired => {
                    metrics::record_acquire("acquired", contended.then(|| started.elapsed()));
                    return Ok(true);
                }
                AcquireReply::Held { remaining } => remaining,
            };

            let now = Instant::now();
            if now >= deadline {
                metrics::record_acquire("timeout", contended.then(|| started.elapsed()));
                return Ok(false);
            }

            // Never wait past the caller's deadline, nor past the point
            // where the holder's lease could still be alive
            let bounded = remaining.min(deadline.duration_since(now));
            debug!(
                "{} held for another {:?}, waiting up to {:?}",
                key, remaining, bounded
            );
            let pending = self.registry.begin_wait(&key, bounded);
            contended = true;

            // A release between the attempt above and the registration has
            // already been signaled and would never wake us; one more
            // attempt makes that window harmless
            if let AcquireReply::Acquired =
                self.store.try_acquire(&key, owner.as_str(), lease).await?
            {
                // `pending` is dropped unawaited here; the shared entry
                // self-clears on the next signal or eviction
                metrics::record_acquire("acquired", contended.then(|| started.elapsed()));
                return Ok(true);
            }

            pending.wait().await;
        }
    }

    /// Release one hold of `key` by `owner`.
    ///
    /// Returns true iff this call removed the record (hold count reached
    /// zero); a reentrant decrement and a release of a key the owner does
    /// not hold both return false. The release notification is published
    /// only after the store confirms the record is gone.
    pub async fn release(&self, key: &str, owner: &OwnerToken) -> Result<bool> {
        let key = self.full_key(key);
        match self.store.try_release(&key, owner.as_str()).await? {
            ReleaseOutcome::FullyReleased => {
                self.store.publish_release(&key).await?;
                metrics::record_release("fully_released");
                debug!("{} fully released", key);
                Ok(true)
            }
            ReleaseOutcome::StillHeld => {
                metrics::record_release("still_held");
                Ok(false)
            }
            ReleaseOutcome::Absent => {
                metrics::record_release("absent");
                Ok(false)
            }
        }
    }

    /// Acquire under the ambient owner of the current scope.
    ///
    /// Errors with [`LockError::NoAmbientOwner`] outside any
    /// [`OwnerToken::scope`]; minting a hidden token here would leave the
    /// paired release unmatchable.
    pub async fn acquire_ambient(
        &self,
        key: &str,
        lease: Duration,
        timeout: Duration,
    ) -> Result<bool> {
        let owner = OwnerToken::current().ok_or(LockError::NoAmbientOwner)?;
        self.acquire(key, &owner, lease, timeout).await
    }

    /// Release under the ambient owner of the current scope.
    pub async fn release_ambient(&self, key: &str) -> Result<bool> {
        let owner = OwnerToken::current().ok_or(LockError::NoAmbientOwner)?;
        self.release(key, &owner).await
    }

    /// Evict waiter entries idle for at least `max_idle`.
    ///
    /// Safe to call opportunistically; the started manager's sweeper calls
    /// it on a timer once the table outgrows the configured threshold.
    pub async fn evict(&self, max_idle: Duration) -> usize {
        self.registry.evict_idle(max_idle).await
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        if let Ok(mut runtime) = self.runtime.try_write()
            && let Some(state) = runtime.take()
        {
            state.shutdown();
        }
    }
}

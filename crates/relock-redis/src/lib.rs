//! relock-redis - Redis lease-store adapter
//!
//! This crate provides:
//! - `RedisLeaseStore`, a [`LeaseStore`] running the canonical protocol
//!   scripts on a Redis server over an auto-reconnecting multiplexed
//!   connection
//! - release pub/sub via `PSUBSCRIBE` on the lock namespace, pumped into
//!   the subscription stream the core consumes
//!
//! Scripts execute through `EVALSHA` with transparent loading, so no
//! explicit script upload step is needed. All transport failures surface as
//! [`LockError::Store`](relock_core::LockError::Store).

use std::time::Duration;

use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use relock_core::store::scripts;
use relock_core::{AcquireReply, LeaseStore, ReleaseOutcome, Result};

/// Lease in whole milliseconds as the acquire script expects it.
///
/// Clamped to at least 1ms: a sub-millisecond lease would otherwise round
/// to a `PEXPIRE` of 0, which deletes the key and would hand out an
/// acquisition nothing actually holds.
fn lease_millis(lease: Duration) -> i64 {
    i64::try_from(lease.as_millis()).unwrap_or(i64::MAX).max(1)
}

/// [`LeaseStore`] backed by a Redis server.
///
/// Cheap to clone; clones share the underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisLeaseStore {
    client: Client,
    conn: ConnectionManager,
    acquire: Script,
    release: Script,
}

impl RedisLeaseStore {
    /// Capacity of the subscription delivery channel.
    const SUBSCRIPTION_CAPACITY: usize = 1024;

    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(anyhow::Error::from)?;
        Self::with_client(client).await
    }

    /// Build the store over an existing client.
    pub async fn with_client(client: Client) -> Result<Self> {
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(anyhow::Error::from)?;
        Ok(Self {
            client,
            conn,
            acquire: Script::new(scripts::ACQUIRE),
            release: Script::new(scripts::RELEASE),
        })
    }
}

#[async_trait::async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn try_acquire(&self, key: &str, owner: &str, lease: Duration) -> Result<AcquireReply> {
        let mut conn = self.conn.clone();
        let reply: Option<i64> = self
            .acquire
            .key(key)
            .arg(lease_millis(lease))
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(anyhow::Error::from)?;
        AcquireReply::from_raw(reply)
    }

    async fn try_release(&self, key: &str, owner: &str) -> Result<ReleaseOutcome> {
        let mut conn = self.conn.clone();
        let reply: Option<i64> = self
            .release
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(anyhow::Error::from)?;
        ReleaseOutcome::from_raw(reply)
    }

    async fn publish_release(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(key)
            .arg("")
            .query_async(&mut conn)
            .await
            .map_err(anyhow::Error::from)?;
        trace!("published release for {}, {} subscribers", key, receivers);
        Ok(())
    }

    async fn subscribe_releases(&self, pattern: &str) -> Result<mpsc::Receiver<String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(anyhow::Error::from)?;
        pubsub.psubscribe(pattern).await.map_err(anyhow::Error::from)?;

        let (tx, rx) = mpsc::channel(Self::SUBSCRIPTION_CAPACITY);
        let pattern = pattern.to_owned();
        tokio::spawn(async move {
            {
                let mut stream = pubsub.on_message();
                loop {
                    tokio::select! {
                        _ = tx.closed() => break,
                        msg = stream.next() => {
                            let Some(msg) = msg else {
                                warn!("release subscription stream ended");
                                break;
                            };
                            let key = msg.get_channel_name().to_owned();
                            if tx.send(key).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            if let Err(e) = pubsub.punsubscribe(&pattern).await {
                debug!("punsubscribe on teardown failed: {}", e);
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_millis_clamps_low_and_high() {
        assert_eq!(lease_millis(Duration::from_nanos(100)), 1);
        assert_eq!(lease_millis(Duration::from_millis(1)), 1);
        assert_eq!(lease_millis(Duration::from_secs(30)), 30_000);
        assert_eq!(lease_millis(Duration::MAX), i64::MAX);
    }
}

//! relock-core - reentrant distributed locks over a shared KV/pub-sub store
//!
//! This crate provides:
//! - `LockManager`, the acquire/release state machine with lease-based
//!   auto-expiry and reentrancy per owner token
//! - a local wait registry that coalesces all waiters on a key into one
//!   notification-driven wake-up
//! - ambient ownership scopes so nested calls reenter as the same owner
//! - the `LeaseStore` contract, the canonical protocol scripts, and an
//!   in-process store for tests and single-process use
//!
//! Mutual exclusion rests entirely on the store's atomic operations; the
//! rest of the crate is about waking contended callers promptly and
//! bounding every wait by both the caller's deadline and the holder's
//! remaining lease.

pub mod context;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod store;

pub use context::OwnerToken;
pub use error::{LockError, Result};
pub use manager::{LockManager, LockManagerConfig};
pub use registry::{PendingWait, WaitRegistry};
pub use store::{AcquireReply, LeaseStore, MemoryLeaseStore, ReleaseOutcome};

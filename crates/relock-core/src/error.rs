//! Error types for lock operations

/// Error type for lock manager and lease store operations.
///
/// Contention and acquire timeouts are not errors; they surface as `false`
/// results from the acquire API. Everything here is either a usage error
/// caught before any store traffic, or an infrastructure failure that must
/// never be conflated with a lock outcome.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lease duration must be positive")]
    InvalidLease,

    #[error("no ambient owner scope; call inside OwnerToken::scope or pass a token explicitly")]
    NoAmbientOwner,

    #[error("lock manager already started")]
    AlreadyStarted,

    #[error("store protocol violation: {0}")]
    Protocol(String),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, LockError>;

//! Owner tokens and the ambient ownership scope
//!
//! This module provides:
//! - `OwnerToken`, the opaque identity a lock record is held under
//! - a task-local scope that pins one token to a logical call chain, so
//!   nested acquires without an explicit token reenter as the same owner

use std::fmt;
use std::future::Future;

tokio::task_local! {
    static AMBIENT_OWNER: OwnerToken;
}

/// Opaque identity of a lock holder.
///
/// Distinct from the process: one process may hold different keys under
/// different tokens, and reentrancy is granted per token, not per process.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OwnerToken(String);

impl OwnerToken {
    /// Generate a fresh random token (UUID v4, 32 hex chars).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Run `fut` with a freshly generated token as the ambient owner.
    ///
    /// Everything awaited inside `fut` observes the same token through
    /// [`OwnerToken::current`], including nested calls after suspension
    /// points. Tasks spawned from inside the scope do not inherit it; pass
    /// the token explicitly (or re-enter [`OwnerToken::scope_with`]) when a
    /// spawned task must act as the same owner.
    pub async fn scope<F>(fut: F) -> F::Output
    where
        F: Future,
    {
        Self::scope_with(Self::generate(), fut).await
    }

    /// Run `fut` with `token` as the ambient owner.
    pub async fn scope_with<F>(token: OwnerToken, fut: F) -> F::Output
    where
        F: Future,
    {
        AMBIENT_OWNER.scope(token, fut).await
    }

    /// The ambient owner of the current logical call chain, if any.
    pub fn current() -> Option<OwnerToken> {
        AMBIENT_OWNER.try_with(|token| token.clone()).ok()
    }
}

impl From<String> for OwnerToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for OwnerToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

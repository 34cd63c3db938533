use std::time::Duration;

use async_trait::async_trait;

use crate::error::LockError;

/// A lock service the runner can acquire named locks from.
///
/// Implementations are expected to be cheap to share across concurrent
/// invocations; the crate ships [`RedlockClient`](crate::RedlockClient) as
/// the Redis-backed implementation.
#[async_trait]
pub trait LockClient: Send + Sync {
    /// Acquire the lock named `key` with the given ttl.
    ///
    /// Fails with [`LockError`] when the lock cannot be obtained. A
    /// [`LockError::Unavailable`] with `attempts: Some(n)` means the client
    /// exhausted its retries; other variants are transport or protocol
    /// failures. The runner surfaces both unchanged.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Box<dyn LockHandle>, LockError>;
}

/// A single held lock.
///
/// Handles are opaque to the runner: it never compares them, only extends
/// and releases them. A handle is usable until released or until its ttl
/// lapses without a refresh.
#[async_trait]
pub trait LockHandle: Send + Sync {
    /// Reset the remaining ttl of the underlying key.
    ///
    /// May fail if the key already expired, was taken over, or the lock
    /// service is unreachable.
    async fn extend(&self, ttl: Duration) -> Result<(), LockError>;

    /// Best-effort release. Failure is not fatal to correctness, the lock
    /// will expire on its own.
    async fn release(&self) -> Result<(), LockError>;
}

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors reported by a lock client.
///
/// `Unavailable` carries the number of acquisition attempts when the client
/// gave up after exhausting its retries; it is `None` when the failure was
/// not retry-driven (e.g. a release that could not reach a quorum).
#[derive(Debug, Error)]
pub enum LockError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("lock unavailable, quorum not reached{}", attempts_suffix(.attempts))]
    Unavailable { attempts: Option<u32> },

    #[error("lock ttl elapsed before a quorum was reached")]
    TtlExceeded,

    #[error("lock ttl does not fit in milliseconds")]
    TtlTooLarge,
}

fn attempts_suffix(attempts: &Option<u32>) -> String {
    match attempts {
        Some(n) => format!(" after {n} attempts"),
        None => String::new(),
    }
}

/// The task was cancelled because lock extension failed, or because the
/// extension tick count reached its configured limit.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ExtendLockError {
    message: String,
    /// The configured extension tick limit in effect for the invocation.
    pub limit: u32,
    #[source]
    pub source: Option<LockError>,
}

impl ExtendLockError {
    pub(crate) fn cap_exceeded(limit: u32) -> Self {
        ExtendLockError {
            message: format!("lock extension count reached the limit of {limit}, task cancelled"),
            limit,
            source: None,
        }
    }

    pub(crate) fn extend_failed(source: LockError, limit: u32) -> Self {
        ExtendLockError {
            message: format!("lock extension failed, task cancelled: {source}"),
            limit,
            source: Some(source),
        }
    }
}

/// Releasing one of the held locks failed. The lock is not leaked: it will
/// lapse on its own once the last extended ttl runs out.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct UnlockError {
    message: String,
    #[source]
    pub cause: LockError,
}

impl UnlockError {
    pub(crate) fn new(cause: LockError) -> Self {
        UnlockError {
            message: "failed to release lock, it will expire once its ttl lapses".to_owned(),
            cause,
        }
    }
}

/// Terminal outcome of [`Runner::run`](crate::Runner::run).
///
/// When several failures are present at once, the most upstream cause wins:
/// a scheduler-driven cancellation shadows the task's own error, which in
/// turn shadows a release failure.
#[derive(Debug, Error)]
pub enum RunError<E> {
    #[error("lock ttl of {requested:?} is below the configured minimum of {minimum:?}")]
    TtlTooShort {
        requested: Duration,
        minimum: Duration,
    },

    #[error("lock key must be a non-empty string or a non-empty list of non-empty strings")]
    InvalidLockKey,

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Extend(#[from] ExtendLockError),

    #[error(transparent)]
    Unlock(#[from] UnlockError),

    #[error("task failed: {0}")]
    Task(E),
}

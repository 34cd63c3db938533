use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ExtendLockError, LockError, RunError, UnlockError};
use crate::lock::{LockClient, LockHandle};
use crate::scheduler::{CancelCause, ExtensionScheduler};

const DEFAULT_MIN_TTL: Duration = Duration::from_millis(100);
const DEFAULT_EXTEND_BUFFER: Duration = Duration::from_millis(50);
const DEFAULT_MAX_EXTEND_COUNT: u32 = 20;
const DEFAULT_LOCK_TTL: Duration = Duration::from_millis(1000);

/// The resource names to lock for one invocation.
///
/// Either a single key or an ordered list of keys; normalized to a list
/// before any lock service call. Empty lists and empty strings are rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockKey {
    Single(String),
    Many(Vec<String>),
}

impl LockKey {
    fn into_keys(self) -> Option<Vec<String>> {
        let keys = match self {
            LockKey::Single(key) => vec![key],
            LockKey::Many(keys) => keys,
        };
        if keys.is_empty() || keys.iter().any(String::is_empty) {
            return None;
        }
        Some(keys)
    }
}

impl From<&str> for LockKey {
    fn from(key: &str) -> Self {
        LockKey::Single(key.to_owned())
    }
}

impl From<String> for LockKey {
    fn from(key: String) -> Self {
        LockKey::Single(key)
    }
}

impl From<Vec<String>> for LockKey {
    fn from(keys: Vec<String>) -> Self {
        LockKey::Many(keys)
    }
}

impl From<Vec<&str>> for LockKey {
    fn from(keys: Vec<&str>) -> Self {
        LockKey::Many(keys.into_iter().map(str::to_owned).collect())
    }
}

impl<const N: usize> From<[&str; N]> for LockKey {
    fn from(keys: [&str; N]) -> Self {
        LockKey::Many(keys.iter().map(|key| (*key).to_owned()).collect())
    }
}

/// Per-invocation parameters of [`Runner::run`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub lock_key: LockKey,
    /// Requested ttl for every acquired lock. Defaults to one second.
    pub lock_ttl: Duration,
}

impl RunOptions {
    pub fn new(key: impl Into<LockKey>) -> Self {
        RunOptions {
            lock_key: key.into(),
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    /// Override the lock ttl for this invocation.
    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }
}

/// Process-scoped runner settings, immutable once the runner exists.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Lowest accepted per-invocation lock ttl.
    pub min_ttl: Duration,
    /// Subtracted from the lock ttl to obtain the extension tick period, so
    /// every tick fires before the previous extension lapses. Must be
    /// strictly shorter than `min_ttl`.
    pub extend_buffer: Duration,
    /// Number of extension ticks after which the task is cancelled.
    pub max_extend_count: u32,
    /// Label attached to every diagnostic event this runner emits.
    pub debug_label: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            min_ttl: DEFAULT_MIN_TTL,
            extend_buffer: DEFAULT_EXTEND_BUFFER,
            max_extend_count: DEFAULT_MAX_EXTEND_COUNT,
            debug_label: "redlock-runner".to_owned(),
        }
    }
}

/// Runs async tasks inside a distributed critical section.
///
/// For the whole lifetime of the task the runner keeps every acquired lock
/// alive by extending it once per tick, cancels the task if extension fails
/// or the tick limit is hit, and releases every lock on every exit path.
/// One runner can serve any number of concurrent [`run`](Runner::run) calls.
#[derive(Debug, Clone)]
pub struct Runner<C> {
    client: C,
    config: RunnerConfig,
}

enum TaskOutcome<T, E> {
    Completed(T),
    Failed(E),
    Cancelled,
}

impl<C: LockClient> Runner<C> {
    /// Create a runner bound to one lock client.
    ///
    /// # Panics
    ///
    /// Panics when `config.extend_buffer` is not strictly shorter than
    /// `config.min_ttl`, which would make the tick period collapse to zero.
    pub fn new(client: C, config: RunnerConfig) -> Runner<C> {
        assert!(
            config.extend_buffer < config.min_ttl,
            "extend_buffer must be strictly shorter than min_ttl"
        );
        Runner { client, config }
    }

    /// Run `task` while holding the locks named by `opts.lock_key`.
    ///
    /// All keys are acquired in parallel before the task starts; if any
    /// acquisition fails the task is never invoked. While the task runs,
    /// every lock is re-extended once per tick period
    /// (`lock_ttl - extend_buffer`). When extension fails, or after
    /// `max_extend_count` ticks, the task is cancelled at its next await
    /// point. Every acquired lock is released exactly once before this
    /// method returns, whatever the outcome.
    pub async fn run<F, Fut, T, E>(&self, task: F, opts: RunOptions) -> Result<T, RunError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if opts.lock_ttl < self.config.min_ttl {
            return Err(RunError::TtlTooShort {
                requested: opts.lock_ttl,
                minimum: self.config.min_ttl,
            });
        }
        let keys = opts.lock_key.into_keys().ok_or(RunError::InvalidLockKey)?;

        let handles = Arc::new(self.acquire_all(&keys, opts.lock_ttl).await?);

        let cancel_task = CancellationToken::new();
        let disarm = CancellationToken::new();
        let scheduler = ExtensionScheduler::new(
            Arc::clone(&handles),
            opts.lock_ttl,
            opts.lock_ttl - self.config.extend_buffer,
            self.config.max_extend_count,
            cancel_task.clone(),
            disarm.clone(),
            self.config.debug_label.clone(),
        )
        .spawn();

        debug!(label = %self.config.debug_label, "task starting");
        let outcome = {
            let task_fut = task();
            tokio::pin!(task_fut);
            tokio::select! {
                // Checked first, so a cancellation that lands together with
                // the task's own result still wins.
                biased;
                () = cancel_task.cancelled() => TaskOutcome::Cancelled,
                result = &mut task_fut => match result {
                    Ok(value) => TaskOutcome::Completed(value),
                    Err(err) => TaskOutcome::Failed(err),
                },
            }
            // The task future is dropped here, so its work has ceased before
            // the locks protecting it are released.
        };

        disarm.cancel();
        let cause = scheduler.await.unwrap_or(None);

        debug!(label = %self.config.debug_label, locks = handles.len(), "releasing locks");
        let release_error = self.release_all(&handles).await;
        debug!(label = %self.config.debug_label, "release finished");

        if let Some(cause) = cause {
            return Err(RunError::Extend(self.extend_error(cause)));
        }
        match outcome {
            TaskOutcome::Completed(value) => match release_error {
                None => Ok(value),
                Some(err) => Err(RunError::Unlock(UnlockError::new(err))),
            },
            TaskOutcome::Failed(err) => Err(RunError::Task(err)),
            // The token fired but the scheduler's report was lost (it can
            // only be missing if the scheduler task itself died).
            TaskOutcome::Cancelled => Err(RunError::Extend(ExtendLockError::cap_exceeded(
                self.config.max_extend_count,
            ))),
        }
    }

    async fn acquire_all(
        &self,
        keys: &[String],
        ttl: Duration,
    ) -> Result<Vec<Box<dyn LockHandle>>, LockError> {
        debug!(
            label = %self.config.debug_label,
            keys = ?keys,
            ttl_ms = ttl.as_millis() as u64,
            "acquiring locks"
        );
        let results = join_all(keys.iter().map(|key| self.client.acquire(key, ttl))).await;

        let mut handles = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(handle) => handles.push(handle),
                Err(err) if first_error.is_none() => first_error = Some(err),
                Err(_) => {}
            }
        }

        match first_error {
            None => Ok(handles),
            Some(err) => {
                // Give back whatever was acquired instead of letting the
                // keys stay taken until their ttl lapses.
                if !handles.is_empty() {
                    warn!(
                        label = %self.config.debug_label,
                        error = %err,
                        released = handles.len(),
                        "acquisition failed part-way, releasing acquired locks"
                    );
                    join_all(handles.iter().map(|handle| handle.release())).await;
                }
                Err(err)
            }
        }
    }

    async fn release_all(&self, handles: &[Box<dyn LockHandle>]) -> Option<LockError> {
        join_all(handles.iter().map(|handle| handle.release()))
            .await
            .into_iter()
            .find_map(Result::err)
    }

    fn extend_error(&self, cause: CancelCause) -> ExtendLockError {
        match cause {
            CancelCause::CapExceeded => {
                ExtendLockError::cap_exceeded(self.config.max_extend_count)
            }
            CancelCause::ExtendFailed(err) => {
                ExtendLockError::extend_failed(err, self.config.max_extend_count)
            }
        }
    }
}

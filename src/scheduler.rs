use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::LockError;
use crate::lock::LockHandle;

/// Why the scheduler requested cancellation of the user task.
#[derive(Debug)]
pub(crate) enum CancelCause {
    CapExceeded,
    ExtendFailed(LockError),
}

/// Repeating timer that keeps every held lock alive while the task runs.
///
/// Each tick extends every handle in parallel. The scheduler requests task
/// cancellation when an extension fails or when the tick count exceeds its
/// limit; the runner disarms it once the task has terminated on its own.
pub(crate) struct ExtensionScheduler {
    handles: Arc<Vec<Box<dyn LockHandle>>>,
    ttl: Duration,
    period: Duration,
    max_ticks: u32,
    cancel_task: CancellationToken,
    disarm: CancellationToken,
    label: String,
}

impl ExtensionScheduler {
    pub(crate) fn new(
        handles: Arc<Vec<Box<dyn LockHandle>>>,
        ttl: Duration,
        period: Duration,
        max_ticks: u32,
        cancel_task: CancellationToken,
        disarm: CancellationToken,
        label: String,
    ) -> Self {
        ExtensionScheduler {
            handles,
            ttl,
            period,
            max_ticks,
            cancel_task,
            disarm,
            label,
        }
    }

    /// Arm the scheduler. The returned handle resolves to the cancellation
    /// cause once the scheduler stops, or `None` when it was disarmed.
    pub(crate) fn spawn(self) -> JoinHandle<Option<CancelCause>> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> Option<CancelCause> {
        let mut ticks: u32 = 0;
        loop {
            tokio::select! {
                biased;
                () = self.disarm.cancelled() => {
                    debug!(label = %self.label, ticks, "extension scheduler disarmed");
                    return None;
                }
                () = tokio::time::sleep(self.period) => {}
            }

            ticks += 1;
            if ticks > self.max_ticks {
                // The cancellation tick: no extension rpc is issued, so with
                // a limit of C exactly C extension rounds can have happened.
                debug!(
                    label = %self.label,
                    limit = self.max_ticks,
                    "extension tick limit exceeded, cancelling task"
                );
                self.cancel_task.cancel();
                return Some(CancelCause::CapExceeded);
            }

            debug!(label = %self.label, tick = ticks, "extending held locks");
            let results = join_all(self.handles.iter().map(|handle| handle.extend(self.ttl))).await;
            if let Some(err) = results.into_iter().find_map(Result::err) {
                debug!(
                    label = %self.label,
                    tick = ticks,
                    error = %err,
                    "lock extension failed, cancelling task"
                );
                self.cancel_task.cancel();
                return Some(CancelCause::ExtendFailed(err));
            }
            debug!(label = %self.label, tick = ticks, "all locks extended");
        }
    }
}

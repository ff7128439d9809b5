//! One-shot timers shared by the heartbeat and retry drivers.

use std::time::Duration;

use tokio::task::AbortHandle;

/// Callback run when a timer fires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a pending timer.
///
/// Dropping the handle does not cancel the timer.
#[derive(Debug)]
pub struct TimerHandle {
    abort: AbortHandle,
}

impl TimerHandle {
    /// Cancel the timer if it has not fired yet.
    pub fn cancel(self) {
        self.abort.abort();
    }

    /// Check whether the timer fired or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Something that can run a callback after a delay.
pub trait Scheduler: Send + Sync + 'static {
    /// Run `callback` once after `delay`.
    fn set_timer(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;

    /// Cancel a pending timer.
    fn clear_timer(&self, handle: TimerHandle) {
        handle.cancel();
    }
}

/// Timers backed by `tokio::time::sleep` on the current runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn set_timer(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        TimerHandle {
            abort: task.abort_handle(),
        }
    }
}

//! Retry driver: one pending backoff timer at a time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use live_core::RetryPolicy;

use crate::scheduler::{Scheduler, TimerHandle, TokioScheduler};

/// Schedules a single pending retry with exponential backoff.
///
/// Retry never gives up on its own; callers decide how many attempts are
/// enough.
pub struct Retry {
    policy: RetryPolicy,
    scheduler: Arc<dyn Scheduler>,
    pending: Mutex<Option<TimerHandle>>,
}

impl Retry {
    /// Create a retry driver on the tokio scheduler.
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_scheduler(policy, Arc::new(TokioScheduler))
    }

    /// Create a retry driver on a custom scheduler.
    pub fn with_scheduler(policy: RetryPolicy, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            policy,
            scheduler,
            pending: Mutex::new(None),
        }
    }

    /// The backoff policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Backoff delay for attempt `count`.
    pub fn timeout(&self, count: u32) -> Duration {
        self.policy.timeout(count)
    }

    /// Run `f` after the backoff for attempt `count`, replacing any pending
    /// retry. Returns the chosen delay.
    pub fn retry_later<F>(&self, count: u32, f: F) -> Duration
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = self.timeout(count);
        let handle = self.scheduler.set_timer(delay, Box::new(f));
        if let Some(previous) = self.lock().replace(handle) {
            self.scheduler.clear_timer(previous);
        }
        tracing::debug!("retry attempt {} scheduled in {:?}", count, delay);
        delay
    }

    /// Cancel the pending retry, if any.
    pub fn clear(&self) {
        if let Some(previous) = self.lock().take() {
            self.scheduler.clear_timer(previous);
        }
    }

    /// Check whether a retry is scheduled and has not fired yet.
    pub fn is_pending(&self) -> bool {
        self.lock().as_ref().is_some_and(|handle| !handle.is_finished())
    }

    fn lock(&self) -> MutexGuard<'_, Option<TimerHandle>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Retry {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for Retry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retry")
            .field("policy", &self.policy)
            .field("pending", &self.is_pending())
            .finish()
    }
}

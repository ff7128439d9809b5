//! Write fences: know when a batch of writes is fully visible.
//!
//! A method that writes to the store runs inside a fence. Every write begins
//! a [`WriteHandle`] on the fence and commits it once the write has been
//! applied and every observer affected by it has caught up. Once the fence
//! is armed and the last handle commits, the completion callbacks run, and
//! the caller can tell the client that all of its writes are reflected in
//! what it has been sent.
//!
//! ```text
//! begin_write ──► begin_write ──► arm ──► committed ──► committed ──► fire
//!  outstanding=1   outstanding=2           outstanding=1  outstanding=0
//! ```
//!
//! The fence that is "current" for a task is carried in a task-local, so
//! store writes can find it without threading it through every call.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::{FenceError, FenceResult};

tokio::task_local! {
    static CURRENT_FENCE: WriteFence;
}

type BeforeFireCallback = Box<dyn FnOnce(&WriteFence) + Send + 'static>;
type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// Barrier that fires once armed and every begun write has committed.
///
/// Cloning yields another handle to the same fence.
#[derive(Clone)]
pub struct WriteFence {
    inner: Arc<Mutex<FenceState>>,
}

#[derive(Default)]
struct FenceState {
    armed: bool,
    fired: bool,
    retired: bool,
    outstanding_writes: usize,
    before_fire: Vec<BeforeFireCallback>,
    completion: Vec<CompletionCallback>,
}

enum Step {
    BeforeFire(Vec<BeforeFireCallback>),
    Complete(Vec<CompletionCallback>),
}

impl WriteFence {
    /// Create an unarmed fence with no outstanding writes.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FenceState::default())),
        }
    }

    /// Register a write that must commit before the fence fires.
    ///
    /// On a retired fence this returns an inert handle.
    ///
    /// # Errors
    ///
    /// [`FenceError::AlreadyFired`] if the fence fired but was not retired.
    pub fn begin_write(&self) -> FenceResult<WriteHandle> {
        let mut state = self.lock();
        if state.retired {
            return Ok(WriteHandle::inert());
        }
        if state.fired {
            return Err(FenceError::AlreadyFired);
        }
        state.outstanding_writes += 1;
        Ok(WriteHandle {
            fence: Some(self.clone()),
            committed: AtomicBool::new(false),
        })
    }

    /// Allow the fence to fire once outstanding writes drain.
    ///
    /// Fires immediately if nothing is outstanding. Arming twice is harmless.
    ///
    /// # Errors
    ///
    /// [`FenceError::ArmedInsideScope`] if called from inside this fence's
    /// own [`WriteFence::scope`].
    pub fn arm(&self) -> FenceResult<()> {
        if current_fence().is_some_and(|current| current.same_fence(self)) {
            return Err(FenceError::ArmedInsideScope);
        }
        self.lock().armed = true;
        self.maybe_fire();
        Ok(())
    }

    /// Register a hook that runs after the fence drains but before it fires.
    ///
    /// Hooks receive the fence and may begin more writes; firing then waits
    /// for those too.
    ///
    /// # Errors
    ///
    /// [`FenceError::AlreadyFired`] if the fence has fired.
    pub fn on_before_fire<F>(&self, callback: F) -> FenceResult<()>
    where
        F: FnOnce(&WriteFence) + Send + 'static,
    {
        let mut state = self.lock();
        if state.fired {
            return Err(FenceError::AlreadyFired);
        }
        state.before_fire.push(Box::new(callback));
        Ok(())
    }

    /// Register a callback that runs when the fence fires.
    ///
    /// # Errors
    ///
    /// [`FenceError::AlreadyFired`] if the fence has fired.
    pub fn on_all_committed<F>(&self, callback: F) -> FenceResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock();
        if state.fired {
            return Err(FenceError::AlreadyFired);
        }
        state.completion.push(Box::new(callback));
        Ok(())
    }

    /// Arm the fence and wait until it fires.
    ///
    /// # Errors
    ///
    /// Same as [`WriteFence::on_all_committed`] and [`WriteFence::arm`].
    pub async fn arm_and_wait(&self) -> FenceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.on_all_committed(move || {
            let _ = tx.send(());
        })?;
        self.arm()?;
        // The sender lives in the fence, which `self` keeps alive.
        let _ = rx.await;
        Ok(())
    }

    /// Mark a fired fence as finished with.
    ///
    /// Later `begin_write` calls get inert handles instead of an error, so
    /// timers that outlive the method that created the fence do not fail.
    ///
    /// # Errors
    ///
    /// [`FenceError::NotFired`] if the fence has not fired yet.
    pub fn retire(&self) -> FenceResult<()> {
        let mut state = self.lock();
        if !state.fired {
            return Err(FenceError::NotFired);
        }
        state.retired = true;
        Ok(())
    }

    /// Check whether the fence is armed.
    pub fn is_armed(&self) -> bool {
        self.lock().armed
    }

    /// Check whether the fence has fired.
    pub fn is_fired(&self) -> bool {
        self.lock().fired
    }

    /// Check whether the fence has been retired.
    pub fn is_retired(&self) -> bool {
        self.lock().retired
    }

    /// Writes begun but not yet committed.
    pub fn outstanding_writes(&self) -> usize {
        self.lock().outstanding_writes
    }

    /// Check whether two handles refer to the same fence.
    pub fn same_fence(&self, other: &WriteFence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `fut` with `fence` installed as the current fence.
    ///
    /// Tasks spawned from inside `fut` do not inherit the fence.
    pub async fn scope<F>(fence: WriteFence, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_FENCE.scope(fence, fut).await
    }

    fn lock(&self) -> MutexGuard<'_, FenceState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn commit_one(&self) {
        {
            let mut state = self.lock();
            state.outstanding_writes = state.outstanding_writes.saturating_sub(1);
        }
        self.maybe_fire();
    }

    fn maybe_fire(&self) {
        loop {
            let step = {
                let mut state = self.lock();
                if !state.armed || state.fired || state.outstanding_writes > 0 {
                    return;
                }
                if state.before_fire.is_empty() {
                    state.fired = true;
                    Step::Complete(std::mem::take(&mut state.completion))
                } else {
                    // Held open while hooks run so a hook's own writes cannot fire us early.
                    state.outstanding_writes += 1;
                    Step::BeforeFire(std::mem::take(&mut state.before_fire))
                }
            };

            match step {
                Step::BeforeFire(hooks) => {
                    for hook in hooks {
                        invoke(|| hook(self));
                    }
                    let mut state = self.lock();
                    state.outstanding_writes -= 1;
                }
                Step::Complete(callbacks) => {
                    tracing::debug!("write fence fired ({} callback(s))", callbacks.len());
                    for callback in callbacks {
                        invoke(callback);
                    }
                    return;
                }
            }
        }
    }
}

impl Default for WriteFence {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WriteFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("WriteFence")
            .field("armed", &state.armed)
            .field("fired", &state.fired)
            .field("retired", &state.retired)
            .field("outstanding_writes", &state.outstanding_writes)
            .finish()
    }
}

fn invoke<F: FnOnce()>(callback: F) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        tracing::error!("exception in write fence callback");
    }
}

/// The fence installed by the enclosing [`WriteFence::scope`], if any.
pub fn current_fence() -> Option<WriteFence> {
    CURRENT_FENCE.try_with(WriteFence::clone).ok()
}

/// Begin a write on the current fence, or return an inert handle when the
/// caller is not inside a fence scope.
///
/// # Errors
///
/// [`FenceError::AlreadyFired`] if the current fence already fired.
pub fn maybe_begin_write() -> FenceResult<WriteHandle> {
    match current_fence() {
        Some(fence) => fence.begin_write(),
        None => Ok(WriteHandle::inert()),
    }
}

/// One in-flight write registered on a fence.
///
/// Dropping an uncommitted handle commits it, so an abandoned write cannot
/// hold its fence open forever.
#[must_use = "a write handle must be committed once the write is visible"]
pub struct WriteHandle {
    fence: Option<WriteFence>,
    committed: AtomicBool,
}

impl WriteHandle {
    /// A handle attached to no fence. Committing it does nothing.
    pub fn inert() -> Self {
        Self {
            fence: None,
            committed: AtomicBool::new(false),
        }
    }

    /// Mark the write as durably applied.
    ///
    /// # Errors
    ///
    /// [`FenceError::DoubleCommit`] on the second call.
    pub fn committed(&self) -> FenceResult<()> {
        if self.committed.swap(true, Ordering::SeqCst) {
            return Err(FenceError::DoubleCommit);
        }
        if let Some(fence) = &self.fence {
            fence.commit_one();
        }
        Ok(())
    }

    /// Check whether `committed()` has been called.
    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    /// Check whether this handle belongs to no fence.
    pub fn is_inert(&self) -> bool {
        self.fence.is_none()
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if self.fence.is_some() && !self.is_committed() {
            tracing::warn!("write handle dropped without commit; committing");
            let _ = self.committed();
        }
    }
}

impl std::fmt::Debug for WriteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteHandle")
            .field("inert", &self.is_inert())
            .field("committed", &self.is_committed())
            .finish()
    }
}

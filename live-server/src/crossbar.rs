//! Invalidation crossbar: pattern-matched pub/sub between writers and
//! observers.
//!
//! Writers fire notifications describing what they touched, e.g.
//! `{collection: "docs", id: "x"}`. Observers listen with triggers, e.g.
//! `{collection: "docs"}`. A listener is invoked when every key of its
//! trigger is present in the notification with an equal value.
//!
//! Each invoked listener gets an [`Ack`]. The fire's completion callback runs
//! once every ack has been released. Releasing is dropping: an ack that is
//! sent away and dropped later delays completion until then, and a listener
//! that fails or panics releases its ack on the way out.
//!
//! Listeners are bucketed by the `collection` key of their trigger, so a
//! fire only looks at listeners for its own collection plus listeners whose
//! trigger names no collection.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tokio::sync::oneshot;

use live_core::triggers::COLLECTION_KEY;
use live_types::{Notification, Trigger};

use crate::error::CrossbarError;

type ListenerFn = dyn Fn(&Notification, Ack) -> anyhow::Result<()> + Send + Sync + 'static;

/// Bucket key: the trigger's collection, or `None` for collection-less triggers.
type Bucket = Option<String>;

/// Crossbar counters.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct CrossbarMetrics {
    /// Notifications fired.
    pub fires_total: AtomicU64,
    /// Listener callbacks invoked.
    pub invocations_total: AtomicU64,
    /// Listener callbacks that returned an error or panicked.
    pub listener_errors_total: AtomicU64,
}

/// Trigger/listener registry.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct Crossbar {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    buckets: Mutex<HashMap<Bucket, HashMap<u64, Arc<Listener>>>>,
    metrics: CrossbarMetrics,
}

struct Listener {
    trigger: Trigger,
    callback: Box<ListenerFn>,
}

impl Crossbar {
    /// Create an empty crossbar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for notifications matching `trigger`.
    ///
    /// The listener stays registered until the returned handle is stopped
    /// or dropped.
    ///
    /// # Errors
    ///
    /// Fails if the trigger has an empty or non-string `collection`.
    pub fn listen<F>(&self, trigger: Trigger, callback: F) -> Result<ListenerHandle, CrossbarError>
    where
        F: Fn(&Notification, Ack) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let bucket = collection_of(&trigger)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("crossbar: listener {} registered for {:?}", id, trigger);
        let listener = Arc::new(Listener {
            trigger,
            callback: Box::new(callback),
        });
        self.inner
            .lock()
            .entry(bucket.clone())
            .or_default()
            .insert(id, listener);

        Ok(ListenerHandle {
            crossbar: Arc::downgrade(&self.inner),
            bucket,
            id,
            stopped: false,
        })
    }

    /// Invoke every listener matching `notification`, then run `on_complete`
    /// once all their acks are released.
    ///
    /// The set of listeners is snapshotted when the fire starts; listeners
    /// stopped during the fire are still invoked for it. With no matching
    /// listeners `on_complete` runs before `fire` returns.
    ///
    /// # Errors
    ///
    /// Fails if the notification has an empty or non-string `collection`.
    pub fn fire<F>(&self, notification: &Notification, on_complete: F) -> Result<(), CrossbarError>
    where
        F: FnOnce() + Send + 'static,
    {
        let bucket = collection_of(notification)?;
        let matching = self.matching(&bucket, notification);
        self.inner.metrics.fires_total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "crossbar: firing {:?} to {} listener(s)",
            notification,
            matching.len()
        );

        let group = AckGroup::new(on_complete);
        // The fire holds its own ack so completion cannot run mid-loop.
        let own = Ack::new(Arc::clone(&group));

        for listener in matching {
            self.inner
                .metrics
                .invocations_total
                .fetch_add(1, Ordering::Relaxed);
            let ack = Ack::new(Arc::clone(&group));
            let outcome = catch_unwind(AssertUnwindSafe(|| (listener.callback)(notification, ack)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.inner
                        .metrics
                        .listener_errors_total
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("crossbar listener for {:?} failed: {:#}", listener.trigger, e);
                }
                Err(_) => {
                    self.inner
                        .metrics
                        .listener_errors_total
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::error!("crossbar listener for {:?} panicked", listener.trigger);
                }
            }
        }

        drop(own);
        Ok(())
    }

    /// Fire `notification` and wait until every invoked listener has acked.
    ///
    /// # Errors
    ///
    /// Same as [`Crossbar::fire`].
    pub async fn fire_and_wait(&self, notification: &Notification) -> Result<(), CrossbarError> {
        let (tx, rx) = oneshot::channel();
        self.fire(notification, move || {
            let _ = tx.send(());
        })?;
        // The completion callback is always called or dropped, so this resolves.
        let _ = rx.await;
        Ok(())
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().values().map(HashMap::len).sum()
    }

    /// Operational counters.
    pub fn metrics(&self) -> &CrossbarMetrics {
        &self.inner.metrics
    }

    fn matching(&self, bucket: &Bucket, notification: &Notification) -> Vec<Arc<Listener>> {
        let buckets = self.inner.lock();
        let mut scan: Vec<&HashMap<u64, Arc<Listener>>> = Vec::with_capacity(2);
        if let Some(listeners) = buckets.get(bucket) {
            scan.push(listeners);
        }
        if bucket.is_some() {
            if let Some(listeners) = buckets.get(&None) {
                scan.push(listeners);
            }
        }
        scan.into_iter()
            .flat_map(HashMap::values)
            .filter(|listener| listener.trigger.is_subset_of(notification))
            .cloned()
            .collect()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<Bucket, HashMap<u64, Arc<Listener>>>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, bucket: &Bucket, id: u64) {
        let mut buckets = self.lock();
        if let Some(listeners) = buckets.get_mut(bucket) {
            listeners.remove(&id);
            if listeners.is_empty() {
                buckets.remove(bucket);
            }
        }
    }
}

impl std::fmt::Debug for Crossbar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crossbar")
            .field("listeners", &self.listener_count())
            .field("metrics", &self.inner.metrics)
            .finish()
    }
}

fn collection_of(fields: &Notification) -> Result<Bucket, CrossbarError> {
    match fields.get(COLLECTION_KEY) {
        None => Ok(None),
        Some(Value::String(name)) if name.is_empty() => Err(CrossbarError::EmptyCollection),
        Some(Value::String(name)) => Ok(Some(name.clone())),
        Some(_) => Err(CrossbarError::NonStringCollection),
    }
}

/// Registration returned by [`Crossbar::listen`].
///
/// Dropping the handle stops the listener.
#[derive(Debug)]
pub struct ListenerHandle {
    crossbar: Weak<Inner>,
    bucket: Bucket,
    id: u64,
    stopped: bool,
}

impl ListenerHandle {
    /// Deregister the listener. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Some(inner) = self.crossbar.upgrade() {
            inner.remove(&self.bucket, self.id);
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct AckGroup {
    remaining: AtomicUsize,
    on_complete: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
}

impl AckGroup {
    fn new<F>(on_complete: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Arc::new(Self {
            remaining: AtomicUsize::new(0),
            on_complete: Mutex::new(Some(Box::new(on_complete))),
        })
    }

    fn release(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let callback = self
                .on_complete
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(callback) = callback {
                if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                    tracing::error!("crossbar completion callback panicked");
                }
            }
        }
    }
}

/// Acknowledgement owed by one listener invocation.
///
/// Released by [`Ack::ack`] or by dropping it.
#[must_use = "dropping an ack releases it immediately"]
pub struct Ack {
    group: Arc<AckGroup>,
}

impl Ack {
    fn new(group: Arc<AckGroup>) -> Self {
        group.remaining.fetch_add(1, Ordering::AcqRel);
        Self { group }
    }

    /// Release the acknowledgement.
    pub fn ack(self) {}
}

impl Drop for Ack {
    fn drop(&mut self) {
        self.group.release();
    }
}

impl std::fmt::Debug for Ack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ack")
            .field("outstanding", &self.group.remaining.load(Ordering::Acquire))
            .finish()
    }
}

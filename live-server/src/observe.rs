//! Polling observers for cursor descriptions.
//!
//! Identical cursor descriptions share one [`Multiplexer`]: one set of
//! crossbar listeners, one polling task and one published snapshot. Each
//! [`Observer`] handle gets its own event channel; a handle that joins late
//! first receives the current snapshot as `Added` events.
//!
//! ```text
//! store write → crossbar.fire → listener → batch → refetch / requery
//!                                                     ↓
//!                      events fanned out to every handle, then acks released
//! ```
//!
//! Notifications naming a single document are refetched through the shared
//! [`DocFetcher`] and staged in a [`CowIdMap`] over the published snapshot.
//! Anything broader (a dropped collection, a dropped database) re-runs the
//! whole query and diffs the two snapshots. A failed re-query is retried with
//! backoff while the batch's acks stay held. Independently of
//! notifications, the query is re-run every `poll_interval` to catch writes
//! that were never announced.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use live_core::triggers::ID_KEY;
use live_core::{
    cow_change_events, diff_query_changes, ChangeEvent, CowIdMap, CursorDescription, IdMap, RetryPolicy,
};
use live_types::{DocId, Document, Frame, Notification};

use crate::config::Config;
use crate::crossbar::{Ack, Crossbar, ListenerHandle};
use crate::doc_fetcher::DocFetcher;
use crate::error::{Result, StoreResult};
use crate::store::{DocumentStore, SEQ_KEY};

type Snapshot = IdMap<DocId, Document>;
type Registry = DashMap<String, Weak<Multiplexer>>;

/// Polling behaviour of the observers a hub starts.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSettings {
    /// Period of the safety re-query. `None` disables it.
    pub poll_interval: Option<Duration>,
    /// Backoff between failed re-queries.
    pub backoff: RetryPolicy,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            poll_interval: Some(Duration::from_secs(10)),
            backoff: RetryPolicy::default(),
        }
    }
}

impl PollSettings {
    /// Settings from the `[observe]` and `[retry]` sections.
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.observe.poll_interval(),
            backoff: config.retry.policy(),
        }
    }
}

/// Starts observers, sharing one multiplexer per distinct query.
pub struct ObserveHub {
    store: Arc<dyn DocumentStore>,
    crossbar: Crossbar,
    fetcher: Arc<DocFetcher>,
    settings: PollSettings,
    multiplexers: Arc<Registry>,
    starting: tokio::sync::Mutex<()>,
}

impl ObserveHub {
    /// Create a hub reading from `store` and listening on `crossbar`.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        crossbar: Crossbar,
        fetcher: Arc<DocFetcher>,
        settings: PollSettings,
    ) -> Self {
        Self {
            store,
            crossbar,
            fetcher,
            settings,
            multiplexers: Arc::new(DashMap::new()),
            starting: tokio::sync::Mutex::new(()),
        }
    }

    /// Observe `description`, joining a running multiplexer for an
    /// identical query if there is one.
    ///
    /// # Errors
    ///
    /// Fails if a trigger is rejected by the crossbar or the initial query
    /// fails.
    pub async fn observe(&self, description: CursorDescription) -> Result<Observer> {
        let key = description.observe_key();
        // Held across the initial query so two callers cannot both start `key`.
        let _starting = self.starting.lock().await;

        let running = self
            .multiplexers
            .get(&key)
            .and_then(|entry| entry.value().upgrade());
        if let Some(multiplexer) = running {
            tracing::debug!("observer: joining {}", key);
            return Ok(Observer::attach(multiplexer));
        }

        let multiplexer = Multiplexer::start(
            key.clone(),
            description,
            Arc::clone(&self.store),
            &self.crossbar,
            Arc::clone(&self.fetcher),
            self.settings.clone(),
            Arc::downgrade(&self.multiplexers),
        )
        .await?;
        self.multiplexers.insert(key, Arc::downgrade(&multiplexer));
        Ok(Observer::attach(multiplexer))
    }

    /// Number of distinct queries being observed.
    pub fn multiplexer_count(&self) -> usize {
        self.multiplexers
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    /// The shared document fetcher.
    pub fn fetcher(&self) -> &Arc<DocFetcher> {
        &self.fetcher
    }

    /// Polling settings applied to new multiplexers.
    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }
}

impl std::fmt::Debug for ObserveHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserveHub")
            .field("multiplexers", &self.multiplexer_count())
            .field("settings", &self.settings)
            .finish()
    }
}

/// Live result set of one query, as seen by one handle.
///
/// Dropping the last handle of a query stops its listeners and its polling
/// task.
pub struct Observer {
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    sink: u64,
    multiplexer: Arc<Multiplexer>,
}

impl Observer {
    fn attach(multiplexer: Arc<Multiplexer>) -> Self {
        let (sink, events) = multiplexer.shared.attach();
        Self {
            events,
            sink,
            multiplexer,
        }
    }

    /// The query being observed.
    pub fn description(&self) -> &CursorDescription {
        &self.multiplexer.description
    }

    /// Wait for the next change.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// Take the next change if one is queued.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.events.try_recv().ok()
    }

    /// Drain every queued change.
    pub fn drain(&mut self) -> Vec<ChangeEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Stop this handle.
    pub fn stop(self) {}
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.multiplexer.shared.detach(self.sink);
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("key", &self.multiplexer.key)
            .field("sink", &self.sink)
            .finish()
    }
}

/// Wire frame for a change in `collection`.
pub fn change_frame(collection: &str, event: ChangeEvent) -> Frame {
    let collection = collection.to_string();
    match event {
        ChangeEvent::Added { id, fields } => Frame::Added {
            collection,
            id: id.stringify(),
            fields,
        },
        ChangeEvent::Changed { id, fields } => Frame::Changed {
            collection,
            id: id.stringify(),
            fields,
        },
        ChangeEvent::Removed { id } => Frame::Removed {
            collection,
            id: id.stringify(),
        },
    }
}

/// One polling driver shared by every handle on the same query.
struct Multiplexer {
    key: String,
    description: CursorDescription,
    shared: Arc<Shared>,
    listeners: Vec<ListenerHandle>,
    task: JoinHandle<()>,
    registry: Weak<Registry>,
}

impl Multiplexer {
    /// Register listeners before the initial query, so no write falls
    /// between the two.
    async fn start(
        key: String,
        description: CursorDescription,
        store: Arc<dyn DocumentStore>,
        crossbar: &Crossbar,
        fetcher: Arc<DocFetcher>,
        settings: PollSettings,
        registry: Weak<Registry>,
    ) -> Result<Arc<Self>> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel::<(Notification, Ack)>();
        let mut listeners = Vec::new();
        for trigger in description.triggers() {
            let tx = notify_tx.clone();
            let handle = crossbar.listen(trigger, move |notification, ack| {
                tx.send((notification.clone(), ack))
                    .map_err(|_| anyhow::anyhow!("observer stopped"))
            })?;
            listeners.push(handle);
        }
        drop(notify_tx);

        let published = Arc::new(store.find(&description.collection, &description.selector).await?);
        tracing::debug!(
            "observer: {} started with {} document(s)",
            key,
            published.len()
        );

        let shared = Arc::new(Shared {
            state: Mutex::new(Published {
                snapshot: Arc::clone(&published),
                sinks: HashMap::new(),
                next_sink: 0,
            }),
        });
        let poller = Poller {
            description: description.clone(),
            store,
            fetcher,
            settings,
            published,
            shared: Arc::clone(&shared),
        };
        let task = tokio::spawn(poller.run(notify_rx));

        Ok(Arc::new(Self {
            key,
            description,
            shared,
            listeners,
            task,
            registry,
        }))
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        for handle in &mut self.listeners {
            handle.stop();
        }
        self.task.abort();
        if let Some(registry) = self.registry.upgrade() {
            // A newer multiplexer may already own the key.
            registry.remove_if(&self.key, |_, weak| weak.strong_count() == 0);
        }
        tracing::debug!("observer: {} stopped", self.key);
    }
}

/// Published snapshot plus the handles it is fanned out to.
struct Shared {
    state: Mutex<Published>,
}

struct Published {
    snapshot: Arc<Snapshot>,
    sinks: HashMap<u64, mpsc::UnboundedSender<ChangeEvent>>,
    next_sink: u64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Published> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a handle, replaying the current snapshot to it.
    fn attach(&self) -> (u64, mpsc::UnboundedReceiver<ChangeEvent>) {
        let mut state = self.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        for (id, fields) in state.snapshot.iter() {
            let _ = tx.send(ChangeEvent::Added {
                id,
                fields: fields.clone(),
            });
        }
        let sink = state.next_sink;
        state.next_sink += 1;
        state.sinks.insert(sink, tx);
        (sink, rx)
    }

    fn detach(&self, sink: u64) {
        self.lock().sinks.remove(&sink);
    }

    fn publish(&self, snapshot: Arc<Snapshot>, events: &[ChangeEvent]) {
        let mut state = self.lock();
        state.snapshot = snapshot;
        state
            .sinks
            .retain(|_, tx| events.iter().all(|event| tx.send(event.clone()).is_ok()));
    }
}

/// A new snapshot and the events leading to it.
struct Update {
    snapshot: Snapshot,
    events: Vec<ChangeEvent>,
}

struct Poller {
    description: CursorDescription,
    store: Arc<dyn DocumentStore>,
    fetcher: Arc<DocFetcher>,
    settings: PollSettings,
    published: Arc<Snapshot>,
    shared: Arc<Shared>,
}

/// What a batch of notifications asks for.
enum Work {
    Refetch(Vec<(DocId, String)>),
    Requery,
}

impl Poller {
    async fn run(mut self, mut notifications: mpsc::UnboundedReceiver<(Notification, Ack)>) {
        let mut ticker = self.settings.poll_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                received = notifications.recv() => {
                    let Some(first) = received else { return };
                    let mut batch = vec![first];
                    while let Ok(next) = notifications.try_recv() {
                        batch.push(next);
                    }

                    let update = match self.plan(&batch) {
                        Work::Refetch(targets) => match self.refetch(targets).await {
                            Some(update) => update,
                            None => self.requery_until_ok().await,
                        },
                        Work::Requery => self.requery_until_ok().await,
                    };
                    self.publish(update);
                    // Acks go last: the writer's fence waits on them.
                    drop(batch);
                }
                _ = next_tick(&mut ticker) => match self.requery().await {
                    Ok(update) => self.publish(update),
                    Err(e) => tracing::warn!(
                        "observer: periodic requery of {} failed: {}",
                        self.description.collection,
                        e
                    ),
                },
            }
        }
    }

    fn plan(&self, batch: &[(Notification, Ack)]) -> Work {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for (notification, _) in batch {
            let Some(id) = notification.get(ID_KEY).and_then(|v| v.as_str()) else {
                return Work::Requery;
            };
            let cache_key = match notification.get(SEQ_KEY) {
                Some(seq) => format!("{}/{}@{}", self.description.collection, id, seq),
                None => format!("{}/{}", self.description.collection, id),
            };
            if seen.insert(id.to_string()) {
                targets.push((DocId::parse(id), cache_key));
            }
        }
        Work::Refetch(targets)
    }

    /// Fold refetched documents into the published snapshot. `None` if a
    /// fetch failed.
    async fn refetch(&self, targets: Vec<(DocId, String)>) -> Option<Update> {
        let collection = self.description.collection.as_str();
        let fetches = targets
            .iter()
            .map(|(id, cache_key)| self.fetcher.fetch(collection, id, cache_key));
        let results = join_all(fetches).await;

        let mut cow = CowIdMap::new(&*self.published);
        for ((id, _), result) in targets.into_iter().zip(results) {
            match result {
                Ok(Some(doc)) if self.description.selector.matches(&id, &doc) => cow.set(id, doc),
                Ok(_) => {
                    if cow.has(&id) {
                        cow.remove(id);
                    }
                }
                Err(e) => {
                    tracing::warn!("observer: refetch of {} failed, requerying: {}", id, e);
                    return None;
                }
            }
        }
        Some(Update {
            events: cow_change_events(&cow),
            snapshot: cow.flatten(),
        })
    }

    async fn requery(&self) -> StoreResult<Update> {
        let next = self
            .store
            .find(&self.description.collection, &self.description.selector)
            .await?;
        Ok(Update {
            events: diff_query_changes(&*self.published, &next),
            snapshot: next,
        })
    }

    /// Re-run the query until it succeeds. The caller keeps holding its
    /// batch's acks meanwhile, so no fence fires on a write this observer
    /// has not reflected.
    async fn requery_until_ok(&self) -> Update {
        let mut attempt = 0;
        loop {
            match self.requery().await {
                Ok(update) => return update,
                Err(e) => {
                    let delay = self.settings.backoff.timeout(attempt);
                    tracing::warn!(
                        "observer: requery of {} failed, retrying in {:?}: {}",
                        self.description.collection,
                        delay,
                        e
                    );
                    attempt = attempt.saturating_add(1);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn publish(&mut self, update: Update) {
        let snapshot = Arc::new(update.snapshot);
        self.published = Arc::clone(&snapshot);
        self.shared.publish(snapshot, &update.events);
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

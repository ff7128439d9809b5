//! Single-flight document fetches.
//!
//! Concurrent fetches that share a cache key share one store query. The
//! first caller starts the query on its own task; later callers join the
//! waiter list for that key, which can keep growing while the query is in
//! flight. When the query finishes every waiter gets its own clone of the
//! document (or of the error) and the entry is removed, so nothing is cached
//! past the in-flight window.
//!
//! Callers guarantee that requests sharing a cache key are for the same
//! resource; the fetcher does not check.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;

use live_types::{DocId, Document};

use crate::error::FetchError;
use crate::store::DocumentStore;

type FetchResult = Result<Option<Document>, FetchError>;
type Waiters = DashMap<String, Flight>;

/// Waiters of one in-flight query. `token` tells this flight apart from a
/// later one under the same cache key.
struct Flight {
    token: u64,
    senders: Vec<oneshot::Sender<FetchResult>>,
}

/// De-duplicates concurrent `find_one` calls by cache key.
pub struct DocFetcher {
    store: Arc<dyn DocumentStore>,
    callbacks_for_cache_key: Arc<Waiters>,
    next_token: AtomicU64,
}

impl DocFetcher {
    /// Create a fetcher over `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            callbacks_for_cache_key: Arc::new(DashMap::new()),
            next_token: AtomicU64::new(0),
        }
    }

    /// Fetch document `id` from `collection`, sharing any in-flight query
    /// for `cache_key`.
    ///
    /// # Errors
    ///
    /// The store's error, delivered to every waiter of the failed query, or
    /// [`FetchError::Abandoned`] if the query task died.
    pub async fn fetch(&self, collection: &str, id: &DocId, cache_key: &str) -> FetchResult {
        let (tx, rx) = oneshot::channel();

        let started = match self.callbacks_for_cache_key.entry(cache_key.to_string()) {
            Entry::Occupied(mut flight) => {
                let senders = &mut flight.get_mut().senders;
                senders.push(tx);
                tracing::debug!("fetch {} coalesced ({} waiting)", cache_key, senders.len());
                None
            }
            Entry::Vacant(slot) => {
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                slot.insert(Flight {
                    token,
                    senders: vec![tx],
                });
                Some(token)
            }
        };

        if let Some(token) = started {
            let guard = FinishGuard {
                waiters: Arc::clone(&self.callbacks_for_cache_key),
                cache_key: cache_key.to_string(),
                token,
            };
            let store = Arc::clone(&self.store);
            let collection = collection.to_string();
            let id = id.clone();
            // Own task, so the query survives the first caller being cancelled.
            tokio::spawn(async move {
                let result = store
                    .find_one(&collection, &id)
                    .await
                    .map_err(FetchError::from);
                guard.resolve(result);
            });
        }

        rx.await.unwrap_or(Err(FetchError::Abandoned))
    }

    /// Number of cache keys with a query in flight.
    pub fn in_flight(&self) -> usize {
        self.callbacks_for_cache_key.len()
    }
}

impl std::fmt::Debug for DocFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocFetcher")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Removes its own flight's cache entry when the query task ends, however
/// it ends.
///
/// If the task dies before resolving, the senders are dropped with the entry
/// and every waiter sees [`FetchError::Abandoned`]. An entry started by a
/// later flight under the same key is never touched.
struct FinishGuard {
    waiters: Arc<Waiters>,
    cache_key: String,
    token: u64,
}

impl FinishGuard {
    fn take_flight(&self) -> Option<Flight> {
        self.waiters
            .remove_if(&self.cache_key, |_, flight| flight.token == self.token)
            .map(|(_, flight)| flight)
    }

    fn resolve(self, result: FetchResult) {
        let waiters = self
            .take_flight()
            .map(|flight| flight.senders)
            .unwrap_or_default();
        if let Err(e) = &result {
            tracing::debug!(
                "fetch {} failed for {} waiter(s): {}",
                self.cache_key,
                waiters.len(),
                e
            );
        }
        for waiter in waiters {
            // Each waiter gets an independent copy.
            let _ = waiter.send(result.clone());
        }
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        // After `resolve` the flight is already gone.
        self.take_flight();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crossbar::Crossbar;
    use crate::error::StoreError;
    use crate::store::testing::CountingStore;
    use crate::store::MemoryStore;
    use futures_util::future::join_all;
    use serde_json::{json, Value};
    use std::time::Duration;

    async fn setup() -> (Arc<CountingStore>, DocFetcher) {
        let memory = Arc::new(MemoryStore::new(Crossbar::new()));
        let mut doc = Document::new();
        doc.insert("tags".into(), json!(["a", "b"]));
        memory.insert("docs", "x".into(), doc).await.unwrap();

        let store = Arc::new(CountingStore::new(memory, Duration::from_millis(10)));
        let fetcher = DocFetcher::new(Arc::clone(&store) as Arc<dyn DocumentStore>);
        (store, fetcher)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_fetches_share_one_query() {
        let (store, fetcher) = setup().await;
        let id = DocId::from("x");

        let results = join_all((0..5).map(|_| fetcher.fetch("docs", &id, "docs/x@1"))).await;

        assert_eq!(store.calls(), 1);
        let mut docs: Vec<Document> = results
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();
        assert!(docs.windows(2).all(|pair| pair[0] == pair[1]));

        // Mutating one result does not leak into the others.
        docs[0].insert("tags".into(), Value::Null);
        assert_eq!(docs[1].get("tags"), Some(&json!(["a", "b"])));

        assert_eq!(fetcher.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_waiter_joins_the_running_query() {
        let (store, fetcher) = setup().await;
        let fetcher = Arc::new(fetcher);
        let id = DocId::from("x");

        let first = {
            let fetcher = Arc::clone(&fetcher);
            let id = id.clone();
            tokio::spawn(async move { fetcher.fetch("docs", &id, "docs/x@1").await })
        };
        // Halfway through the 10ms query.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.calls(), 1);
        assert_eq!(fetcher.in_flight(), 1);

        let second = fetcher.fetch("docs", &id, "docs/x@1").await.unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(store.calls(), 1);
        assert!(second.is_some());
        assert_eq!(first, second);
        assert_eq!(fetcher.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn back_to_back_flights_never_abandon_waiters() {
        let memory = Arc::new(MemoryStore::new(Crossbar::new()));
        memory.insert("docs", "x".into(), Document::new()).await.unwrap();
        let fetcher = Arc::new(DocFetcher::new(memory as Arc<dyn DocumentStore>));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let fetcher = Arc::clone(&fetcher);
                tokio::spawn(async move {
                    let id = DocId::from("x");
                    let mut abandoned = 0;
                    for _ in 0..5_000 {
                        match fetcher.fetch("docs", &id, "k").await {
                            Ok(Some(_)) => {}
                            Err(FetchError::Abandoned) => abandoned += 1,
                            other => panic!("Unexpected fetch result: {:?}", other),
                        }
                    }
                    abandoned
                })
            })
            .collect();

        let mut abandoned = 0;
        for task in tasks {
            abandoned += task.await.unwrap();
        }
        assert_eq!(abandoned, 0);
        assert_eq!(fetcher.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn different_keys_query_separately() {
        let (store, fetcher) = setup().await;
        let id = DocId::from("x");

        let (a, b) = tokio::join!(
            fetcher.fetch("docs", &id, "docs/x@1"),
            fetcher.fetch("docs", &id, "docs/x@2"),
        );
        assert!(a.unwrap().is_some());
        assert!(b.unwrap().is_some());
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_do_not_outlive_the_query() {
        let (store, fetcher) = setup().await;
        let id = DocId::from("x");

        fetcher.fetch("docs", &id, "k").await.unwrap();
        fetcher.fetch("docs", &id, "k").await.unwrap();
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_document_is_none() {
        let (_store, fetcher) = setup().await;
        let result = fetcher.fetch("docs", &"nope".into(), "docs/nope").await;
        assert_eq!(result, Ok(None));
    }

    #[tokio::test(start_paused = true)]
    async fn errors_fan_out_and_are_not_cached() {
        let (store, fetcher) = setup().await;
        let id = DocId::from("x");
        *store.fail_next.lock().unwrap() = Some(StoreError::Backend("disk on fire".into()));

        let results = join_all((0..5).map(|_| fetcher.fetch("docs", &id, "docs/x"))).await;

        assert_eq!(store.calls(), 1);
        for result in results {
            assert_eq!(
                result,
                Err(FetchError::Store(StoreError::Backend("disk on fire".into())))
            );
        }
        assert_eq!(fetcher.in_flight(), 0);

        // The next fetch goes back to the store.
        let retried = fetcher.fetch("docs", &id, "docs/x").await.unwrap();
        assert!(retried.is_some());
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_first_caller_does_not_strand_others() {
        let (store, fetcher) = setup().await;
        let fetcher = Arc::new(fetcher);
        let id = DocId::from("x");

        let first = {
            let fetcher = Arc::clone(&fetcher);
            let id = id.clone();
            tokio::spawn(async move { fetcher.fetch("docs", &id, "shared").await })
        };
        tokio::task::yield_now().await;
        first.abort();

        let second = fetcher.fetch("docs", &id, "shared").await.unwrap();
        assert!(second.is_some());
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn coalesced_fetches_are_logged() {
        let logs = crate::telemetry::testing::LogCapture::default();
        let _guard = logs.install();
        let (_store, fetcher) = setup().await;
        let id = DocId::from("x");

        let (a, b) = tokio::join!(
            fetcher.fetch("docs", &id, "docs/x@1"),
            fetcher.fetch("docs", &id, "docs/x@1"),
        );
        assert_eq!(a, b);
        assert!(logs.contents().contains("fetch docs/x@1 coalesced (2 waiting)"));
    }
}

//! Document store abstraction.
//!
//! Writes go through the store so it can register them on the current
//! [`WriteFence`](crate::WriteFence) and fire the crossbar once they are
//! applied.

mod memory;

pub use memory::{MemoryStore, SEQ_KEY};

use async_trait::async_trait;
use live_core::{IdMap, Selector};
use live_types::{DocId, Document};

use crate::error::StoreResult;

/// Trait for document stores.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch one document by id.
    async fn find_one(&self, collection: &str, id: &DocId) -> StoreResult<Option<Document>>;

    /// Fetch every document the selector matches.
    async fn find(&self, collection: &str, selector: &Selector) -> StoreResult<IdMap<DocId, Document>>;

    /// Insert a new document.
    async fn insert(&self, collection: &str, id: DocId, doc: Document) -> StoreResult<()>;

    /// Replace an existing document.
    async fn update(&self, collection: &str, id: &DocId, doc: Document) -> StoreResult<()>;

    /// Remove a document.
    async fn remove(&self, collection: &str, id: &DocId) -> StoreResult<()>;

    /// Remove every document in a collection.
    async fn drop_collection(&self, collection: &str) -> StoreResult<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Store wrappers for exercising callers of [`DocumentStore`].

    use super::*;
    use crate::error::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Counts `find_one` calls, optionally delays them, and can fail the
    /// next `find_one` or the next `find`.
    pub struct CountingStore {
        pub inner: Arc<dyn DocumentStore>,
        pub find_one_calls: AtomicUsize,
        pub delay: Duration,
        pub fail_next: Mutex<Option<StoreError>>,
        pub fail_next_find: Mutex<Option<StoreError>>,
    }

    impl CountingStore {
        pub fn new(inner: Arc<dyn DocumentStore>, delay: Duration) -> Self {
            Self {
                inner,
                find_one_calls: AtomicUsize::new(0),
                delay,
                fail_next: Mutex::new(None),
                fail_next_find: Mutex::new(None),
            }
        }

        pub fn calls(&self) -> usize {
            self.find_one_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DocumentStore for CountingStore {
        async fn find_one(&self, collection: &str, id: &DocId) -> StoreResult<Option<Document>> {
            self.find_one_calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let failure = self.fail_next.lock().unwrap().take();
            if let Some(error) = failure {
                return Err(error);
            }
            self.inner.find_one(collection, id).await
        }

        async fn find(&self, collection: &str, selector: &Selector) -> StoreResult<IdMap<DocId, Document>> {
            let failure = self.fail_next_find.lock().unwrap().take();
            if let Some(error) = failure {
                return Err(error);
            }
            self.inner.find(collection, selector).await
        }

        async fn insert(&self, collection: &str, id: DocId, doc: Document) -> StoreResult<()> {
            self.inner.insert(collection, id, doc).await
        }

        async fn update(&self, collection: &str, id: &DocId, doc: Document) -> StoreResult<()> {
            self.inner.update(collection, id, doc).await
        }

        async fn remove(&self, collection: &str, id: &DocId) -> StoreResult<()> {
            self.inner.remove(collection, id).await
        }

        async fn drop_collection(&self, collection: &str) -> StoreResult<()> {
            self.inner.drop_collection(collection).await
        }
    }
}

//! In-memory document store.
//!
//! Every successful write:
//! 1. begins a write on the current fence (inert outside a fence scope),
//! 2. applies the mutation,
//! 3. fires `{collection, id, seq}` at the crossbar and waits for acks,
//! 4. commits the write handle.
//!
//! Observers hold their acks until they have sent the resulting changes, so
//! when the fence fires every affected client has seen the write.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use live_core::triggers::{COLLECTION_KEY, DROP_COLLECTION_KEY, ID_KEY};
use live_core::{id_value, IdMap, Selector};
use live_types::{DocId, Document, Notification};

use super::DocumentStore;
use crate::crossbar::Crossbar;
use crate::error::{StoreError, StoreResult};
use crate::write_fence::{maybe_begin_write, WriteHandle};

/// Notification key carrying the store's write sequence number.
pub const SEQ_KEY: &str = "seq";

/// Document store held in memory.
pub struct MemoryStore {
    collections: DashMap<String, IdMap<DocId, Document>>,
    crossbar: Crossbar,
    seq: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store that notifies `crossbar` on writes.
    pub fn new(crossbar: Crossbar) -> Self {
        Self {
            collections: DashMap::new(),
            crossbar,
            seq: AtomicU64::new(0),
        }
    }

    /// Sequence number of the latest write.
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Number of documents in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|docs| docs.value().len())
            .unwrap_or(0)
    }

    /// Check whether a collection has no documents.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    fn begin_write(&self, collection: &str) -> StoreResult<WriteHandle> {
        if collection.is_empty() {
            return Err(StoreError::Backend("collection name must not be empty".into()));
        }
        Ok(maybe_begin_write()?)
    }

    async fn finish_write(&self, write: WriteHandle, mut notification: Notification) -> StoreResult<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        notification.insert(SEQ_KEY, seq);
        if let Err(e) = self.crossbar.fire_and_wait(&notification).await {
            tracing::warn!("store: failed to notify {:?}: {}", notification, e);
        }
        write.committed()?;
        Ok(())
    }

    fn document_notification(collection: &str, id: &DocId) -> Notification {
        Notification::new()
            .with(COLLECTION_KEY, collection)
            .with(ID_KEY, id_value(id))
    }

    fn not_found(collection: &str, id: &DocId) -> StoreError {
        StoreError::NotFound {
            collection: collection.to_string(),
            id: id.stringify(),
        }
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("collections", &self.collections.len())
            .field("seq", &self.seq())
            .finish()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_one(&self, collection: &str, id: &DocId) -> StoreResult<Option<Document>> {
        Ok(self
            .collections
            .get(collection)
            .and_then(|docs| docs.value().get(id).cloned()))
    }

    async fn find(&self, collection: &str, selector: &Selector) -> StoreResult<IdMap<DocId, Document>> {
        let Some(docs) = self.collections.get(collection) else {
            return Ok(IdMap::new());
        };
        let docs = docs.value();
        let found = match selector.specific_ids() {
            Some(ids) => ids
                .iter()
                .filter_map(|id| docs.get(id).map(|doc| (id.clone(), doc.clone())))
                .collect(),
            None => docs
                .iter()
                .filter(|(id, doc)| selector.matches(id, doc))
                .map(|(id, doc)| (id, doc.clone()))
                .collect(),
        };
        Ok(found)
    }

    async fn insert(&self, collection: &str, id: DocId, doc: Document) -> StoreResult<()> {
        let write = self.begin_write(collection)?;
        let applied = {
            let mut docs = self.collections.entry(collection.to_string()).or_default();
            if docs.value().has(&id) {
                Err(StoreError::Duplicate {
                    collection: collection.to_string(),
                    id: id.stringify(),
                })
            } else {
                docs.value_mut().set(id.clone(), doc);
                Ok(())
            }
        };
        if let Err(e) = applied {
            write.committed()?;
            return Err(e);
        }
        tracing::debug!("store: inserted {} into {}", id, collection);
        self.finish_write(write, Self::document_notification(collection, &id))
            .await
    }

    async fn update(&self, collection: &str, id: &DocId, doc: Document) -> StoreResult<()> {
        let write = self.begin_write(collection)?;
        let applied = match self.collections.get_mut(collection) {
            Some(mut docs) => match docs.value_mut().get_mut(id) {
                Some(slot) => {
                    *slot = doc;
                    Ok(())
                }
                None => Err(Self::not_found(collection, id)),
            },
            None => Err(Self::not_found(collection, id)),
        };
        if let Err(e) = applied {
            write.committed()?;
            return Err(e);
        }
        tracing::debug!("store: updated {} in {}", id, collection);
        self.finish_write(write, Self::document_notification(collection, id))
            .await
    }

    async fn remove(&self, collection: &str, id: &DocId) -> StoreResult<()> {
        let write = self.begin_write(collection)?;
        let removed = self
            .collections
            .get_mut(collection)
            .and_then(|mut docs| docs.value_mut().remove(id));
        if removed.is_none() {
            write.committed()?;
            return Err(Self::not_found(collection, id));
        }
        tracing::debug!("store: removed {} from {}", id, collection);
        self.finish_write(write, Self::document_notification(collection, id))
            .await
    }

    async fn drop_collection(&self, collection: &str) -> StoreResult<()> {
        let write = self.begin_write(collection)?;
        self.collections.remove(collection);
        tracing::debug!("store: dropped {}", collection);
        let notification = Notification::new()
            .with(COLLECTION_KEY, collection)
            .with(DROP_COLLECTION_KEY, true);
        self.finish_write(write, notification).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crossbar::Ack;
    use crate::write_fence::WriteFence;
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            other => panic!("Expected object, got {:?}", other),
        }
    }

    fn recorder(crossbar: &Crossbar) -> (crate::crossbar::ListenerHandle, Arc<Mutex<Vec<Notification>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = crossbar
            .listen(Notification::new(), move |notification, _ack| {
                sink.lock().unwrap().push(notification.clone());
                Ok(())
            })
            .unwrap();
        (handle, seen)
    }

    #[tokio::test]
    async fn crud_round_trip() {
        let store = MemoryStore::new(Crossbar::new());
        let id = DocId::from("a");

        store.insert("docs", id.clone(), doc(json!({"n": 1}))).await.unwrap();
        assert_eq!(
            store.find_one("docs", &id).await.unwrap(),
            Some(doc(json!({"n": 1})))
        );

        store.update("docs", &id, doc(json!({"n": 2}))).await.unwrap();
        assert_eq!(
            store.find_one("docs", &id).await.unwrap(),
            Some(doc(json!({"n": 2})))
        );

        store.remove("docs", &id).await.unwrap();
        assert_eq!(store.find_one("docs", &id).await.unwrap(), None);
        assert!(store.is_empty("docs"));
        assert_eq!(store.seq(), 3);
    }

    #[tokio::test]
    async fn write_errors() {
        let store = MemoryStore::new(Crossbar::new());
        let id = DocId::from("a");
        store.insert("docs", id.clone(), Document::new()).await.unwrap();

        assert!(matches!(
            store.insert("docs", id.clone(), Document::new()).await,
            Err(StoreError::Duplicate { .. })
        ));
        assert!(matches!(
            store.update("docs", &"b".into(), Document::new()).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.remove("other", &id).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.insert("", id, Document::new()).await,
            Err(StoreError::Backend(_))
        ));
        // Failed writes do not advance the sequence.
        assert_eq!(store.seq(), 1);
    }

    #[tokio::test]
    async fn find_filters_by_selector() {
        let store = MemoryStore::new(Crossbar::new());
        store.insert("docs", "a".into(), doc(json!({"owner": "x"}))).await.unwrap();
        store.insert("docs", "b".into(), doc(json!({"owner": "y"}))).await.unwrap();
        store.insert("docs", "c".into(), doc(json!({"owner": "x"}))).await.unwrap();

        let all = store.find("docs", &Selector::All).await.unwrap();
        assert_eq!(all.len(), 3);

        let owned = store
            .find("docs", &Selector::Fields(doc(json!({"owner": "x"}))))
            .await
            .unwrap();
        assert_eq!(owned.len(), 2);
        assert!(owned.has(&"a".into()) && owned.has(&"c".into()));

        let by_id = store
            .find("docs", &Selector::Ids(vec!["b".into(), "zzz".into()]))
            .await
            .unwrap();
        assert_eq!(by_id.len(), 1);

        assert!(store.find("missing", &Selector::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn writes_fire_notifications_with_sequence() {
        let crossbar = Crossbar::new();
        let (_handle, seen) = recorder(&crossbar);
        let store = MemoryStore::new(crossbar);

        store.insert("docs", "a".into(), Document::new()).await.unwrap();
        store.drop_collection("docs").await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen[0],
            Notification::new()
                .with("collection", "docs")
                .with("id", "a")
                .with("seq", 1)
        );
        assert_eq!(
            seen[1],
            Notification::new()
                .with("collection", "docs")
                .with("dropCollection", true)
                .with("seq", 2)
        );
    }

    #[tokio::test]
    async fn fenced_write_commits_after_listener_acks() {
        let crossbar = Crossbar::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Ack>();
        let _handle = crossbar
            .listen(Notification::new().with("collection", "docs"), move |_, ack| {
                tx.send(ack).map_err(|_| anyhow::anyhow!("receiver gone"))
            })
            .unwrap();
        let store = Arc::new(MemoryStore::new(crossbar));

        let fence = WriteFence::new();
        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(WriteFence::scope(fence.clone(), async move {
                store.insert("docs", "a".into(), Document::new()).await
            }))
        };

        let ack = rx.recv().await.unwrap();
        assert_eq!(fence.outstanding_writes(), 1);

        let waiter = {
            let fence = fence.clone();
            tokio::spawn(async move { fence.arm_and_wait().await })
        };
        tokio::task::yield_now().await;
        assert!(!fence.is_fired());

        ack.ack();
        writer.await.unwrap().unwrap();
        waiter.await.unwrap().unwrap();
        assert!(fence.is_fired());
    }
}

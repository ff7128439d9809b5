//! Which crossbar triggers a query listens on.
//!
//! A write to document `id` in `collection` fires `{collection, id, ..}`.
//! A query that names its ids listens on exactly those ids; any other query
//! listens on the whole collection. Every query also listens for collection
//! and database drops.

use serde_json::Value;

use live_types::{DocId, Document, Trigger};

/// Trigger key naming the collection.
pub const COLLECTION_KEY: &str = "collection";
/// Trigger key naming the document.
pub const ID_KEY: &str = "id";
/// Trigger key set when a whole collection is dropped.
pub const DROP_COLLECTION_KEY: &str = "dropCollection";
/// Trigger key set when the whole database is dropped.
pub const DROP_DATABASE_KEY: &str = "dropDatabase";

/// The document filter of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// Every document in the collection.
    All,
    /// Exactly these ids.
    Ids(Vec<DocId>),
    /// Documents whose fields equal all of these.
    Fields(Document),
}

impl Selector {
    /// Selector for a single id.
    pub fn id(id: impl Into<DocId>) -> Self {
        Selector::Ids(vec![id.into()])
    }

    /// Check whether the document `doc` with id `id` is selected.
    pub fn matches(&self, id: &DocId, doc: &Document) -> bool {
        match self {
            Selector::All => true,
            Selector::Ids(ids) => ids.contains(id),
            Selector::Fields(wanted) => wanted.iter().all(|(key, value)| doc.get(key) == Some(value)),
        }
    }

    /// The ids this selector is limited to, if it names them.
    pub fn specific_ids(&self) -> Option<&[DocId]> {
        match self {
            Selector::Ids(ids) => Some(ids),
            _ => None,
        }
    }
}

/// A query: a collection plus a selector.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorDescription {
    /// Collection name.
    pub collection: String,
    /// Document filter.
    pub selector: Selector,
}

impl CursorDescription {
    /// Describe a query.
    pub fn new(collection: impl Into<String>, selector: Selector) -> Self {
        Self {
            collection: collection.into(),
            selector,
        }
    }

    /// Visit every trigger a listener for this query must register.
    pub fn for_each_trigger<F>(&self, mut visit: F)
    where
        F: FnMut(Trigger),
    {
        let base = Trigger::new().with(COLLECTION_KEY, self.collection.as_str());
        match self.selector.specific_ids() {
            Some(ids) => {
                for id in ids {
                    visit(base.clone().with(ID_KEY, id_value(id)));
                }
                visit(base.with(DROP_COLLECTION_KEY, true));
            }
            None => visit(base),
        }
        visit(Trigger::new().with(DROP_DATABASE_KEY, true));
    }

    /// Key shared by every description that selects the same documents.
    ///
    /// Id lists are compared as sets; field selectors by their (sorted) JSON
    /// form.
    pub fn observe_key(&self) -> String {
        let selector = match &self.selector {
            Selector::All => "*".to_string(),
            Selector::Ids(ids) => {
                let mut ids: Vec<String> = ids.iter().map(DocId::stringify).collect();
                ids.sort();
                ids.dedup();
                format!("ids:{}", Value::from(ids))
            }
            Selector::Fields(fields) => format!("fields:{}", Value::Object(fields.clone())),
        };
        format!("{}|{}", Value::from(self.collection.as_str()), selector)
    }

    /// Collect the triggers from [`CursorDescription::for_each_trigger`].
    pub fn triggers(&self) -> Vec<Trigger> {
        let mut triggers = Vec::new();
        self.for_each_trigger(|trigger| triggers.push(trigger));
        triggers
    }
}

/// Trigger value for a document id.
///
/// Ids are compared in their stringified form, so structurally equal ids
/// always match.
pub fn id_value(id: &DocId) -> Value {
    Value::String(id.stringify())
}

//! Add/change/remove events between two result snapshots.

use serde_json::Value;

use crate::cow_id_map::{CowChange, CowIdMap};
use crate::id_map::IdMap;
use live_types::{DocId, Document};

/// A change to a subscription's result set.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// The document entered the result set.
    Added {
        /// Document id.
        id: DocId,
        /// All fields of the document.
        fields: Document,
    },
    /// The document changed.
    Changed {
        /// Document id.
        id: DocId,
        /// Changed fields only; a removed field is `null`.
        fields: Document,
    },
    /// The document left the result set.
    Removed {
        /// Document id.
        id: DocId,
    },
}

impl ChangeEvent {
    /// Id of the affected document.
    pub fn id(&self) -> &DocId {
        match self {
            ChangeEvent::Added { id, .. }
            | ChangeEvent::Changed { id, .. }
            | ChangeEvent::Removed { id } => id,
        }
    }
}

/// Field-level delta turning `old` into `new`.
pub fn make_changed_fields(new: &Document, old: &Document) -> Document {
    let mut fields = Document::new();
    for (key, value) in new {
        if old.get(key) != Some(value) {
            fields.insert(key.clone(), value.clone());
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            fields.insert(key.clone(), Value::Null);
        }
    }
    fields
}

/// Events turning the `old` result set into the `new` one.
///
/// Documents present in both but structurally equal produce nothing.
pub fn diff_query_changes(
    old: &IdMap<DocId, Document>,
    new: &IdMap<DocId, Document>,
) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    for (id, new_doc) in new.iter() {
        match old.get(&id) {
            Some(old_doc) => push_changed(&mut events, id, new_doc, old_doc),
            None => events.push(ChangeEvent::Added {
                id,
                fields: new_doc.clone(),
            }),
        }
    }
    for (id, _) in old.iter() {
        if !new.has(&id) {
            events.push(ChangeEvent::Removed { id });
        }
    }
    events
}

/// Events for the delta staged in a copy-on-write layer.
pub fn cow_change_events(cow: &CowIdMap<'_, DocId, Document>) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    cow.diff_query_changes(|change| match change {
        CowChange::Added { id, value } => events.push(ChangeEvent::Added {
            id,
            fields: value.clone(),
        }),
        CowChange::Changed { id, value, old } => push_changed(&mut events, id, value, old),
        CowChange::Removed { id, .. } => events.push(ChangeEvent::Removed { id }),
    });
    events
}

fn push_changed(events: &mut Vec<ChangeEvent>, id: DocId, new: &Document, old: &Document) {
    if new == old {
        return;
    }
    let fields = make_changed_fields(new, old);
    if !fields.is_empty() {
        events.push(ChangeEvent::Changed { id, fields });
    }
}

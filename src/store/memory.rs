//! In-process document store with a live change feed.

use super::{ChangeFeed, DocumentStore, FeedEvent, Pipeline};
use crate::error::{LiveError, Result};
use crate::types::{
    Document, DocumentId, DocumentKey, OperationType, RawChange, UpdateDescription, ID_FIELD,
};
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Documents of one collection in insertion order.
#[derive(Default)]
struct CollectionData {
    docs: BTreeMap<u64, Document>,
    positions: HashMap<DocumentId, u64>,
    next_position: u64,
}

impl CollectionData {
    fn get(&self, id: &DocumentId) -> Option<&Document> {
        self.positions.get(id).and_then(|pos| self.docs.get(pos))
    }

    fn push(&mut self, doc: Document) {
        let pos = self.next_position;
        self.next_position += 1;
        self.positions.insert(doc.id().clone(), pos);
        self.docs.insert(pos, doc);
    }

    /// Overwrite in place, keeping the natural position.
    fn put(&mut self, doc: Document) -> bool {
        match self.positions.get(doc.id()) {
            Some(pos) => {
                self.docs.insert(*pos, doc);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, id: &DocumentId) -> Option<Document> {
        let pos = self.positions.remove(id)?;
        self.docs.remove(&pos)
    }
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, CollectionData>,
    watchers: HashMap<String, Vec<Sender<FeedEvent>>>,
}

/// An in-memory [`DocumentStore`].
///
/// Writes publish change events to every open feed on the collection while
/// the write lock is held, so feeds observe writes in commit order.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    next_event_id: AtomicU64,
    feeds_opened: AtomicU64,
    open_feeds: Arc<AtomicUsize>,
    /// Collections whose aggregations fail with the given message.
    failing_aggregations: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_event_id: AtomicU64::new(1),
            feeds_opened: AtomicU64::new(0),
            open_feeds: Arc::new(AtomicUsize::new(0)),
            failing_aggregations: Mutex::new(HashMap::new()),
        }
    }

    // --- Writes ---

    /// Insert a new document.
    pub fn insert(&self, collection: &str, doc: Document) -> Result<()> {
        let mut inner = self.inner.write();
        let data = inner.collections.entry(collection.to_string()).or_default();
        if data.get(doc.id()).is_some() {
            return Err(LiveError::DocumentExists(doc.id().to_string()));
        }
        data.push(doc.clone());

        let change = self.change(OperationType::Insert, Some(doc.id().clone()), None, Some(doc));
        Self::publish(&mut inner, collection, change);
        Ok(())
    }

    /// Apply a patch to an existing document and return the new version.
    ///
    /// `patch` is either `{"$set": {...}, "$unset": [...]}` or a plain object
    /// treated as `$set`. Paths may be dotted.
    pub fn update(&self, collection: &str, id: &DocumentId, patch: Value) -> Result<Document> {
        let description = parse_patch(patch)?;

        let mut inner = self.inner.write();
        let data = inner
            .collections
            .get_mut(collection)
            .ok_or_else(|| LiveError::CollectionNotFound(collection.to_string()))?;
        let current = data
            .get(id)
            .ok_or_else(|| LiveError::DocumentNotFound(id.to_string()))?;

        let mut body = current.body().clone();
        for (path, value) in &description.updated_fields {
            set_path(&mut body, path, value.clone());
        }
        for path in &description.removed_fields {
            unset_path(&mut body, path);
        }
        let updated = Document::new(id.clone(), Value::Object(body));
        data.put(updated.clone());

        let change = self.change(
            OperationType::Update,
            Some(id.clone()),
            Some(description),
            Some(updated.clone()),
        );
        Self::publish(&mut inner, collection, change);
        Ok(updated)
    }

    /// Replace an existing document wholesale.
    pub fn replace(&self, collection: &str, doc: Document) -> Result<()> {
        let mut inner = self.inner.write();
        let data = inner
            .collections
            .get_mut(collection)
            .ok_or_else(|| LiveError::CollectionNotFound(collection.to_string()))?;
        if !data.put(doc.clone()) {
            return Err(LiveError::DocumentNotFound(doc.id().to_string()));
        }

        let change = self.change(OperationType::Replace, Some(doc.id().clone()), None, Some(doc));
        Self::publish(&mut inner, collection, change);
        Ok(())
    }

    /// Delete a document. Returns whether it existed.
    pub fn delete(&self, collection: &str, id: &DocumentId) -> Result<bool> {
        let mut inner = self.inner.write();
        let removed = inner
            .collections
            .get_mut(collection)
            .and_then(|data| data.remove(id))
            .is_some();
        if removed {
            let change = self.change(OperationType::Delete, Some(id.clone()), None, None);
            Self::publish(&mut inner, collection, change);
        }
        Ok(removed)
    }

    /// Drop a collection. Returns whether it existed.
    pub fn drop_collection(&self, collection: &str) -> bool {
        let mut inner = self.inner.write();
        let existed = inner.collections.remove(collection).is_some();
        let change = self.change(OperationType::Drop, None, None, None);
        Self::publish(&mut inner, collection, change);
        existed
    }

    // --- Reads ---

    pub fn get(&self, collection: &str, id: &DocumentId) -> Option<Document> {
        self.inner
            .read()
            .collections
            .get(collection)
            .and_then(|data| data.get(id).cloned())
    }

    pub fn len(&self, collection: &str) -> usize {
        self.inner
            .read()
            .collections
            .get(collection)
            .map_or(0, |data| data.docs.len())
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    // --- Feed control ---

    /// Publish a raw change as-is on every open feed of `collection`.
    pub fn emit_change(&self, collection: &str, change: RawChange) {
        let mut inner = self.inner.write();
        Self::publish(&mut inner, collection, change);
    }

    /// Fail every open feed on `collection` and close it.
    pub fn fail_feeds(&self, collection: &str, message: &str) {
        let mut inner = self.inner.write();
        if let Some(watchers) = inner.watchers.remove(collection) {
            for sender in watchers {
                let _ = sender.send(FeedEvent::Error(message.to_string()));
            }
        }
    }

    /// Make aggregations on `collection` fail (`None` restores them).
    pub fn fail_aggregations(&self, collection: &str, message: Option<&str>) {
        let mut failing = self.failing_aggregations.lock();
        match message {
            Some(msg) => {
                failing.insert(collection.to_string(), msg.to_string());
            }
            None => {
                failing.remove(collection);
            }
        }
    }

    /// Total number of feeds ever opened.
    pub fn feeds_opened(&self) -> u64 {
        self.feeds_opened.load(Ordering::SeqCst)
    }

    /// Number of feeds currently open.
    pub fn open_feeds(&self) -> usize {
        self.open_feeds.load(Ordering::SeqCst)
    }

    fn change(
        &self,
        operation_type: OperationType,
        id: Option<DocumentId>,
        update_description: Option<UpdateDescription>,
        full_document: Option<Document>,
    ) -> RawChange {
        RawChange {
            id: self.next_event_id.fetch_add(1, Ordering::SeqCst),
            operation_type,
            document_key: id.map(|id| DocumentKey { id }),
            update_description,
            full_document,
        }
    }

    fn publish(inner: &mut Inner, collection: &str, change: RawChange) {
        let Some(watchers) = inner.watchers.get_mut(collection) else {
            return;
        };
        trace!(
            collection,
            op = ?change.operation_type,
            watchers = watchers.len(),
            "publishing change"
        );
        watchers.retain(|sender| sender.send(FeedEvent::Change(change.clone())).is_ok());
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for MemoryStore {
    fn aggregate(&self, collection: &str, pipeline: &Pipeline) -> Result<Vec<Document>> {
        if let Some(msg) = self.failing_aggregations.lock().get(collection) {
            return Err(LiveError::Store(msg.clone()));
        }
        let inner = self.inner.read();
        Ok(match inner.collections.get(collection) {
            Some(data) => pipeline.run(data.docs.values()),
            None => Vec::new(),
        })
    }

    fn watch(&self, collection: &str) -> Result<ChangeFeed> {
        let (sender, feed) = ChangeFeed::channel(collection);
        self.inner
            .write()
            .watchers
            .entry(collection.to_string())
            .or_default()
            .push(sender);

        self.feeds_opened.fetch_add(1, Ordering::SeqCst);
        self.open_feeds.fetch_add(1, Ordering::SeqCst);
        debug!(collection, "change feed opened");

        let open = Arc::clone(&self.open_feeds);
        Ok(feed.on_close(move || {
            open.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}

fn parse_patch(patch: Value) -> Result<UpdateDescription> {
    let Value::Object(map) = patch else {
        return Err(LiveError::InvalidOptions(
            "update patch must be an object".to_string(),
        ));
    };

    let mut description = UpdateDescription::default();
    if !map.keys().any(|k| k.starts_with('$')) {
        description.updated_fields = map;
    } else {
        for (op, arg) in map {
            match (op.as_str(), arg) {
                ("$set", Value::Object(fields)) => description.updated_fields.extend(fields),
                ("$unset", Value::Object(fields)) => {
                    description.removed_fields.extend(fields.into_iter().map(|(k, _)| k))
                }
                ("$unset", Value::Array(fields)) => {
                    for field in fields {
                        match field {
                            Value::String(s) => description.removed_fields.push(s),
                            other => {
                                return Err(LiveError::InvalidOptions(format!(
                                    "$unset expects field names, got {}",
                                    other
                                )))
                            }
                        }
                    }
                }
                (other, _) => {
                    return Err(LiveError::InvalidOptions(format!(
                        "unsupported update operator {}",
                        other
                    )))
                }
            }
        }
    }

    let touches_id = description
        .touched_paths()
        .any(|p| p == ID_FIELD || p.starts_with("_id."));
    if touches_id {
        return Err(LiveError::InvalidOptions(
            "the _id field cannot be modified".to_string(),
        ));
    }
    Ok(description)
}

fn set_path(body: &mut Map<String, Value>, path: &str, value: Value) {
    let mut parts: Vec<&str> = path.split('.').collect();
    let Some(last) = parts.pop() else {
        return;
    };
    let mut cur = body;
    for part in parts {
        let entry = cur
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        cur = next;
    }
    cur.insert(last.to_string(), value);
}

fn unset_path(body: &mut Map<String, Value>, path: &str) {
    let mut parts: Vec<&str> = path.split('.').collect();
    let Some(last) = parts.pop() else {
        return;
    };
    let mut cur = body;
    for part in parts {
        match cur.get_mut(part) {
            Some(Value::Object(next)) => cur = next,
            _ => return,
        }
    }
    cur.remove(last);
}

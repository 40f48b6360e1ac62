//! In-process signaling store
//!
//! Holds every document in a single `parking_lot::Mutex`; each operation
//! takes the lock once, so writes are atomic and their change events are
//! queued to subscribers in write order. Faults can be injected per
//! operation to simulate network or permission failures.

use crate::{
    ChangeKind, CollectionPath, Document, DocumentChange, DocumentPath, FieldFilter, Fields,
    SignalingStore, StoreError, StoreResult, Subscription,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Store operation names, used for fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    Create,
    Insert,
    Set,
    Update,
    Delete,
    Get,
    List,
    ArrayUnion,
    ArrayRemove,
    Subscribe,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreOperation::Create => "create",
            StoreOperation::Insert => "insert",
            StoreOperation::Set => "set",
            StoreOperation::Update => "update",
            StoreOperation::Delete => "delete",
            StoreOperation::Get => "get",
            StoreOperation::List => "list",
            StoreOperation::ArrayUnion => "array_union",
            StoreOperation::ArrayRemove => "array_remove",
            StoreOperation::Subscribe => "subscribe",
        };
        f.write_str(name)
    }
}

enum WatchTarget {
    Collection(CollectionPath),
    Document(DocumentPath),
}

struct Watcher {
    id: u64,
    target: WatchTarget,
    tx: mpsc::UnboundedSender<DocumentChange>,
}

struct Fault {
    operation: StoreOperation,
    path_fragment: Option<String>,
    remaining: usize,
}

#[derive(Default)]
struct Inner {
    /// Documents per collection, in insertion order
    collections: HashMap<CollectionPath, Vec<(String, Fields)>>,
    watchers: Vec<Watcher>,
    next_watcher_id: u64,
    faults: Vec<Fault>,
}

impl Inner {
    fn check_fault(&mut self, operation: StoreOperation, path: &str) -> StoreResult<()> {
        let position = self.faults.iter().position(|fault| {
            fault.operation == operation
                && fault
                    .path_fragment
                    .as_deref()
                    .map_or(true, |fragment| path.contains(fragment))
        });

        if let Some(index) = position {
            self.faults[index].remaining -= 1;
            if self.faults[index].remaining == 0 {
                self.faults.remove(index);
            }
            debug!("Injected {} failure at {}", operation, path);
            return Err(StoreError::Unavailable(format!(
                "injected {} failure at {}",
                operation, path
            )));
        }

        Ok(())
    }

    fn find(&self, path: &DocumentPath) -> Option<&Fields> {
        self.collections
            .get(&path.parent())?
            .iter()
            .find(|(id, _)| id == path.id())
            .map(|(_, fields)| fields)
    }

    fn find_mut(&mut self, path: &DocumentPath) -> Option<&mut Fields> {
        self.collections
            .get_mut(&path.parent())?
            .iter_mut()
            .find(|(id, _)| id == path.id())
            .map(|(_, fields)| fields)
    }

    /// Insert or replace, returning the change kind
    fn put(&mut self, path: &DocumentPath, fields: Fields) -> ChangeKind {
        if let Some(existing) = self.find_mut(path) {
            *existing = fields;
            return ChangeKind::Modified;
        }
        self.collections
            .entry(path.parent())
            .or_default()
            .push((path.id().to_string(), fields));
        ChangeKind::Added
    }

    fn remove(&mut self, path: &DocumentPath) -> Option<Fields> {
        let docs = self.collections.get_mut(&path.parent())?;
        let index = docs.iter().position(|(id, _)| id == path.id())?;
        Some(docs.remove(index).1)
    }

    fn notify(&mut self, kind: ChangeKind, path: &DocumentPath, fields: Fields) {
        let parent = path.parent();
        let change = DocumentChange {
            kind,
            doc: Document {
                path: path.clone(),
                fields,
            },
        };

        self.watchers.retain(|watcher| {
            let interested = match &watcher.target {
                WatchTarget::Collection(collection) => *collection == parent,
                WatchTarget::Document(doc) => doc == path,
            };
            // A closed receiver means the subscriber is gone
            !interested || watcher.tx.send(change.clone()).is_ok()
        });
    }

    fn snapshot(&self, collection: &CollectionPath) -> Vec<Document> {
        self.collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, fields)| Document {
                        path: collection.doc(id),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Cloneable handle to a shared in-memory document tree
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `operation` with `Unavailable`
    pub fn fail_next(&self, operation: StoreOperation, times: usize) {
        self.push_fault(operation, None, times);
    }

    /// Fail the next `times` calls of `operation` whose path contains `path_fragment`
    pub fn fail_matching(&self, operation: StoreOperation, path_fragment: &str, times: usize) {
        self.push_fault(operation, Some(path_fragment.to_string()), times);
    }

    pub fn clear_faults(&self) {
        self.inner.lock().faults.clear();
    }

    fn push_fault(&self, operation: StoreOperation, path_fragment: Option<String>, times: usize) {
        if times == 0 {
            return;
        }
        self.inner.lock().faults.push(Fault {
            operation,
            path_fragment,
            remaining: times,
        });
    }

    /// Number of live subscriptions
    pub fn watcher_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.watchers.retain(|watcher| !watcher.tx.is_closed());
        inner.watchers.len()
    }

    /// Every document path currently stored below `collection`, at any depth
    pub fn paths_under(&self, collection: &CollectionPath) -> Vec<DocumentPath> {
        let inner = self.inner.lock();
        let mut paths: Vec<DocumentPath> = inner
            .collections
            .iter()
            .filter(|(path, _)| {
                *path == collection
                    || path
                        .parent()
                        .is_some_and(|parent| parent.is_descendant_of(collection))
            })
            .flat_map(|(path, docs)| docs.iter().map(move |(id, _)| path.doc(id)))
            .collect();
        paths.sort();
        paths
    }

    fn subscribe(
        &self,
        target: WatchTarget,
        initial: impl FnOnce(&Inner) -> Vec<Document>,
        check_path: &str,
    ) -> StoreResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.check_fault(StoreOperation::Subscribe, check_path)?;

        for doc in initial(&*inner) {
            // Receiver is held locally, send cannot fail yet
            let _ = tx.send(DocumentChange {
                kind: ChangeKind::Added,
                doc,
            });
        }

        let id = inner.next_watcher_id;
        inner.next_watcher_id += 1;
        inner.watchers.push(Watcher { id, target, tx });
        trace!("Subscription {} registered on {}", id, check_path);

        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        Ok(Subscription::new(rx, move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().watchers.retain(|watcher| watcher.id != id);
            }
        }))
    }
}

/// Apply `update` to an array field, creating or replacing it when it is
/// missing or not an array; returns whatever `update` reports
fn update_array<F>(fields: &mut Fields, field: &str, update: F) -> bool
where
    F: FnOnce(&mut Vec<Value>) -> bool,
{
    let mut items = match fields.remove(field) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };
    let changed = update(&mut items);
    fields.insert(field.to_string(), Value::Array(items));
    changed
}

#[async_trait]
impl SignalingStore for InMemoryStore {
    async fn create_document(
        &self,
        collection: &CollectionPath,
        fields: Fields,
    ) -> StoreResult<DocumentPath> {
        collection.validate()?;
        let path = collection.doc(&uuid::Uuid::new_v4().simple().to_string());

        let mut inner = self.inner.lock();
        inner.check_fault(StoreOperation::Create, path.as_str())?;
        inner.put(&path, fields.clone());
        inner.notify(ChangeKind::Added, &path, fields);
        Ok(path)
    }

    async fn insert_document(&self, path: &DocumentPath, fields: Fields) -> StoreResult<()> {
        path.validate()?;
        let mut inner = self.inner.lock();
        inner.check_fault(StoreOperation::Insert, path.as_str())?;
        if inner.find(path).is_some() {
            return Err(StoreError::AlreadyExists(path.to_string()));
        }
        inner.put(path, fields.clone());
        inner.notify(ChangeKind::Added, path, fields);
        Ok(())
    }

    async fn set_document(&self, path: &DocumentPath, fields: Fields) -> StoreResult<()> {
        path.validate()?;
        let mut inner = self.inner.lock();
        inner.check_fault(StoreOperation::Set, path.as_str())?;
        let kind = inner.put(path, fields.clone());
        inner.notify(kind, path, fields);
        Ok(())
    }

    async fn update_document(&self, path: &DocumentPath, fields: Fields) -> StoreResult<()> {
        path.validate()?;
        let mut inner = self.inner.lock();
        inner.check_fault(StoreOperation::Update, path.as_str())?;
        let existing = inner
            .find_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        existing.extend(fields);
        let merged = existing.clone();
        inner.notify(ChangeKind::Modified, path, merged);
        Ok(())
    }

    async fn delete_document(&self, path: &DocumentPath) -> StoreResult<()> {
        path.validate()?;
        let mut inner = self.inner.lock();
        inner.check_fault(StoreOperation::Delete, path.as_str())?;
        if let Some(fields) = inner.remove(path) {
            inner.notify(ChangeKind::Removed, path, fields);
        }
        Ok(())
    }

    async fn get_document(&self, path: &DocumentPath) -> StoreResult<Option<Document>> {
        path.validate()?;
        let mut inner = self.inner.lock();
        inner.check_fault(StoreOperation::Get, path.as_str())?;
        Ok(inner.find(path).map(|fields| Document {
            path: path.clone(),
            fields: fields.clone(),
        }))
    }

    async fn list_documents(
        &self,
        collection: &CollectionPath,
        filter: Option<&FieldFilter>,
    ) -> StoreResult<Vec<Document>> {
        collection.validate()?;
        let mut inner = self.inner.lock();
        inner.check_fault(StoreOperation::List, collection.as_str())?;
        Ok(inner
            .snapshot(collection)
            .into_iter()
            .filter(|doc| filter.map_or(true, |f| f.matches(&doc.fields)))
            .collect())
    }

    async fn array_union(&self, path: &DocumentPath, field: &str, value: Value) -> StoreResult<()> {
        path.validate()?;
        let mut inner = self.inner.lock();
        inner.check_fault(StoreOperation::ArrayUnion, path.as_str())?;
        let fields = inner
            .find_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        let added = update_array(fields, field, |items| {
            if items.contains(&value) {
                return false;
            }
            items.push(value);
            true
        });
        if !added {
            return Ok(());
        }
        let snapshot = fields.clone();
        inner.notify(ChangeKind::Modified, path, snapshot);
        Ok(())
    }

    async fn array_remove(
        &self,
        path: &DocumentPath,
        field: &str,
        value: Value,
    ) -> StoreResult<()> {
        path.validate()?;
        let mut inner = self.inner.lock();
        inner.check_fault(StoreOperation::ArrayRemove, path.as_str())?;
        let fields = inner
            .find_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        let removed = update_array(fields, field, |items| {
            let before = items.len();
            items.retain(|item| *item != value);
            items.len() != before
        });
        if !removed {
            return Ok(());
        }
        let snapshot = fields.clone();
        inner.notify(ChangeKind::Modified, path, snapshot);
        Ok(())
    }

    async fn subscribe_collection(&self, collection: &CollectionPath) -> StoreResult<Subscription> {
        collection.validate()?;
        let target = collection.clone();
        self.subscribe(
            WatchTarget::Collection(collection.clone()),
            move |inner| inner.snapshot(&target),
            collection.as_str(),
        )
    }

    async fn subscribe_document(&self, path: &DocumentPath) -> StoreResult<Subscription> {
        path.validate()?;
        let target = path.clone();
        self.subscribe(
            WatchTarget::Document(path.clone()),
            move |inner| {
                inner
                    .find(&target)
                    .map(|fields| {
                        vec![Document {
                            path: target.clone(),
                            fields: fields.clone(),
                        }]
                    })
                    .unwrap_or_default()
            },
            path.as_str(),
        )
    }
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("InMemoryStore")
            .field("collections", &inner.collections.len())
            .field("watchers", &inner.watchers.len())
            .finish()
    }
}

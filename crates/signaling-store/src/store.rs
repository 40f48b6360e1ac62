//! Store contract and change subscriptions

use crate::{CollectionPath, Document, DocumentChange, DocumentPath, FieldFilter, Fields, StoreResult};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Shared document store with real-time change notification
///
/// Every operation is a suspension point. Implementations must apply each
/// write atomically and deliver its change to subscribers in write order.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    /// Create a document with a store-generated id
    async fn create_document(
        &self,
        collection: &CollectionPath,
        fields: Fields,
    ) -> StoreResult<DocumentPath>;

    /// Create a document at `path`, failing with `AlreadyExists` if taken
    async fn insert_document(&self, path: &DocumentPath, fields: Fields) -> StoreResult<()>;

    /// Create or overwrite a document
    async fn set_document(&self, path: &DocumentPath, fields: Fields) -> StoreResult<()>;

    /// Merge fields into an existing document
    async fn update_document(&self, path: &DocumentPath, fields: Fields) -> StoreResult<()>;

    /// Delete a document; missing documents are not an error
    async fn delete_document(&self, path: &DocumentPath) -> StoreResult<()>;

    async fn get_document(&self, path: &DocumentPath) -> StoreResult<Option<Document>>;

    /// List a collection in insertion order, optionally filtered
    async fn list_documents(
        &self,
        collection: &CollectionPath,
        filter: Option<&FieldFilter>,
    ) -> StoreResult<Vec<Document>>;

    /// Atomically add `value` to an array field unless already present
    async fn array_union(&self, path: &DocumentPath, field: &str, value: Value) -> StoreResult<()>;

    /// Atomically remove every element equal to `value` from an array field
    async fn array_remove(&self, path: &DocumentPath, field: &str, value: Value)
        -> StoreResult<()>;

    /// Watch a collection; current documents are replayed as `Added`
    async fn subscribe_collection(&self, collection: &CollectionPath) -> StoreResult<Subscription>;

    /// Watch a single document; the current snapshot is replayed as `Added`
    async fn subscribe_document(&self, path: &DocumentPath) -> StoreResult<Subscription>;
}

/// Live change feed; dropping it unsubscribes
pub struct Subscription {
    changes: mpsc::UnboundedReceiver<DocumentChange>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        changes: mpsc::UnboundedReceiver<DocumentChange>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            changes,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Next change, `None` once the store side has gone away
    pub async fn next(&mut self) -> Option<DocumentChange> {
        self.changes.recv().await
    }

    /// Next already-delivered change without waiting
    pub fn try_next(&mut self) -> Option<DocumentChange> {
        self.changes.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

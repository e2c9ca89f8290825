//! Backing-store seam and in-memory implementation.
//!
//! The backing store is the durability source of truth. The coordinator
//! consumes it through this narrow contract; the relational implementation
//! lives elsewhere. The in-memory implementation here backs tests and
//! single-process embeddings.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use jotstore_core::{Document, DocumentKey, JotError, JotResult};
use tokio::sync::RwLock;

/// Durable load/store/list/remove of documents by composite key.
///
/// Implementations must be thread-safe; the coordinator calls them from
/// caller tasks and from the background flush task concurrently.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Load a document, failing with [`JotError::NotFound`] if absent.
    async fn load(&self, key: &DocumentKey) -> JotResult<Document>;

    /// Load a document, returning `None` if absent.
    async fn opt(&self, key: &DocumentKey) -> JotResult<Option<Document>>;

    /// Persist a single document under the given key.
    async fn store(&self, key: &DocumentKey, doc: &Document) -> JotResult<()>;

    /// Persist a batch of documents in one round-trip.
    async fn store_multiple(&self, docs: &HashMap<DocumentKey, Document>) -> JotResult<()>;

    /// Load a batch of documents. The result matches the order of `keys`;
    /// absent keys map to `None`.
    async fn list(&self, keys: &[DocumentKey]) -> JotResult<Vec<Option<Document>>>;

    /// Delete a document, returning it if the store can supply it.
    async fn remove(&self, key: &DocumentKey) -> JotResult<Option<Document>>;

    /// List the local ids stored under the partial key's
    /// `(service, owner, scope)` namespace.
    async fn list_ids(&self, partial: &DocumentKey) -> JotResult<Vec<String>>;
}

/// In-memory backing store.
///
/// Clones share the same underlying map, so tests can keep a handle for
/// inspection while the coordinator owns another.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackingStore {
    documents: Arc<RwLock<HashMap<DocumentKey, Document>>>,
}

impl InMemoryBackingStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted documents.
    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    /// True if nothing has been persisted.
    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl BackingStore for InMemoryBackingStore {
    async fn load(&self, key: &DocumentKey) -> JotResult<Document> {
        self.opt(key)
            .await?
            .ok_or_else(|| JotError::not_found(key))
    }

    async fn opt(&self, key: &DocumentKey) -> JotResult<Option<Document>> {
        Ok(self.documents.read().await.get(key).cloned())
    }

    async fn store(&self, key: &DocumentKey, doc: &Document) -> JotResult<()> {
        let stamped = doc.clone().with_key(key.clone());
        self.documents.write().await.insert(key.clone(), stamped);
        Ok(())
    }

    async fn store_multiple(&self, docs: &HashMap<DocumentKey, Document>) -> JotResult<()> {
        let mut documents = self.documents.write().await;
        for (key, doc) in docs {
            let stamped = doc.clone().with_key(key.clone());
            documents.insert(key.clone(), stamped);
        }
        Ok(())
    }

    async fn list(&self, keys: &[DocumentKey]) -> JotResult<Vec<Option<Document>>> {
        let documents = self.documents.read().await;
        Ok(keys.iter().map(|key| documents.get(key).cloned()).collect())
    }

    async fn remove(&self, key: &DocumentKey) -> JotResult<Option<Document>> {
        Ok(self.documents.write().await.remove(key))
    }

    async fn list_ids(&self, partial: &DocumentKey) -> JotResult<Vec<String>> {
        let documents = self.documents.read().await;
        let mut ids: Vec<String> = documents
            .keys()
            .filter(|key| {
                key.service_id() == partial.service_id()
                    && key.matches_owner(partial.owner_id(), partial.scope_id())
            })
            .map(|key| key.local_id().to_string())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

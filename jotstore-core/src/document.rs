//! Documents and cache entries.
//!
//! A [`Document`] is the value unit the cache engine hands to callers:
//! an opaque JSON payload plus the key it was last persisted under.
//! Documents are exchanged by value; every document a caller receives is
//! a defensive copy, so callers mutate their copy freely without touching
//! cached or queued state.

use crate::key::DocumentKey;
use serde::{Deserialize, Serialize};

/// A versioned document payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// The key this document was last persisted under, if any.
    key: Option<DocumentKey>,
    /// The opaque payload.
    content: serde_json::Value,
}

impl Document {
    /// Create a document that has not been persisted yet.
    pub fn new(content: serde_json::Value) -> Self {
        Self { key: None, content }
    }

    /// The key this document was last persisted under.
    pub fn key(&self) -> Option<&DocumentKey> {
        self.key.as_ref()
    }

    /// The document payload.
    pub fn content(&self) -> &serde_json::Value {
        &self.content
    }

    /// Consume the document, yielding its payload.
    pub fn into_content(self) -> serde_json::Value {
        self.content
    }

    /// This document stamped with the key it is being persisted under.
    pub fn with_key(mut self, key: DocumentKey) -> Self {
        self.key = Some(key);
        self
    }
}

/// What the cache fabric holds for a key.
///
/// `Absent` is a cached negative result: the backing store was consulted
/// and had nothing. It is distinct from a cache miss (no entry at all) and
/// prevents repeated backing-store lookups for keys known to be missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheEntry {
    /// The current cached document.
    Present(Document),
    /// The key is known to be absent from the backing store.
    Absent,
}

impl CacheEntry {
    /// Wrap a document for caching.
    pub fn present(doc: Document) -> Self {
        Self::Present(doc)
    }

    /// Returns true for the negative marker.
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// The wrapped document, if this is not a negative entry.
    pub fn document(&self) -> Option<&Document> {
        match self {
            Self::Present(doc) => Some(doc),
            Self::Absent => None,
        }
    }

    /// Consume the entry, yielding the wrapped document if present.
    pub fn into_document(self) -> Option<Document> {
        match self {
            Self::Present(doc) => Some(doc),
            Self::Absent => None,
        }
    }
}

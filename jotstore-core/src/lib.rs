//! JOTSTORE Core - Data Types for the Write-Back Document Cache
//!
//! Defines the document model shared between the cache engine and its
//! backing-store implementations: composite document keys, the document
//! payload itself, cache entries (including negative markers), and the
//! error taxonomy.

pub mod document;
pub mod error;
pub mod key;

pub use document::{CacheEntry, Document};
pub use error::{JotError, JotResult};
pub use key::DocumentKey;

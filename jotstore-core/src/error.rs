//! Error types for jotstore operations.

use crate::key::DocumentKey;
use thiserror::Error;

/// Errors surfaced by the cache engine and its backing stores.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JotError {
    #[error("Document not found: {service_id}/{local_id} for owner {owner_id} in scope {scope_id}")]
    NotFound {
        service_id: String,
        local_id: String,
        owner_id: i32,
        scope_id: i32,
    },

    #[error("Backing store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Serialization failed for {context}: {reason}")]
    Serialization { context: String, reason: String },

    #[error("Transient SQL failure: {reason}")]
    SqlTransient { reason: String },

    #[error("Lock poisoned")]
    LockPoisoned,
}

impl JotError {
    /// A `NotFound` for the given key.
    pub fn not_found(key: &DocumentKey) -> Self {
        Self::NotFound {
            service_id: key.service_id().to_string(),
            local_id: key.local_id().to_string(),
            owner_id: key.owner_id(),
            scope_id: key.scope_id(),
        }
    }

    /// True if the key was simply absent; absence is not a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for the transient backing-store failure category that triggers
    /// per-document fallback during a bulk flush.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SqlTransient { .. })
    }
}

/// Result type alias for jotstore operations.
pub type JotResult<T> = Result<T, JotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let key = DocumentKey::new("io.jot/mail", "signature", 7, 1);
        let err = JotError::not_found(&key);
        let msg = format!("{}", err);
        assert!(msg.contains("not found"));
        assert!(msg.contains("io.jot/mail"));
        assert!(msg.contains("signature"));
        assert!(msg.contains('7'));
    }

    #[test]
    fn test_not_found_predicate() {
        let key = DocumentKey::new("a", "b", 1, 1);
        assert!(JotError::not_found(&key).is_not_found());
        assert!(!JotError::Unavailable {
            reason: "down".to_string()
        }
        .is_not_found());
    }

    #[test]
    fn test_transient_predicate() {
        let transient = JotError::SqlTransient {
            reason: "deadlock".to_string(),
        };
        assert!(transient.is_transient());

        let unavailable = JotError::Unavailable {
            reason: "down".to_string(),
        };
        assert!(!unavailable.is_transient());
    }

    #[test]
    fn test_serialization_display() {
        let err = JotError::Serialization {
            context: "cache entry".to_string(),
            reason: "unexpected end of input".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("cache entry"));
        assert!(msg.contains("unexpected end of input"));
    }

    #[test]
    fn test_lock_poisoned_is_not_transient() {
        assert!(!JotError::LockPoisoned.is_transient());
        assert!(!JotError::LockPoisoned.is_not_found());
    }

    #[test]
    fn test_unavailable_display() {
        let err = JotError::Unavailable {
            reason: "connection refused".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("unavailable"));
        assert!(msg.contains("connection refused"));
    }
}

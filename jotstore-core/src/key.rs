//! Composite document keys and cache group derivation.
//!
//! A [`DocumentKey`] locates a document within a service/owner/scope
//! namespace. The local id is unique only within `(service_id, owner_id,
//! scope_id)`, so all four fields participate in equality and hashing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between the group name components.
const GROUP_SEPARATOR: char = '@';

/// Composite identifier for a document.
///
/// # Design
///
/// The private fields ensure a key can only be constructed via [`new`],
/// which requires every namespace component up front. There is no way to
/// build a key that is missing its owner or scope, so cross-owner cache
/// access cannot happen by accident.
///
/// # Group Name
///
/// Keys map deterministically onto a cache group,
/// `"{service_id}@{owner_id}@{scope_id}"`. All documents of one service for
/// one owner in one scope share a group, which is the unit of bulk
/// invalidation in the cache fabric. Because `owner_id` and `scope_id` are
/// integers, the two right-most components are unambiguous and the group
/// name decomposes uniquely even when `service_id` itself contains `@`.
///
/// [`new`]: DocumentKey::new
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    service_id: String,
    local_id: String,
    owner_id: i32,
    scope_id: i32,
}

impl DocumentKey {
    /// Create a new document key.
    pub fn new(
        service_id: impl Into<String>,
        local_id: impl Into<String>,
        owner_id: i32,
        scope_id: i32,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            local_id: local_id.into(),
            owner_id,
            scope_id,
        }
    }

    /// The service this document belongs to.
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// The document identifier, unique within `(service, owner, scope)`.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// The owning user.
    pub fn owner_id(&self) -> i32 {
        self.owner_id
    }

    /// The scope (context) the owner acts in.
    pub fn scope_id(&self) -> i32 {
        self.scope_id
    }

    /// The cache group this key belongs to.
    pub fn group_name(&self) -> String {
        Self::group_for(&self.service_id, self.owner_id, self.scope_id)
    }

    /// Derive the cache group name for a `(service, owner, scope)` triple.
    pub fn group_for(service_id: &str, owner_id: i32, scope_id: i32) -> String {
        format!("{service_id}{GROUP_SEPARATOR}{owner_id}{GROUP_SEPARATOR}{scope_id}")
    }

    /// A copy of this key with a different local id.
    ///
    /// Used to expand a partial key (service/owner/scope only) into full
    /// keys when listing all documents of a namespace.
    pub fn with_local_id(&self, local_id: impl Into<String>) -> Self {
        Self {
            service_id: self.service_id.clone(),
            local_id: local_id.into(),
            owner_id: self.owner_id,
            scope_id: self.scope_id,
        }
    }

    /// Whether this key belongs to the given owner/scope pair.
    pub fn matches_owner(&self, owner_id: i32, scope_id: i32) -> bool {
        self.owner_id == owner_id && self.scope_id == scope_id
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}@{}@{}",
            self.service_id, self.local_id, self.owner_id, self.scope_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_key_equality_requires_all_fields() {
        let key = DocumentKey::new("io.jot/mail", "signature", 7, 1);
        assert_eq!(key, DocumentKey::new("io.jot/mail", "signature", 7, 1));
        assert_ne!(key, DocumentKey::new("io.jot/ui", "signature", 7, 1));
        assert_ne!(key, DocumentKey::new("io.jot/mail", "theme", 7, 1));
        assert_ne!(key, DocumentKey::new("io.jot/mail", "signature", 8, 1));
        assert_ne!(key, DocumentKey::new("io.jot/mail", "signature", 7, 2));
    }

    #[test]
    fn test_group_name_format() {
        let key = DocumentKey::new("io.jot/mail", "signature", 7, 1);
        assert_eq!(key.group_name(), "io.jot/mail@7@1");
        assert_eq!(DocumentKey::group_for("io.jot/mail", 7, 1), key.group_name());
    }

    #[test]
    fn test_group_name_ignores_local_id() {
        let a = DocumentKey::new("io.jot/mail", "signature", 7, 1);
        let b = a.with_local_id("theme");
        assert_ne!(a, b);
        assert_eq!(a.group_name(), b.group_name());
    }

    #[test]
    fn test_with_local_id_preserves_namespace() {
        let partial = DocumentKey::new("io.jot/mail", "", 7, 1);
        let full = partial.with_local_id("signature");
        assert_eq!(full.service_id(), "io.jot/mail");
        assert_eq!(full.local_id(), "signature");
        assert_eq!(full.owner_id(), 7);
        assert_eq!(full.scope_id(), 1);
    }

    #[test]
    fn test_keys_usable_in_hash_sets() {
        let mut set = HashSet::new();
        set.insert(DocumentKey::new("a", "x", 1, 1));
        set.insert(DocumentKey::new("a", "x", 1, 1));
        set.insert(DocumentKey::new("a", "y", 1, 1));
        assert_eq!(set.len(), 2);
    }

    proptest! {
        /// The two right-most group components are integers, so the group
        /// name decomposes uniquely back into (service, owner, scope).
        #[test]
        fn prop_group_name_decomposes_uniquely(
            service in "[a-z./@]{1,12}",
            owner in 0..10_000i32,
            scope in 0..10_000i32,
        ) {
            let group = DocumentKey::group_for(&service, owner, scope);
            let mut parts = group.rsplitn(3, '@');
            let scope_part = parts.next().unwrap();
            let owner_part = parts.next().unwrap();
            let service_part = parts.next().unwrap();
            prop_assert_eq!(scope_part.parse::<i32>().unwrap(), scope);
            prop_assert_eq!(owner_part.parse::<i32>().unwrap(), owner);
            prop_assert_eq!(service_part, service.as_str());
        }
    }
}

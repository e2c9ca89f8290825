//! Cache fabric seam and in-memory implementation.
//!
//! The fabric is a key/value mapping grouped by an owner scope. Entries are
//! addressed by `(id, group)` where the group is derived from the document
//! key (see [`DocumentKey::group_name`]); invalidation operates on whole
//! groups. A distributed implementation propagates puts flagged with
//! `invalidate_remotely` to the other cache nodes; the in-memory
//! implementation records them so tests can observe re-publish behavior.
//!
//! [`DocumentKey::group_name`]: jotstore_core::DocumentKey::group_name

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use jotstore_core::{CacheEntry, JotResult};
use tokio::sync::RwLock;

/// Group-scoped cache mapping consumed by the coordinator.
#[async_trait]
pub trait CacheFabric: Send + Sync {
    /// Get the entry cached under `(id, group)`, or `None` on a miss.
    ///
    /// A present entry may still be the negative marker
    /// ([`CacheEntry::Absent`]); the two cases mean different things to
    /// the caller.
    async fn get_from_group(&self, id: &str, group: &str) -> JotResult<Option<CacheEntry>>;

    /// Put an entry under `(id, group)`.
    ///
    /// With `invalidate_remotely` set, the put is propagated to remote
    /// cache nodes so they refresh their copy.
    async fn put_in_group(
        &self,
        id: &str,
        group: &str,
        entry: CacheEntry,
        invalidate_remotely: bool,
    ) -> JotResult<()>;

    /// Evict the entry under `(id, group)`, if any.
    async fn remove_from_group(&self, id: &str, group: &str) -> JotResult<()>;

    /// Evict every entry in the group.
    async fn invalidate_group(&self, group: &str) -> JotResult<()>;
}

/// In-memory, single-node cache fabric.
#[derive(Debug, Default)]
pub struct InMemoryCacheFabric {
    groups: RwLock<HashMap<String, HashMap<String, CacheEntry>>>,
    remote_invalidations: AtomicU64,
}

impl InMemoryCacheFabric {
    /// Create an empty fabric.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many puts carried the remote-invalidation flag.
    pub fn remote_invalidations(&self) -> u64 {
        self.remote_invalidations.load(Ordering::Relaxed)
    }

    /// Total cached entries across all groups, negative markers included.
    pub async fn entry_count(&self) -> usize {
        self.groups.read().await.values().map(HashMap::len).sum()
    }
}

#[async_trait]
impl CacheFabric for InMemoryCacheFabric {
    async fn get_from_group(&self, id: &str, group: &str) -> JotResult<Option<CacheEntry>> {
        let groups = self.groups.read().await;
        Ok(groups.get(group).and_then(|g| g.get(id)).cloned())
    }

    async fn put_in_group(
        &self,
        id: &str,
        group: &str,
        entry: CacheEntry,
        invalidate_remotely: bool,
    ) -> JotResult<()> {
        if invalidate_remotely {
            self.remote_invalidations.fetch_add(1, Ordering::Relaxed);
        }
        let mut groups = self.groups.write().await;
        groups
            .entry(group.to_string())
            .or_default()
            .insert(id.to_string(), entry);
        Ok(())
    }

    async fn remove_from_group(&self, id: &str, group: &str) -> JotResult<()> {
        let mut groups = self.groups.write().await;
        if let Some(g) = groups.get_mut(group) {
            g.remove(id);
        }
        Ok(())
    }

    async fn invalidate_group(&self, group: &str) -> JotResult<()> {
        self.groups.write().await.remove(group);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jotstore_core::Document;
    use serde_json::json;

    fn entry(v: i64) -> CacheEntry {
        CacheEntry::present(Document::new(json!({"v": v})))
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let fabric = InMemoryCacheFabric::new();
        fabric
            .put_in_group("signature", "svc@7@1", entry(1), false)
            .await
            .unwrap();

        let cached = fabric.get_from_group("signature", "svc@7@1").await.unwrap();
        assert_eq!(cached, Some(entry(1)));

        fabric
            .remove_from_group("signature", "svc@7@1")
            .await
            .unwrap();
        let cached = fabric.get_from_group("signature", "svc@7@1").await.unwrap();
        assert!(cached.is_none());
    }

    #[tokio::test]
    async fn test_miss_is_distinct_from_negative_entry() {
        let fabric = InMemoryCacheFabric::new();
        assert!(fabric
            .get_from_group("missing", "svc@7@1")
            .await
            .unwrap()
            .is_none());

        fabric
            .put_in_group("missing", "svc@7@1", CacheEntry::Absent, false)
            .await
            .unwrap();
        let cached = fabric
            .get_from_group("missing", "svc@7@1")
            .await
            .unwrap()
            .unwrap();
        assert!(cached.is_absent());
    }

    #[tokio::test]
    async fn test_invalidate_group_leaves_other_groups() {
        let fabric = InMemoryCacheFabric::new();
        fabric
            .put_in_group("a", "svc@7@1", entry(1), false)
            .await
            .unwrap();
        fabric
            .put_in_group("b", "svc@7@1", entry(2), false)
            .await
            .unwrap();
        fabric
            .put_in_group("c", "svc@8@1", entry(3), false)
            .await
            .unwrap();

        fabric.invalidate_group("svc@7@1").await.unwrap();

        assert!(fabric.get_from_group("a", "svc@7@1").await.unwrap().is_none());
        assert!(fabric.get_from_group("b", "svc@7@1").await.unwrap().is_none());
        assert!(fabric.get_from_group("c", "svc@8@1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remote_invalidation_counter() {
        let fabric = InMemoryCacheFabric::new();
        fabric
            .put_in_group("a", "svc@7@1", entry(1), false)
            .await
            .unwrap();
        assert_eq!(fabric.remote_invalidations(), 0);

        fabric
            .put_in_group("a", "svc@7@1", entry(2), true)
            .await
            .unwrap();
        assert_eq!(fabric.remote_invalidations(), 1);
    }
}

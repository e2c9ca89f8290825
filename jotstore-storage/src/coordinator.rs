//! Write-back coordinator and its background flush loop.
//!
//! The coordinator serves documents from the cache fabric and defers
//! persistence: `store` writes to the fabric immediately, enqueues a
//! pending op, and returns; a dedicated background task drains the queue in
//! batches and flushes the *current* cached value of each key to the
//! backing store in one bulk write, then re-publishes the flushed entries
//! so remote cache nodes receive a fresh copy.
//!
//! For a single key the guarantee is "eventually persisted with a value
//! that was cached at or after enqueue time": stores on the same key before
//! the flush coalesce into one write of the most recent value. There is no
//! ordering guarantee between different keys.
//!
//! The fabric handle is injected and swappable at runtime. With no fabric
//! attached every operation passes straight through to the backing store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use jotstore_core::{CacheEntry, Document, DocumentKey, JotError, JotResult};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::delay_queue::{DelayQueue, PendingOp};
use crate::fabric::CacheFabric;
use crate::store::BackingStore;

/// How long the flush loop backs off after a batch it could not place.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Configuration for the write-back coordinator.
#[derive(Debug, Clone)]
pub struct WriteBackConfig {
    /// Service ids whose cache groups are torn down by
    /// [`WriteBackCoordinator::drop_owner`].
    pub service_ids: Vec<String>,
    /// Expected batch size; sizes the drain buffer.
    pub batch_hint: usize,
}

impl Default for WriteBackConfig {
    fn default() -> Self {
        Self {
            service_ids: Vec::new(),
            batch_hint: 16,
        }
    }
}

impl WriteBackConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the service ids known to `drop_owner`.
    pub fn with_service_ids(mut self, service_ids: Vec<String>) -> Self {
        self.service_ids = service_ids;
        self
    }

    /// Set the expected batch size.
    pub fn with_batch_hint(mut self, batch_hint: usize) -> Self {
        self.batch_hint = batch_hint;
        self
    }

    /// Create a config from environment variables, falling back to the
    /// defaults for anything unset.
    ///
    /// - `JOTSTORE_SERVICE_IDS`: comma-separated service ids
    /// - `JOTSTORE_BATCH_HINT`: expected batch size
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(ids) = std::env::var("JOTSTORE_SERVICE_IDS") {
            config.service_ids = ids
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(hint) = std::env::var("JOTSTORE_BATCH_HINT") {
            if let Ok(hint) = hint.parse() {
                config.batch_hint = hint;
            }
        }
        config
    }
}

/// State shared between caller-facing operations and the flush loop.
struct Inner<S> {
    store: S,
    fabric: RwLock<Option<Arc<dyn CacheFabric>>>,
    queue: DelayQueue,
    keepgoing: AtomicBool,
    config: WriteBackConfig,
}

impl<S: BackingStore> Inner<S> {
    /// Snapshot the current fabric handle, if one is attached.
    fn fabric(&self) -> JotResult<Option<Arc<dyn CacheFabric>>> {
        Ok(self
            .fabric
            .read()
            .map_err(|_| JotError::LockPoisoned)?
            .as_ref()
            .map(Arc::clone))
    }

    /// Flush one op: read the key's current cached value and persist it.
    ///
    /// Keys whose cached value disappeared (evicted, or replaced by a
    /// negative entry) are silently skipped; there is nothing left to
    /// persist. With `republish` set, the flushed entry is re-put into the
    /// fabric with remote invalidation so other nodes refresh.
    async fn write_one(
        &self,
        op: &PendingOp,
        fabric: &dyn CacheFabric,
        republish: bool,
    ) -> JotResult<()> {
        let cached = fabric.get_from_group(op.key().local_id(), op.group()).await?;
        if let Some(CacheEntry::Present(doc)) = cached {
            self.store.store(op.key(), &doc).await?;
            if republish {
                fabric
                    .put_in_group(
                        op.key().local_id(),
                        op.group(),
                        CacheEntry::present(doc),
                        true,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Flush a drained batch in one bulk write.
    ///
    /// Returns true if the batch could not be placed and was re-offered to
    /// the queue for a later cycle.
    async fn flush_batch(&self, batch: &[PendingOp], fabric: &dyn CacheFabric) -> bool {
        // Resolve each op to the key's current cached value. The value may
        // have changed since enqueue; the freshest one wins.
        let mut docs: HashMap<DocumentKey, Document> = HashMap::with_capacity(batch.len());
        for op in batch {
            match fabric.get_from_group(op.key().local_id(), op.group()).await {
                Ok(Some(CacheEntry::Present(doc))) => {
                    docs.insert(op.key().clone(), doc);
                }
                // Evicted or cached-negative: nothing to persist.
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        key = %op.key(),
                        "Failed to read cached value for pending flush"
                    );
                }
            }
        }
        if docs.is_empty() {
            return false;
        }

        match self.store.store_multiple(&docs).await {
            Ok(()) => {
                // Propagate the persisted values among remote caches.
                for (key, doc) in docs {
                    let group = key.group_name();
                    if let Err(e) = fabric
                        .put_in_group(
                            key.local_id(),
                            &group,
                            CacheEntry::present(doc),
                            true,
                        )
                        .await
                    {
                        tracing::debug!(error = %e, key = %key, "Re-publish after flush failed");
                    }
                }
                false
            }
            Err(e) if e.is_transient() => {
                // One bad record must not block the rest of the batch.
                tracing::warn!(
                    error = %e,
                    ops = batch.len(),
                    "Bulk flush failed, falling back to per-document writes"
                );
                for op in batch {
                    if let Err(e) = self.write_one(op, fabric, true).await {
                        tracing::error!(
                            error = %e,
                            key = %op.key(),
                            "Document could not be flushed to the backing store"
                        );
                    }
                }
                false
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    ops = batch.len(),
                    "Bulk flush failed, re-queueing batch for retry"
                );
                for op in batch {
                    self.queue.offer_if_absent(op.clone());
                }
                true
            }
        }
    }
}

/// Write-back cache coordinator.
///
/// Construct with [`new`], wire a fabric with [`attach_fabric`], and call
/// [`start`] to spawn the background flush loop. [`shutdown`] stops the
/// loop and drains every remaining pending op to the backing store before
/// returning.
///
/// All operations are safe to call concurrently with each other and with
/// the background loop.
///
/// # Example
///
/// ```ignore
/// let coordinator = WriteBackCoordinator::new(store, WriteBackConfig::default());
/// coordinator.attach_fabric(fabric);
/// coordinator.start();
///
/// coordinator.store(key.clone(), doc).await?;   // accepted, durability pending
/// let current = coordinator.load(&key).await?;  // served from cache
///
/// coordinator.shutdown().await;                 // drains to completion
/// ```
///
/// [`new`]: WriteBackCoordinator::new
/// [`attach_fabric`]: WriteBackCoordinator::attach_fabric
/// [`start`]: WriteBackCoordinator::start
/// [`shutdown`]: WriteBackCoordinator::shutdown
pub struct WriteBackCoordinator<S: BackingStore + 'static> {
    inner: Arc<Inner<S>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl<S: BackingStore + 'static> WriteBackCoordinator<S> {
    /// Create a coordinator over the given backing store.
    ///
    /// No fabric is attached yet (operations pass through) and no
    /// background loop is running until [`start`] is called.
    ///
    /// [`start`]: WriteBackCoordinator::start
    pub fn new(store: S, config: WriteBackConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                fabric: RwLock::new(None),
                queue: DelayQueue::new(),
                keepgoing: AtomicBool::new(true),
                config,
            }),
            shutdown_tx,
            shutdown_rx,
            worker: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Attach (or replace) the cache fabric handle.
    ///
    /// Takes effect for all subsequent operations without a restart.
    pub fn attach_fabric(&self, fabric: Arc<dyn CacheFabric>) {
        // Replacing the whole handle is sound even after a poisoning panic,
        // and installing a fresh one clears the poison flag for readers.
        *self
            .inner
            .fabric
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(fabric);
        self.inner.fabric.clear_poison();
    }

    /// Detach the cache fabric; the coordinator degrades to direct
    /// pass-through against the backing store.
    pub fn detach_fabric(&self) {
        *self
            .inner
            .fabric
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        self.inner.fabric.clear_poison();
    }

    /// Spawn the background flush loop. A second call is a no-op.
    pub fn start(&self) {
        let mut worker = self
            .worker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if worker.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let shutdown_rx = self.shutdown_rx.clone();
        *worker = Some(tokio::spawn(flush_loop(inner, shutdown_rx)));
    }

    /// Number of ops waiting to be flushed.
    pub fn pending_ops(&self) -> usize {
        self.inner.queue.len()
    }

    /// Store a document.
    ///
    /// The document is visible to subsequent reads immediately; durable
    /// persistence is deferred to the background flush. Cache-layer
    /// failures are not surfaced: if the fabric put fails, the document is
    /// written straight through to the backing store instead.
    pub async fn store(&self, key: DocumentKey, doc: Document) -> JotResult<()> {
        let Some(fabric) = self.inner.fabric()? else {
            return self.inner.store.store(&key, &doc).await;
        };

        // Publish before enqueueing, so a flush cycle racing this store
        // always finds the value it is asked to persist.
        let group = key.group_name();
        let stamped = doc.with_key(key.clone());
        if let Err(e) = fabric
            .put_in_group(
                key.local_id(),
                &group,
                CacheEntry::present(stamped.clone()),
                false,
            )
            .await
        {
            tracing::warn!(
                error = %e,
                key = %key,
                "Cache put failed, writing document straight through"
            );
            return self.inner.store.store(&key, &stamped).await;
        }
        self.inner.queue.offer_if_absent(PendingOp::new(&key));
        Ok(())
    }

    /// Load a document, failing with [`JotError::NotFound`] if it is absent
    /// from both cache and backing store.
    ///
    /// Absence is cached negatively, so repeated loads of a missing key do
    /// not hit the backing store until the entry is invalidated.
    pub async fn load(&self, key: &DocumentKey) -> JotResult<Document> {
        let Some(fabric) = self.inner.fabric()? else {
            return self.inner.store.load(key).await;
        };

        let group = key.group_name();
        match fabric.get_from_group(key.local_id(), &group).await? {
            Some(CacheEntry::Present(doc)) => Ok(doc),
            Some(CacheEntry::Absent) => Err(JotError::not_found(key)),
            None => match self.inner.store.load(key).await {
                Ok(loaded) => {
                    self.populate(
                        fabric.as_ref(),
                        key,
                        &group,
                        CacheEntry::present(loaded.clone()),
                    )
                    .await;
                    Ok(loaded)
                }
                Err(e) if e.is_not_found() => {
                    self.populate(fabric.as_ref(), key, &group, CacheEntry::Absent)
                        .await;
                    Err(e)
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Load a document, returning `None` if absent.
    ///
    /// Absence is cached negatively, so the next `opt` for the same key
    /// does not hit the backing store until the entry is invalidated.
    pub async fn opt(&self, key: &DocumentKey) -> JotResult<Option<Document>> {
        let Some(fabric) = self.inner.fabric()? else {
            return self.inner.store.opt(key).await;
        };

        let group = key.group_name();
        match fabric.get_from_group(key.local_id(), &group).await? {
            Some(CacheEntry::Present(doc)) => Ok(Some(doc)),
            Some(CacheEntry::Absent) => Ok(None),
            None => match self.inner.store.opt(key).await? {
                Some(doc) => {
                    self.populate(fabric.as_ref(), key, &group, CacheEntry::present(doc.clone()))
                        .await;
                    Ok(Some(doc))
                }
                None => {
                    self.populate(fabric.as_ref(), key, &group, CacheEntry::Absent)
                        .await;
                    Ok(None)
                }
            },
        }
    }

    /// Load a batch of documents.
    ///
    /// Keys missing from the cache are loaded from the backing store in one
    /// batched call and the cache is populated for each loaded entry. The
    /// result matches the order of `keys`; absent keys map to `None`.
    pub async fn list(&self, keys: &[DocumentKey]) -> JotResult<Vec<Option<Document>>> {
        let Some(fabric) = self.inner.fabric()? else {
            return self.inner.store.list(keys).await;
        };

        let mut found: HashMap<DocumentKey, Document> = HashMap::with_capacity(keys.len());
        let mut to_load: Vec<DocumentKey> = Vec::new();
        for key in keys {
            let group = key.group_name();
            match fabric.get_from_group(key.local_id(), &group).await? {
                Some(CacheEntry::Present(doc)) => {
                    found.insert(key.clone(), doc);
                }
                Some(CacheEntry::Absent) => {
                    // A batched read wants authoritative answers; drop the
                    // negative entry and ask the store again.
                    if let Err(e) = fabric.remove_from_group(key.local_id(), &group).await {
                        tracing::debug!(error = %e, key = %key, "Failed to evict negative entry");
                    }
                    to_load.push(key.clone());
                }
                None => to_load.push(key.clone()),
            }
        }

        if !to_load.is_empty() {
            let loaded = self.inner.store.list(&to_load).await?;
            // The store contract preserves key order, so results are keyed
            // positionally; implementations need not stamp keys themselves.
            for (key, doc) in to_load.iter().zip(loaded) {
                if let Some(doc) = doc {
                    let doc = doc.with_key(key.clone());
                    let group = key.group_name();
                    self.populate(fabric.as_ref(), key, &group, CacheEntry::present(doc.clone()))
                        .await;
                    found.insert(key.clone(), doc);
                }
            }
        }

        Ok(keys.iter().map(|key| found.get(key).cloned()).collect())
    }

    /// Load every document stored under the partial key's
    /// `(service, owner, scope)` namespace.
    pub async fn list_all(&self, partial: &DocumentKey) -> JotResult<Vec<Document>> {
        let ids = self.inner.store.list_ids(partial).await?;
        let mut docs = Vec::with_capacity(ids.len());
        for local_id in ids {
            docs.push(self.load(&partial.with_local_id(local_id)).await?);
        }
        Ok(docs)
    }

    /// Remove a document: evict from cache, then delete from the backing
    /// store synchronously. Removal is never deferred.
    pub async fn remove(&self, key: &DocumentKey) -> JotResult<Option<Document>> {
        if let Some(fabric) = self.inner.fabric()? {
            fabric
                .remove_from_group(key.local_id(), &key.group_name())
                .await?;
        }
        self.inner.store.remove(key).await
    }

    /// Evict a key from the cache without touching the backing store.
    ///
    /// Used for cross-node cache consistency signals; never fails the
    /// caller.
    pub async fn invalidate(&self, key: &DocumentKey) {
        let fabric = match self.inner.fabric() {
            Ok(Some(fabric)) => fabric,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(error = %e, key = %key, "Cache eviction failed");
                return;
            }
        };
        if let Err(e) = fabric
            .remove_from_group(key.local_id(), &key.group_name())
            .await
        {
            tracing::debug!(error = %e, key = %key, "Cache eviction failed");
        }
    }

    /// Synchronously flush every pending op belonging to the owner/scope
    /// pair, bypassing the background cadence.
    ///
    /// Safe to race with the background loop: both paths read the current
    /// cached value, so a duplicate flush of the same content is harmless.
    pub async fn flush_owner(&self, owner_id: i32, scope_id: i32) {
        let fabric = match self.inner.fabric() {
            Ok(Some(fabric)) => fabric,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "Cache fabric handle unavailable, owner flush skipped");
                return;
            }
        };
        for op in self.inner.queue.drain_matching(owner_id, scope_id) {
            if let Err(e) = self.inner.write_one(&op, fabric.as_ref(), true).await {
                tracing::error!(
                    error = %e,
                    key = %op.key(),
                    "Document could not be flushed to the backing store"
                );
            }
        }
    }

    /// Tear down an owner/scope pair: flush its pending ops, then
    /// invalidate its cache group for every configured service id.
    pub async fn drop_owner(&self, owner_id: i32, scope_id: i32) {
        let fabric = match self.inner.fabric() {
            Ok(Some(fabric)) => fabric,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "Cache fabric handle unavailable, owner teardown skipped");
                return;
            }
        };
        self.flush_owner(owner_id, scope_id).await;
        for service_id in &self.inner.config.service_ids {
            let group = DocumentKey::group_for(service_id, owner_id, scope_id);
            if let Err(e) = fabric.invalidate_group(&group).await {
                tracing::warn!(error = %e, group = %group, "Group invalidation failed");
            }
        }
    }

    /// Stop the background loop and drain every remaining pending op to the
    /// backing store before returning. Idempotent; a second call is a
    /// no-op.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.keepgoing.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Flush worker terminated abnormally");
            }
        }

        // Drain-to-completion: everything still queued goes straight to the
        // backing store. No re-publish; the fabric is about to go away.
        let remaining = self.inner.queue.drain_all();
        if let Some(fabric) = self.inner.fabric().ok().flatten() {
            for op in &remaining {
                if let Err(e) = self.inner.write_one(op, fabric.as_ref(), false).await {
                    tracing::error!(
                        error = %e,
                        key = %op.key(),
                        "Document could not be flushed during shutdown"
                    );
                }
            }
        } else if !remaining.is_empty() {
            tracing::error!(
                ops = remaining.len(),
                "Pending documents lost: no cache fabric to read them from"
            );
        }

        self.detach_fabric();
        tracing::debug!("Write-back coordinator stopped");
    }

    /// Populate the cache after a successful read; the read already
    /// succeeded, so a failing put only costs a later cache miss.
    async fn populate(
        &self,
        fabric: &dyn CacheFabric,
        key: &DocumentKey,
        group: &str,
        entry: CacheEntry,
    ) {
        if let Err(e) = fabric
            .put_in_group(key.local_id(), group, entry, false)
            .await
        {
            tracing::debug!(error = %e, key = %key, "Cache population failed");
        }
    }
}

/// The background flush loop: wait for one pending op, drain the rest of
/// the queue into a batch, and flush the batch in one bulk write.
async fn flush_loop<S: BackingStore>(inner: Arc<Inner<S>>, mut shutdown_rx: watch::Receiver<bool>) {
    tracing::debug!("Write-back flush loop started");
    let mut batch: Vec<PendingOp> = Vec::with_capacity(inner.config.batch_hint);

    while inner.keepgoing.load(Ordering::Acquire) {
        batch.clear();

        let Some(op) = inner.queue.take(&mut shutdown_rx).await else {
            break;
        };
        batch.push(op);
        inner.queue.drain_into(&mut batch);

        let fabric = match inner.fabric() {
            Ok(fabric) => fabric,
            Err(e) => {
                tracing::error!(error = %e, "Cache fabric handle unavailable");
                None
            }
        };
        let requeued = match fabric {
            Some(fabric) => inner.flush_batch(&batch, fabric.as_ref()).await,
            None => {
                // The values live in the fabric; without one there is
                // nothing to read yet. Keep the ops for later.
                tracing::warn!(ops = batch.len(), "No cache fabric attached, deferring flush");
                for op in batch.drain(..) {
                    inner.queue.offer_if_absent(op);
                }
                true
            }
        };

        if requeued {
            // Back off before retrying so a down backing store is not
            // hammered in a tight loop.
            tokio::select! {
                _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    tracing::debug!("Write-back flush loop stopped");
}

//! Delay queue of pending persistence operations.
//!
//! Each [`PendingOp`] records that a key's latest cached value still needs
//! to be written to the backing store. Ops are deduplicated by key: a key
//! that is already pending is not enqueued again, because the eventual
//! flush reads the current cached value anyway and later stores on the same
//! key coalesce into that one flush.
//!
//! The queue supports one blocking consumer (the background flush loop)
//! plus any number of concurrent producers and non-blocking drainers. The
//! blocking [`take`] observes an explicit shutdown signal instead of a
//! poison sentinel, so no queue value can collide with a real key.
//!
//! [`take`]: DelayQueue::take

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use jotstore_core::DocumentKey;
use tokio::sync::{watch, Notify};

/// A queued intent to persist the current cached value of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOp {
    group: String,
    key: DocumentKey,
}

impl PendingOp {
    /// Create a pending op for the given key.
    pub fn new(key: &DocumentKey) -> Self {
        Self {
            group: key.group_name(),
            key: key.clone(),
        }
    }

    /// The cache group the key lives in.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The key whose cached value needs persisting.
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// Whether this op belongs to the given owner/scope pair.
    pub fn matches_owner(&self, owner_id: i32, scope_id: i32) -> bool {
        self.key.matches_owner(owner_id, scope_id)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ops: VecDeque<PendingOp>,
    pending_keys: HashSet<DocumentKey>,
}

/// Concurrent queue of pending store operations, deduplicated by key.
#[derive(Debug, Default)]
pub struct DelayQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl DelayQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue the op unless its key is already pending.
    ///
    /// Returns true if the op was enqueued, false if an op for the same key
    /// was already queued (the enqueue is then a no-op).
    pub fn offer_if_absent(&self, op: PendingOp) -> bool {
        let offered = {
            let mut state = self.lock_state();
            if state.pending_keys.contains(op.key()) {
                false
            } else {
                state.pending_keys.insert(op.key().clone());
                state.ops.push_back(op);
                true
            }
        };
        if offered {
            self.notify.notify_one();
        }
        offered
    }

    /// Wait for the next pending op.
    ///
    /// Returns `None` once the shutdown signal fires (or its sender is
    /// dropped); remaining ops stay queued for the shutdown drain.
    pub async fn take(&self, shutdown: &mut watch::Receiver<bool>) -> Option<PendingOp> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            // Register for wakeup before checking the queue, so an offer
            // between the check and the await is not lost.
            let notified = self.notify.notified();
            if let Some(op) = self.pop_front() {
                return Some(op);
            }
            tokio::select! {
                _ = notified => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return None;
                    }
                }
            }
        }
    }

    /// Move every currently queued op into `out` without blocking.
    ///
    /// Returns the number of ops drained.
    pub fn drain_into(&self, out: &mut Vec<PendingOp>) -> usize {
        let mut state = self.lock_state();
        let drained = state.ops.len();
        while let Some(op) = state.ops.pop_front() {
            state.pending_keys.remove(op.key());
            out.push(op);
        }
        drained
    }

    /// Remove and return only the ops belonging to the owner/scope pair,
    /// leaving everything else queued.
    pub fn drain_matching(&self, owner_id: i32, scope_id: i32) -> Vec<PendingOp> {
        let mut state = self.lock_state();
        let mut matched = Vec::new();
        let mut kept = VecDeque::with_capacity(state.ops.len());
        while let Some(op) = state.ops.pop_front() {
            if op.matches_owner(owner_id, scope_id) {
                state.pending_keys.remove(op.key());
                matched.push(op);
            } else {
                kept.push_back(op);
            }
        }
        state.ops = kept;
        matched
    }

    /// Remove and return every queued op.
    pub fn drain_all(&self) -> Vec<PendingOp> {
        let mut out = Vec::new();
        self.drain_into(&mut out);
        out
    }

    /// Number of ops currently queued.
    pub fn len(&self) -> usize {
        self.lock_state().ops.len()
    }

    /// True if no ops are queued.
    pub fn is_empty(&self) -> bool {
        self.lock_state().ops.is_empty()
    }

    fn pop_front(&self) -> Option<PendingOp> {
        let mut state = self.lock_state();
        let op = state.ops.pop_front()?;
        state.pending_keys.remove(op.key());
        Some(op)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // The critical sections never panic, so poisoning cannot occur.
        self.state.lock().expect("delay queue lock poisoned")
    }
}

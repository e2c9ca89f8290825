//! JOTSTORE Storage - Write-Back Cache Engine
//!
//! Serves small versioned documents from a distributed cache fabric while
//! deferring persistence to a backing store through a batched background
//! flush pipeline.
//!
//! # Architecture
//!
//! Callers talk to the [`WriteBackCoordinator`]. A `store` writes the
//! document into the [`CacheFabric`] immediately and enqueues a pending
//! persistence operation; a dedicated background task drains the
//! [`DelayQueue`] in batches and flushes the *current* cached values to the
//! [`BackingStore`]. Reads are served from the fabric, falling back to the
//! store on miss (with negative caching for known-absent keys).
//!
//! With no fabric attached the coordinator degrades to a direct
//! pass-through against the backing store: same signatures, same error
//! taxonomy, only latency changes.

pub mod coordinator;
pub mod delay_queue;
pub mod fabric;
pub mod store;

pub use coordinator::{WriteBackConfig, WriteBackCoordinator};
pub use delay_queue::{DelayQueue, PendingOp};
pub use fabric::{CacheFabric, InMemoryCacheFabric};
pub use store::{BackingStore, InMemoryBackingStore};

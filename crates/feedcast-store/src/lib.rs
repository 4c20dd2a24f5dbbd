//! Content-addressed deduplication store for broadcast items.
//!
//! Decides whether an item was already broadcast, keeps a bounded FIFO
//! history with running statistics, and remembers which inbound commands
//! were answered. State is rewritten to JSON files on every mutation.

pub mod persistence;
pub mod store;

pub use persistence::PersistenceError;
pub use store::{DedupStore, ExportedData, Stats, StatsSnapshot, StoreOptions, StoredItem};

//! Core feedcast primitives shared across crates.
//!
//! Includes link canonicalization, content hashing, text helpers, the
//! broadcast event model, and base errors.

pub mod error;
pub mod event;
pub mod hash;
pub mod link;
pub mod text;

pub use event::{Event, UnsignedEvent, KIND_METADATA, KIND_TEXT_NOTE};
pub use hash::content_hash;
pub use link::canonical_url;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in unix seconds (0 if the clock is before the epoch).
pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

//! Cryptographic helpers used by feedcast.
//!
//! Event signing/verification abstractions and key encoding.

pub mod keys;
pub mod signing;

pub use signing::{event_id, verify_event, EventSigner, NostrSigner, SigningError};

//! Feed-to-relay broadcast runtime.
//!
//! Keeps a pool of relay connections healthy, fans signed events out to
//! every connected relay, and drives the fetch/filter/dedup/publish cycle
//! on top of the deduplication store.

pub mod config;
pub mod feed;
pub mod filter;
pub mod monitor;
pub mod pipeline;
pub mod publish;
pub mod responder;
pub mod supervisor;

pub use config::{FanOutMode, PoolConfig};
pub use pipeline::{run_cycle, CycleReport, CycleSettings, PipelineContext};
pub use publish::{Coordinator, PublishOutcome, PublishReport};
pub use responder::{Responder, ResponderConfig};
pub use supervisor::{ConnectError, ConnectSummary, PeerConnection, PeerStatus, Supervisor};

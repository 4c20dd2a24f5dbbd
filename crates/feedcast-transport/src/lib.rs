//! Peer transports for relay publication.
//!
//! The supervisor only sees [`PeerTransport`] and [`Connector`]; this crate
//! ships a NIP-01 WebSocket client and a scriptable in-memory network.

pub mod adapter;
pub mod memory;
pub mod websocket;

pub use adapter::{Connector, PeerEvent, PeerTransport, RelayFilter, TransportError};
pub use memory::{ConnectBehavior, MemoryConnector, PublishBehavior};
pub use websocket::{WebSocketConnector, WebSocketRelay, WebSocketRelayConfig};

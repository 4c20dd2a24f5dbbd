use std::sync::Arc;

use async_trait::async_trait;
use feedcast_core::Event;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors surfaced by a peer transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport is not connected")]
    NotConnected,
    #[error("relay rejected event: {0}")]
    Rejected(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("connection closed")]
    Closed,
}

/// Asynchronous notification from a live peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// The peer closed the connection.
    Closed,
    /// Runtime protocol or socket error; the connection is unusable.
    Error(String),
    /// Informational message from the peer.
    Notice(String),
    /// An event delivered for one of our subscriptions.
    Message { subscription: String, event: Event },
}

/// Subscription filter sent with `REQ`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub mentions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// One connection to one peer.
///
/// Implementations are shared behind `Arc` and must tolerate concurrent
/// `publish_once` calls.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Address this transport was opened for.
    fn address(&self) -> &str;

    /// Establishes the connection. Resolves once the peer is ready.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Sends one event and waits for the peer's acknowledgement.
    async fn publish_once(&self, event: &Event) -> Result<(), TransportError>;

    /// Opens a subscription whose matches arrive as [`PeerEvent::Message`].
    async fn subscribe(
        &self,
        subscription_id: &str,
        filter: &RelayFilter,
    ) -> Result<(), TransportError>;

    /// Closes the connection. Safe to call more than once.
    async fn close(&self);
}

/// Creates transports for peer addresses.
pub trait Connector: Send + Sync {
    /// Opens an unconnected transport and the channel its notifications
    /// arrive on.
    fn open(
        &self,
        address: &str,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<PeerEvent>), TransportError>;
}

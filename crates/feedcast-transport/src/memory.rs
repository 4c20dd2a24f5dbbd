//! Scriptable in-memory peers for tests and dry runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use feedcast_core::Event;
use tokio::sync::mpsc;

use crate::adapter::{Connector, PeerEvent, PeerTransport, RelayFilter, TransportError};

/// How a scripted peer answers `connect`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectBehavior {
    #[default]
    Succeed,
    Fail(String),
    /// Never resolves; exercises connect timeouts.
    Hang,
}

/// How a scripted peer answers `publish_once`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PublishBehavior {
    #[default]
    Accept,
    Reject(String),
    /// Never resolves; exercises publish timeouts.
    Hang,
}

#[derive(Debug, Default)]
struct MemoryPeer {
    connect: ConnectBehavior,
    publish: PublishBehavior,
    connect_attempts: u32,
    published: Vec<Event>,
    subscriptions: Vec<(String, RelayFilter)>,
    events: Option<mpsc::Sender<PeerEvent>>,
    open: bool,
}

/// Connector over a shared in-memory network of scripted peers.
///
/// Unknown addresses behave as always-succeeding peers.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    peers: Arc<Mutex<HashMap<String, MemoryPeer>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_peer<R>(&self, address: &str, f: impl FnOnce(&mut MemoryPeer) -> R) -> R {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        f(peers.entry(address.to_string()).or_default())
    }

    pub fn set_connect(&self, address: &str, behavior: ConnectBehavior) {
        self.with_peer(address, |peer| peer.connect = behavior);
    }

    pub fn set_publish(&self, address: &str, behavior: PublishBehavior) {
        self.with_peer(address, |peer| peer.publish = behavior);
    }

    /// Number of `connect` calls seen for `address`.
    pub fn connect_attempts(&self, address: &str) -> u32 {
        self.with_peer(address, |peer| peer.connect_attempts)
    }

    /// Events accepted by `address`, in arrival order.
    pub fn published(&self, address: &str) -> Vec<Event> {
        self.with_peer(address, |peer| peer.published.clone())
    }

    pub fn subscriptions(&self, address: &str) -> Vec<(String, RelayFilter)> {
        self.with_peer(address, |peer| peer.subscriptions.clone())
    }

    /// Whether the most recent transport for `address` is connected.
    pub fn is_open(&self, address: &str) -> bool {
        self.with_peer(address, |peer| peer.open)
    }

    /// Pushes a notification through the most recent transport for
    /// `address`. Returns false when there is no live channel.
    pub fn emit(&self, address: &str, event: PeerEvent) -> bool {
        let sender = self.with_peer(address, |peer| {
            if matches!(event, PeerEvent::Closed | PeerEvent::Error(_)) {
                peer.open = false;
            }
            peer.events.clone()
        });
        sender.is_some_and(|tx| tx.try_send(event).is_ok())
    }
}

impl Connector for MemoryConnector {
    fn open(
        &self,
        address: &str,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<PeerEvent>), TransportError> {
        let (tx, rx) = mpsc::channel(64);
        self.with_peer(address, |peer| peer.events = Some(tx));
        let transport = MemoryTransport {
            address: address.to_string(),
            network: self.clone(),
        };
        Ok((Arc::new(transport), rx))
    }
}

struct MemoryTransport {
    address: String,
    network: MemoryConnector,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let behavior = self.network.with_peer(&self.address, |peer| {
            peer.connect_attempts += 1;
            if peer.connect == ConnectBehavior::Succeed {
                peer.open = true;
            }
            peer.connect.clone()
        });
        match behavior {
            ConnectBehavior::Succeed => Ok(()),
            ConnectBehavior::Fail(reason) => Err(TransportError::Connect(reason)),
            ConnectBehavior::Hang => std::future::pending().await,
        }
    }

    async fn publish_once(&self, event: &Event) -> Result<(), TransportError> {
        let behavior = self.network.with_peer(&self.address, |peer| {
            if !peer.open {
                return Err(TransportError::NotConnected);
            }
            if peer.publish == PublishBehavior::Accept {
                peer.published.push(event.clone());
            }
            Ok(peer.publish.clone())
        })?;
        match behavior {
            PublishBehavior::Accept => Ok(()),
            PublishBehavior::Reject(reason) => Err(TransportError::Rejected(reason)),
            PublishBehavior::Hang => std::future::pending().await,
        }
    }

    async fn subscribe(
        &self,
        subscription_id: &str,
        filter: &RelayFilter,
    ) -> Result<(), TransportError> {
        self.network.with_peer(&self.address, |peer| {
            if !peer.open {
                return Err(TransportError::NotConnected);
            }
            peer.subscriptions
                .push((subscription_id.to_string(), filter.clone()));
            Ok(())
        })
    }

    async fn close(&self) {
        self.network.with_peer(&self.address, |peer| peer.open = false);
    }
}

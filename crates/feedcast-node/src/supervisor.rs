//! Per-relay connection state machine with linear reconnect backoff.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use feedcast_core::link::relay_address;
use feedcast_core::Event;
use feedcast_transport::{Connector, PeerEvent, PeerTransport, TransportError};
use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Disabled,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Disabled => "disabled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("invalid relay address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("connect already in progress")]
    InProgress,
    #[error("peer is disabled")]
    Disabled,
    #[error("supervisor is shutting down")]
    ShuttingDown,
    #[error("connect timed out")]
    Timeout,
    #[error("connect failed: {0}")]
    Failed(String),
}

/// Connection bookkeeping for one peer address.
///
/// Transition methods are pure so the state table can be checked without
/// any I/O. The supervisor is the only writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerConnection {
    address: String,
    status: PeerStatus,
    retry_count: u32,
    publish_error_count: u32,
    reconnect_scheduled: bool,
    last_error: Option<String>,
}

impl PeerConnection {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            status: PeerStatus::Disconnected,
            retry_count: 0,
            publish_error_count: 0,
            reconnect_scheduled: false,
            last_error: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn status(&self) -> PeerStatus {
        self.status
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn publish_error_count(&self) -> u32 {
        self.publish_error_count
    }

    pub fn reconnect_scheduled(&self) -> bool {
        self.reconnect_scheduled
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// `disconnected`/`error` -> `connecting`. Returns false otherwise.
    pub fn begin_connect(&mut self) -> bool {
        match self.status {
            PeerStatus::Disconnected | PeerStatus::Error => {
                self.status = PeerStatus::Connecting;
                true
            }
            _ => false,
        }
    }

    /// `connecting` -> `connected`; clears retry and publish error counters.
    pub fn mark_connected(&mut self) {
        self.status = PeerStatus::Connected;
        self.retry_count = 0;
        self.publish_error_count = 0;
        self.reconnect_scheduled = false;
        self.last_error = None;
    }

    /// Connect attempt failed or timed out.
    pub fn mark_connect_failed(&mut self, error: impl Into<String>) {
        if self.status != PeerStatus::Disabled {
            self.status = PeerStatus::Error;
        }
        self.last_error = Some(error.into());
    }

    /// Peer signalled close. Ignored once disabled.
    pub fn mark_closed(&mut self) -> bool {
        if self.status == PeerStatus::Disabled {
            return false;
        }
        self.status = PeerStatus::Disconnected;
        true
    }

    /// Peer signalled a runtime error. Ignored once disabled.
    pub fn mark_error(&mut self, error: impl Into<String>) -> bool {
        if self.status == PeerStatus::Disabled {
            return false;
        }
        self.status = PeerStatus::Error;
        self.last_error = Some(error.into());
        true
    }

    /// No more automatic attempts will be made.
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }

    /// Claims the next reconnect slot, returning the 1-based attempt number.
    pub fn schedule_reconnect(&mut self, max_retries: u32) -> Option<u32> {
        let idle = matches!(self.status, PeerStatus::Disconnected | PeerStatus::Error);
        if !idle || self.reconnect_scheduled || self.is_exhausted(max_retries) {
            return None;
        }
        self.retry_count += 1;
        self.reconnect_scheduled = true;
        Some(self.retry_count)
    }

    pub fn reconnect_fired(&mut self) {
        self.reconnect_scheduled = false;
    }

    pub fn record_publish_success(&mut self) {
        self.publish_error_count = 0;
    }

    /// Counts a publish failure. Returns true when this failure disabled the
    /// peer.
    pub fn record_publish_failure(&mut self, max_publish_errors: u32) -> bool {
        self.publish_error_count = self.publish_error_count.saturating_add(1);
        if self.status != PeerStatus::Disabled && self.publish_error_count >= max_publish_errors {
            self.status = PeerStatus::Disabled;
            return true;
        }
        false
    }

    /// Back to a fresh `disconnected` state; used for manual re-supervision.
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.address));
    }
}

/// Result of [`Supervisor::connect_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectSummary {
    pub attempted: usize,
    pub connected: usize,
}

/// A subscription match received from a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub relay: String,
    pub subscription: String,
    pub event: Event,
}

/// A peer as seen by one fan-out pass.
pub(crate) enum FanOutTarget {
    Ready {
        address: String,
        transport: Arc<dyn PeerTransport>,
    },
    Skipped {
        address: String,
        status: PeerStatus,
    },
}

struct PeerSlot {
    conn: PeerConnection,
    transport: Option<Arc<dyn PeerTransport>>,
    reconnect: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    generation: u64,
}

impl PeerSlot {
    fn new(address: &str) -> Self {
        Self {
            conn: PeerConnection::new(address),
            transport: None,
            reconnect: None,
            pump: None,
            generation: 0,
        }
    }

    fn abort_tasks(&mut self) {
        if let Some(handle) = self.reconnect.take() {
            handle.abort();
        }
        if let Some(handle) = self.pump.take() {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct PeerTable {
    order: Vec<String>,
    slots: HashMap<String, PeerSlot>,
}

struct SupervisorInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    peers: Mutex<PeerTable>,
    shutting_down: AtomicBool,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
}

/// Owns one [`PeerConnection`] per configured relay and keeps each in the
/// best reachable state. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                connector,
                peers: Mutex::new(PeerTable::default()),
                shutting_down: AtomicBool::new(false),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
            }),
        }
    }

    /// Builds a supervisor and registers `addresses` as the peer set.
    pub fn with_peers<I, S>(config: PoolConfig, connector: Arc<dyn Connector>, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let supervisor = Self::new(config, connector);
        {
            let mut table = supervisor.lock_table();
            for address in addresses {
                let address = address.into();
                if !table.order.contains(&address) {
                    table.order.push(address);
                }
            }
        }
        supervisor
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, PeerTable> {
        self.inner.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Receiver for subscription matches from every relay. Can be taken once.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inner
            .inbound_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Configured addresses, in configuration order.
    pub fn peers(&self) -> Vec<String> {
        self.lock_table().order.clone()
    }

    /// Connects `address`, or returns the live transport if already connected.
    ///
    /// A failed or timed-out attempt leaves the peer in `error` and schedules
    /// a reconnect.
    pub async fn connect(&self, address: &str) -> Result<Arc<dyn PeerTransport>, ConnectError> {
        relay_address(address).map_err(|err| ConnectError::InvalidAddress {
            address: address.to_string(),
            reason: err.to_string(),
        })?;
        if self.is_shutting_down() {
            return Err(ConnectError::ShuttingDown);
        }

        let generation = {
            let mut table = self.lock_table();
            let table = &mut *table;
            if !table.order.iter().any(|a| a == address) {
                table.order.push(address.to_string());
            }
            let slot = table
                .slots
                .entry(address.to_string())
                .or_insert_with(|| PeerSlot::new(address));
            match slot.conn.status() {
                PeerStatus::Connected => {
                    if let Some(transport) = &slot.transport {
                        return Ok(Arc::clone(transport));
                    }
                    slot.conn.mark_closed();
                }
                PeerStatus::Connecting => return Err(ConnectError::InProgress),
                PeerStatus::Disabled => return Err(ConnectError::Disabled),
                PeerStatus::Disconnected | PeerStatus::Error => {}
            }
            slot.conn.begin_connect();
            slot.generation += 1;
            slot.generation
        };
        debug!(relay = %address, "connecting");

        let (transport, events) = match self.inner.connector.open(address) {
            Ok(opened) => opened,
            Err(err) => {
                let err = ConnectError::Failed(err.to_string());
                self.connect_failed(address, generation, &err);
                return Err(err);
            }
        };

        let outcome =
            match tokio::time::timeout(self.inner.config.connect_timeout, transport.connect())
                .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(TransportError::Connect(reason))) => Err(ConnectError::Failed(reason)),
                Ok(Err(err)) => Err(ConnectError::Failed(err.to_string())),
                Err(_) => Err(ConnectError::Timeout),
            };
        if let Err(err) = outcome {
            transport.close().await;
            self.connect_failed(address, generation, &err);
            return Err(err);
        }

        let accepted = {
            let mut table = self.lock_table();
            match table.slots.get_mut(address) {
                Some(slot) if slot.generation == generation && !self.is_shutting_down() => {
                    slot.conn.mark_connected();
                    if let Some(handle) = slot.reconnect.take() {
                        handle.abort();
                    }
                    if let Some(handle) = slot.pump.take() {
                        handle.abort();
                    }
                    slot.transport = Some(Arc::clone(&transport));
                    slot.pump = Some(self.spawn_pump(address, generation, events));
                    true
                }
                _ => false,
            }
        };
        if !accepted {
            transport.close().await;
            return Err(ConnectError::ShuttingDown);
        }
        info!(relay = %address, "connected");
        Ok(transport)
    }

    fn connect_failed(&self, address: &str, generation: u64, err: &ConnectError) {
        {
            let mut table = self.lock_table();
            let Some(slot) = table.slots.get_mut(address) else {
                return;
            };
            if slot.generation != generation {
                return;
            }
            slot.conn.mark_connect_failed(err.to_string());
        }
        warn!(relay = %address, "connection failed: {err}");
        self.schedule_reconnect(address);
    }

    /// Arms a reconnect timer for `address` after `reconnect_delay *
    /// retry_count`. Returns whether a timer was armed.
    pub fn schedule_reconnect(&self, address: &str) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        let max_retries = self.inner.config.max_retries;
        let mut table = self.lock_table();
        let Some(slot) = table.slots.get_mut(address) else {
            return false;
        };
        let Some(attempt) = slot.conn.schedule_reconnect(max_retries) else {
            if slot.conn.is_exhausted(max_retries) && !slot.conn.reconnect_scheduled() {
                warn!(
                    relay = %address,
                    max_retries,
                    "max reconnect attempts reached, giving up"
                );
            }
            return false;
        };

        let delay = self.inner.config.reconnect_delay_for(attempt);
        info!(
            relay = %address,
            attempt,
            max_retries,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        let weak = Arc::downgrade(&self.inner);
        let target = address.to_string();
        slot.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(supervisor) = Supervisor::upgrade(&weak) else {
                return;
            };
            if supervisor.is_shutting_down() {
                return;
            }
            {
                let mut table = supervisor.lock_table();
                let Some(slot) = table.slots.get_mut(&target) else {
                    return;
                };
                slot.conn.reconnect_fired();
                // Detach: this task must not abort itself on success.
                slot.reconnect.take();
            }
            let _ = supervisor.connect(&target).await;
        }));
        true
    }

    fn upgrade(weak: &Weak<SupervisorInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn spawn_pump(
        &self,
        address: &str,
        generation: u64,
        mut events: mpsc::Receiver<PeerEvent>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let address = address.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(supervisor) = Supervisor::upgrade(&weak) else {
                    return;
                };
                match event {
                    PeerEvent::Closed => {
                        supervisor.connection_lost(&address, generation, None).await;
                        return;
                    }
                    PeerEvent::Error(err) => {
                        supervisor
                            .connection_lost(&address, generation, Some(err))
                            .await;
                        return;
                    }
                    PeerEvent::Notice(notice) => {
                        info!(relay = %address, "notice: {notice}");
                    }
                    PeerEvent::Message {
                        subscription,
                        event,
                    } => {
                        let inbound = InboundMessage {
                            relay: address.clone(),
                            subscription,
                            event,
                        };
                        if supervisor.inner.inbound_tx.try_send(inbound).is_err() {
                            debug!(relay = %address, "dropping inbound event, queue full");
                        }
                    }
                }
            }
        })
    }

    async fn connection_lost(&self, address: &str, generation: u64, error: Option<String>) {
        let transport = {
            let mut table = self.lock_table();
            let Some(slot) = table.slots.get_mut(address) else {
                return;
            };
            if slot.generation != generation {
                return;
            }
            let changed = match &error {
                Some(err) => slot.conn.mark_error(err.clone()),
                None => slot.conn.mark_closed(),
            };
            if !changed {
                debug!(relay = %address, "ignoring notification for disabled peer");
                return;
            }
            // The pump is this task; dropping the handle detaches it.
            slot.pump.take();
            slot.transport.take()
        };
        match &error {
            Some(err) => warn!(relay = %address, "connection error: {err}"),
            None => warn!(relay = %address, "disconnected"),
        }
        if let Some(transport) = transport {
            transport.close().await;
        }
        self.schedule_reconnect(address);
    }

    /// Attempts every configured peer concurrently.
    pub async fn connect_all(&self) -> ConnectSummary {
        let addresses = self.peers();
        let results = join_all(addresses.iter().map(|address| self.connect(address))).await;
        let connected = results.iter().filter(|r| r.is_ok()).count();
        for (address, result) in addresses.iter().zip(&results) {
            if let Err(ConnectError::InvalidAddress { reason, .. }) = result {
                warn!(relay = %address, "skipping invalid relay address: {reason}");
            }
        }
        let summary = ConnectSummary {
            attempted: addresses.len(),
            connected,
        };
        info!("connected to {}/{} relays", summary.connected, summary.attempted);
        summary
    }

    /// Stops all reconnects, closes every connection and forgets all state.
    pub async fn close_all(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let transports: Vec<(String, Arc<dyn PeerTransport>)> = {
            let mut table = self.lock_table();
            table.order.clear();
            table
                .slots
                .drain()
                .filter_map(|(address, mut slot)| {
                    slot.abort_tasks();
                    slot.transport.take().map(|t| (address, t))
                })
                .collect()
        };
        join_all(transports.iter().map(|(address, transport)| async move {
            transport.close().await;
            info!(relay = %address, "connection closed");
        }))
        .await;
    }

    /// Replaces the configured peer set. Removed peers are closed and
    /// forgotten; returns the newly added addresses (not yet connected).
    pub async fn set_peers<I, S>(&self, addresses: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut wanted: Vec<String> = Vec::new();
        for address in addresses {
            let address = address.into();
            if !wanted.contains(&address) {
                wanted.push(address);
            }
        }
        let (added, removed) = {
            let mut table = self.lock_table();
            let added: Vec<String> = wanted
                .iter()
                .filter(|a| !table.order.contains(a))
                .cloned()
                .collect();
            let stale: Vec<String> = table
                .slots
                .keys()
                .filter(|a| !wanted.contains(a))
                .cloned()
                .collect();
            let removed: Vec<Arc<dyn PeerTransport>> = stale
                .iter()
                .filter_map(|address| {
                    let mut slot = table.slots.remove(address)?;
                    slot.abort_tasks();
                    slot.transport.take()
                })
                .collect();
            table.order = wanted;
            (added, removed)
        };
        join_all(removed.iter().map(|t| t.close())).await;
        added
    }

    /// Clears retry/publish counters and re-enables a peer so it can be
    /// connected again.
    pub async fn reset_peer(&self, address: &str) -> bool {
        let transport = {
            let mut table = self.lock_table();
            let Some(slot) = table.slots.get_mut(address) else {
                return false;
            };
            slot.abort_tasks();
            slot.conn.reset();
            slot.generation += 1;
            slot.transport.take()
        };
        if let Some(transport) = transport {
            transport.close().await;
        }
        true
    }

    pub fn status(&self, address: &str) -> Option<PeerStatus> {
        self.lock_table()
            .slots
            .get(address)
            .map(|slot| slot.conn.status())
    }

    /// Connection state of every known peer, in configured order.
    pub fn snapshot(&self) -> Vec<PeerConnection> {
        let table = self.lock_table();
        table
            .order
            .iter()
            .map(|address| {
                table
                    .slots
                    .get(address)
                    .map(|slot| slot.conn.clone())
                    .unwrap_or_else(|| PeerConnection::new(address.clone()))
            })
            .collect()
    }

    pub fn connected_peers(&self) -> Vec<String> {
        let table = self.lock_table();
        table
            .order
            .iter()
            .filter(|address| {
                table
                    .slots
                    .get(*address)
                    .is_some_and(|slot| slot.conn.status() == PeerStatus::Connected)
            })
            .cloned()
            .collect()
    }

    /// The live transport for `address`, only while it is connected.
    pub fn transport(&self, address: &str) -> Option<Arc<dyn PeerTransport>> {
        let table = self.lock_table();
        let slot = table.slots.get(address)?;
        if slot.conn.status() != PeerStatus::Connected {
            return None;
        }
        slot.transport.clone()
    }

    pub(crate) fn fanout_targets(&self) -> Vec<FanOutTarget> {
        let table = self.lock_table();
        table
            .order
            .iter()
            .map(|address| {
                let slot = table.slots.get(address);
                let status = slot
                    .map(|s| s.conn.status())
                    .unwrap_or(PeerStatus::Disconnected);
                match slot.and_then(|s| s.transport.clone()) {
                    Some(transport) if status == PeerStatus::Connected => FanOutTarget::Ready {
                        address: address.clone(),
                        transport,
                    },
                    _ => FanOutTarget::Skipped {
                        address: address.clone(),
                        status,
                    },
                }
            })
            .collect()
    }

    pub(crate) fn record_publish_success(&self, address: &str) {
        if let Some(slot) = self.lock_table().slots.get_mut(address) {
            slot.conn.record_publish_success();
        }
    }

    /// Returns true when this failure disabled the peer.
    pub(crate) fn record_publish_failure(&self, address: &str) -> bool {
        let max = self.inner.config.max_publish_errors;
        self.lock_table()
            .slots
            .get_mut(address)
            .is_some_and(|slot| slot.conn.record_publish_failure(max))
    }
}

//! NIP-01 relay client over WebSocket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use feedcast_core::Event;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::adapter::{Connector, PeerEvent, PeerTransport, RelayFilter, TransportError};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingAcks = Arc<Mutex<HashMap<String, oneshot::Sender<Result<(), TransportError>>>>>;

#[derive(Debug, Clone)]
pub struct WebSocketRelayConfig {
    pub url: String,
    pub outbound_queue_capacity: usize,
    pub event_queue_capacity: usize,
    pub close_grace: Duration,
}

impl WebSocketRelayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            outbound_queue_capacity: 256,
            event_queue_capacity: 1024,
            close_grace: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WebSocketRelayMetrics {
    pub published_ok: u64,
    pub published_err: u64,
    pub inbound_received: u64,
    pub inbound_dropped: u64,
}

#[derive(Debug, Default)]
struct RelayMetricsInner {
    published_ok: AtomicU64,
    published_err: AtomicU64,
    inbound_received: AtomicU64,
    inbound_dropped: AtomicU64,
}

struct RelayLink {
    outbound: mpsc::Sender<Message>,
    shutdown: oneshot::Sender<()>,
    worker: JoinHandle<()>,
}

/// One relay connection. Created unconnected by [`WebSocketConnector`].
pub struct WebSocketRelay {
    config: WebSocketRelayConfig,
    events: mpsc::Sender<PeerEvent>,
    link: Mutex<Option<RelayLink>>,
    pending: PendingAcks,
    connected: Arc<AtomicBool>,
    metrics: Arc<RelayMetricsInner>,
}

impl WebSocketRelay {
    pub fn new(config: WebSocketRelayConfig) -> (Self, mpsc::Receiver<PeerEvent>) {
        let (events, events_rx) = mpsc::channel(config.event_queue_capacity.max(1));
        let relay = Self {
            config,
            events,
            link: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(RelayMetricsInner::default()),
        };
        (relay, events_rx)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn metrics_snapshot(&self) -> WebSocketRelayMetrics {
        WebSocketRelayMetrics {
            published_ok: self.metrics.published_ok.load(Ordering::Relaxed),
            published_err: self.metrics.published_err.load(Ordering::Relaxed),
            inbound_received: self.metrics.inbound_received.load(Ordering::Relaxed),
            inbound_dropped: self.metrics.inbound_dropped.load(Ordering::Relaxed),
        }
    }

    fn outbound(&self) -> Option<mpsc::Sender<Message>> {
        let link = self.link.lock().unwrap_or_else(|e| e.into_inner());
        link.as_ref()
            .filter(|_| self.is_connected())
            .map(|l| l.outbound.clone())
    }
}

#[async_trait]
impl PeerTransport for WebSocketRelay {
    fn address(&self) -> &str {
        &self.config.url
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if self.outbound().is_some() {
            return Ok(());
        }
        let (socket, _) = connect_async(self.config.url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.connected.store(true, Ordering::Relaxed);
        let worker = tokio::spawn(run_relay_worker(RelayWorker {
            url: self.config.url.clone(),
            socket,
            outbound_rx,
            shutdown_rx,
            events: self.events.clone(),
            pending: Arc::clone(&self.pending),
            connected: Arc::clone(&self.connected),
            metrics: Arc::clone(&self.metrics),
        }));

        let previous = self
            .link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(RelayLink {
                outbound: outbound_tx,
                shutdown: shutdown_tx,
                worker,
            });
        if let Some(previous) = previous {
            previous.worker.abort();
        }
        Ok(())
    }

    async fn publish_once(&self, event: &Event) -> Result<(), TransportError> {
        let outbound = self.outbound().ok_or(TransportError::NotConnected)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        let guard = PendingGuard::register(&self.pending, &event.id, ack_tx);

        let result = async {
            outbound
                .send(Message::Text(event_message(event)))
                .await
                .map_err(|_| TransportError::Closed)?;
            ack_rx.await.map_err(|_| TransportError::Closed)?
        }
        .await;
        drop(guard);

        let counter = if result.is_ok() {
            &self.metrics.published_ok
        } else {
            &self.metrics.published_err
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    async fn subscribe(
        &self,
        subscription_id: &str,
        filter: &RelayFilter,
    ) -> Result<(), TransportError> {
        let outbound = self.outbound().ok_or(TransportError::NotConnected)?;
        outbound
            .send(Message::Text(req_message(subscription_id, filter)))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        let link = self.link.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.connected.store(false, Ordering::Relaxed);
        let Some(link) = link else {
            return;
        };
        let _ = link.shutdown.send(());
        let abort = link.worker.abort_handle();
        if tokio::time::timeout(self.config.close_grace, link.worker)
            .await
            .is_err()
        {
            abort.abort();
        }
    }
}

impl Drop for WebSocketRelay {
    fn drop(&mut self) {
        let link = self.link.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(link) = link {
            link.worker.abort();
        }
    }
}

/// Removes a pending acknowledgement slot when the publish future ends,
/// including when it is dropped by a timeout.
struct PendingGuard {
    pending: PendingAcks,
    id: String,
}

impl PendingGuard {
    fn register(
        pending: &PendingAcks,
        id: &str,
        ack: oneshot::Sender<Result<(), TransportError>>,
    ) -> Self {
        pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), ack);
        Self {
            pending: Arc::clone(pending),
            id: id.to_string(),
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

struct RelayWorker {
    url: String,
    socket: Socket,
    outbound_rx: mpsc::Receiver<Message>,
    shutdown_rx: oneshot::Receiver<()>,
    events: mpsc::Sender<PeerEvent>,
    pending: PendingAcks,
    connected: Arc<AtomicBool>,
    metrics: Arc<RelayMetricsInner>,
}

async fn run_relay_worker(worker: RelayWorker) {
    let RelayWorker {
        url,
        socket,
        mut outbound_rx,
        mut shutdown_rx,
        events,
        pending,
        connected,
        metrics,
    } = worker;
    let (mut write, mut read) = socket.split();

    let exit = loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                let _ = write.send(Message::Close(None)).await;
                break None;
            }
            maybe_out = outbound_rx.recv() => {
                let Some(msg) = maybe_out else {
                    break None;
                };
                if let Err(err) = write.send(msg).await {
                    break Some(PeerEvent::Error(err.to_string()));
                }
            }
            maybe_in = read.next() => {
                match maybe_in {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(&url, &text, &events, &pending, &metrics);
                    }
                    Some(Ok(Message::Close(_))) | None => break Some(PeerEvent::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break Some(PeerEvent::Error(err.to_string())),
                }
            }
        }
    };

    connected.store(false, Ordering::Relaxed);
    pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
    if let Some(event) = exit {
        debug!(relay = %url, ?event, "relay connection ended");
        let _ = events.send(event).await;
    }
}

fn handle_inbound(
    url: &str,
    text: &str,
    events: &mpsc::Sender<PeerEvent>,
    pending: &PendingAcks,
    metrics: &RelayMetricsInner,
) {
    let Some(message) = parse_relay_message(text) else {
        debug!(relay = %url, "ignoring unrecognised relay message");
        return;
    };
    let notification = match message {
        RelayMessage::Ok {
            event_id,
            accepted,
            message,
        } => {
            let waiter = pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&event_id);
            if let Some(waiter) = waiter {
                let outcome = if accepted {
                    Ok(())
                } else {
                    Err(TransportError::Rejected(message))
                };
                let _ = waiter.send(outcome);
            }
            return;
        }
        RelayMessage::Event {
            subscription,
            event,
        } => PeerEvent::Message {
            subscription,
            event: *event,
        },
        RelayMessage::Notice(notice) => PeerEvent::Notice(notice),
        RelayMessage::Eose(subscription) => {
            debug!(relay = %url, %subscription, "end of stored events");
            return;
        }
        RelayMessage::Closed {
            subscription,
            message,
        } => {
            warn!(relay = %url, %subscription, "subscription closed by relay: {message}");
            return;
        }
    };
    match events.try_send(notification) {
        Ok(()) => {
            metrics.inbound_received.fetch_add(1, Ordering::Relaxed);
        }
        Err(_) => {
            metrics.inbound_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Relay-to-client frames understood by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Event {
        subscription: String,
        event: Box<Event>,
    },
    Notice(String),
    Eose(String),
    Closed {
        subscription: String,
        message: String,
    },
}

/// Parses one relay frame; unknown or malformed frames yield `None`.
pub fn parse_relay_message(text: &str) -> Option<RelayMessage> {
    let value: Value = serde_json::from_str(text).ok()?;
    let items = value.as_array()?;
    let kind = items.first()?.as_str()?;
    let text_at = |i: usize| items.get(i).and_then(Value::as_str).map(str::to_string);
    match kind {
        "OK" => Some(RelayMessage::Ok {
            event_id: text_at(1)?,
            accepted: items.get(2)?.as_bool()?,
            message: text_at(3).unwrap_or_default(),
        }),
        "EVENT" => {
            let event: Event = serde_json::from_value(items.get(2)?.clone()).ok()?;
            Some(RelayMessage::Event {
                subscription: text_at(1)?,
                event: Box::new(event),
            })
        }
        "NOTICE" => Some(RelayMessage::Notice(text_at(1)?)),
        "EOSE" => Some(RelayMessage::Eose(text_at(1)?)),
        "CLOSED" => Some(RelayMessage::Closed {
            subscription: text_at(1)?,
            message: text_at(2).unwrap_or_default(),
        }),
        _ => None,
    }
}

/// `["EVENT", event]`
pub fn event_message(event: &Event) -> String {
    json!(["EVENT", event]).to_string()
}

/// `["REQ", subscription_id, filter]`
pub fn req_message(subscription_id: &str, filter: &RelayFilter) -> String {
    json!(["REQ", subscription_id, filter]).to_string()
}

/// Opens [`WebSocketRelay`]s with a shared configuration template.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    outbound_queue_capacity: usize,
    event_queue_capacity: usize,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketConnector {
    pub fn new() -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let template = WebSocketRelayConfig::new("");
        Self {
            outbound_queue_capacity: template.outbound_queue_capacity,
            event_queue_capacity: template.event_queue_capacity,
        }
    }
}

impl Connector for WebSocketConnector {
    fn open(
        &self,
        address: &str,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<PeerEvent>), TransportError> {
        let mut config = WebSocketRelayConfig::new(address);
        config.outbound_queue_capacity = self.outbound_queue_capacity;
        config.event_queue_capacity = self.event_queue_capacity;
        let (relay, events) = WebSocketRelay::new(config);
        Ok((Arc::new(relay), events))
    }
}

#[cfg(test)]
mod tests {
    use super::{event_message, parse_relay_message, req_message, RelayMessage};
    use crate::adapter::RelayFilter;
    use feedcast_core::Event;

    fn sample_event() -> Event {
        Event {
            id: "ab".repeat(32),
            pubkey: "cd".repeat(32),
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![vec!["t".to_string(), "tech".to_string()]],
            content: "hello".to_string(),
            sig: "ef".repeat(64),
        }
    }

    #[test]
    fn parses_ok_frames() {
        let accepted = parse_relay_message(r#"["OK","abc",true,""]"#);
        assert_eq!(
            accepted,
            Some(RelayMessage::Ok {
                event_id: "abc".to_string(),
                accepted: true,
                message: String::new(),
            })
        );
        let rejected = parse_relay_message(r#"["OK","abc",false,"blocked: spam"]"#);
        assert!(matches!(
            rejected,
            Some(RelayMessage::Ok { accepted: false, ref message, .. }) if message == "blocked: spam"
        ));
    }

    #[test]
    fn parses_event_and_notice_frames() {
        let event = sample_event();
        let frame = serde_json::json!(["EVENT", "sub-1", event]).to_string();
        match parse_relay_message(&frame) {
            Some(RelayMessage::Event { subscription, event: parsed }) => {
                assert_eq!(subscription, "sub-1");
                assert_eq!(*parsed, sample_event());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(
            parse_relay_message(r#"["NOTICE","slow down"]"#),
            Some(RelayMessage::Notice("slow down".to_string()))
        );
        assert_eq!(
            parse_relay_message(r#"["EOSE","sub-1"]"#),
            Some(RelayMessage::Eose("sub-1".to_string()))
        );
    }

    #[test]
    fn malformed_frames_are_ignored() {
        assert_eq!(parse_relay_message("not json"), None);
        assert_eq!(parse_relay_message(r#"{"OK":true}"#), None);
        assert_eq!(parse_relay_message(r#"["AUTH","challenge"]"#), None);
        assert_eq!(parse_relay_message(r#"["EVENT","sub",{"id":1}]"#), None);
    }

    #[test]
    fn outbound_frames_follow_nip01_layout() {
        let event = sample_event();
        let frame: serde_json::Value =
            serde_json::from_str(&event_message(&event)).expect("json");
        assert_eq!(frame[0], "EVENT");
        assert_eq!(frame[1]["id"], event.id);

        let filter = RelayFilter {
            kinds: Some(vec![1]),
            limit: Some(0),
            ..RelayFilter::default()
        };
        let req: serde_json::Value =
            serde_json::from_str(&req_message("mentions", &filter)).expect("json");
        assert_eq!(req, serde_json::json!(["REQ", "mentions", {"kinds": [1], "limit": 0}]));
    }
}

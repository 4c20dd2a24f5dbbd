use feedcast_core::Event;
use feedcast_transport::{
    Connector, PeerEvent, PeerTransport, RelayFilter, TransportError, WebSocketConnector,
    WebSocketRelay, WebSocketRelayConfig,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

fn note(id: &str, content: &str) -> Event {
    Event {
        id: id.to_string(),
        pubkey: "11".repeat(32),
        created_at: 1_700_000_000,
        kind: 1,
        tags: Vec::new(),
        content: content.to_string(),
        sig: "22".repeat(64),
    }
}

/// Minimal relay: acknowledges events (rejecting content "reject"), answers
/// one REQ with a stored event, then closes the socket.
async fn spawn_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
        while let Some(Ok(msg)) = ws.next().await {
            let Message::Text(text) = msg else {
                continue;
            };
            let frame: serde_json::Value = serde_json::from_str(&text).expect("frame");
            match frame[0].as_str() {
                Some("EVENT") => {
                    let id = frame[1]["id"].as_str().unwrap_or_default().to_string();
                    let accepted = frame[1]["content"] != "reject";
                    let reply = serde_json::json!(["OK", id, accepted, if accepted { "" } else { "blocked: test" }]);
                    ws.send(Message::Text(reply.to_string())).await.expect("ok");
                }
                Some("REQ") => {
                    let sub = frame[1].as_str().unwrap_or_default().to_string();
                    let stored = note(&"33".repeat(32), "mention");
                    let reply = serde_json::json!(["EVENT", sub, stored]);
                    ws.send(Message::Text(reply.to_string())).await.expect("event");
                    ws.send(Message::Text(r#"["NOTICE","bye"]"#.to_string()))
                        .await
                        .expect("notice");
                    let _ = ws.close(None).await;
                    break;
                }
                _ => {}
            }
        }
    });
    format!("ws://{addr}")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relay_client_publishes_subscribes_and_reports_close() {
    let url = spawn_relay().await;
    let (relay, mut events) = WebSocketRelay::new(WebSocketRelayConfig::new(url.clone()));
    assert_eq!(relay.address(), url);
    assert!(!relay.is_connected());

    relay.connect().await.expect("connect");
    relay
        .publish_once(&note(&"aa".repeat(32), "hello"))
        .await
        .expect("accepted");
    let rejected = relay.publish_once(&note(&"bb".repeat(32), "reject")).await;
    assert_eq!(
        rejected,
        Err(TransportError::Rejected("blocked: test".to_string()))
    );

    let filter = RelayFilter {
        kinds: Some(vec![1]),
        ..RelayFilter::default()
    };
    relay.subscribe("mentions", &filter).await.expect("subscribe");

    match events.recv().await {
        Some(PeerEvent::Message { subscription, event }) => {
            assert_eq!(subscription, "mentions");
            assert_eq!(event.content, "mention");
        }
        other => panic!("unexpected notification: {other:?}"),
    }
    assert_eq!(events.recv().await, Some(PeerEvent::Notice("bye".to_string())));
    assert_eq!(events.recv().await, Some(PeerEvent::Closed));

    assert_eq!(
        relay.publish_once(&note(&"cc".repeat(32), "late")).await,
        Err(TransportError::NotConnected)
    );
    let metrics = relay.metrics_snapshot();
    assert_eq!(metrics.published_ok, 1);
    assert_eq!(metrics.published_err, 1);
    assert_eq!(metrics.inbound_received, 2);
    relay.close().await;
}

#[tokio::test]
async fn connect_to_unreachable_relay_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let url = format!("ws://{addr}");
    let (relay, _events) = WebSocketConnector::new().open(&url).expect("open");
    assert_eq!(relay.address(), url);
    assert!(matches!(
        relay.connect().await,
        Err(TransportError::Connect(_))
    ));
}

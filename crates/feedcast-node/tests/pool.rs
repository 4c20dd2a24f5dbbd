use std::sync::Arc;
use std::time::Duration;

use feedcast_core::Event;
use feedcast_node::{ConnectError, Coordinator, FanOutMode, PeerStatus, PoolConfig, Supervisor};
use feedcast_transport::{ConnectBehavior, MemoryConnector, PeerEvent, PublishBehavior};

const A: &str = "wss://a.relay.test";
const B: &str = "wss://b.relay.test";
const C: &str = "wss://c.relay.test";

fn event(id: &str) -> Event {
    Event {
        id: id.to_string(),
        pubkey: "bot".to_string(),
        created_at: 0,
        kind: 1,
        tags: Vec::new(),
        content: "hello".to_string(),
        sig: String::new(),
    }
}

fn pool(network: &MemoryConnector, config: PoolConfig, peers: &[&str]) -> Supervisor {
    Supervisor::with_peers(config, Arc::new(network.clone()), peers.iter().copied())
}

#[tokio::test(start_paused = true)]
async fn reconnects_stop_after_max_retries() {
    let network = MemoryConnector::new();
    network.set_connect(A, ConnectBehavior::Fail("refused".into()));
    let supervisor = pool(&network, PoolConfig::default(), &[A]);

    let err = supervisor.connect(A).await.err();
    assert_eq!(err, Some(ConnectError::Failed("refused".into())));

    // 5s + 10s + 15s of linear backoff, with room to spare.
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(network.connect_attempts(A), 4);
    let peer = &supervisor.snapshot()[0];
    assert_eq!(peer.status(), PeerStatus::Error);
    assert_eq!(peer.retry_count(), 3);
    assert!(!peer.reconnect_scheduled());
    assert!(!supervisor.schedule_reconnect(A));
}

#[tokio::test(start_paused = true)]
async fn reconnect_waits_linear_delay() {
    let network = MemoryConnector::new();
    network.set_connect(A, ConnectBehavior::Fail("refused".into()));
    let supervisor = pool(&network, PoolConfig::default(), &[A]);

    let _ = supervisor.connect(A).await;
    tokio::time::sleep(Duration::from_millis(4_900)).await;
    assert_eq!(network.connect_attempts(A), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(network.connect_attempts(A), 2);

    // Second retry waits twice the base delay.
    tokio::time::sleep(Duration::from_millis(9_800)).await;
    assert_eq!(network.connect_attempts(A), 2);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(network.connect_attempts(A), 3);
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_marks_error_and_schedules_retry() {
    let network = MemoryConnector::new();
    network.set_connect(A, ConnectBehavior::Hang);
    let supervisor = pool(&network, PoolConfig::default(), &[A]);

    assert_eq!(supervisor.connect(A).await.err(), Some(ConnectError::Timeout));
    let peer = &supervisor.snapshot()[0];
    assert_eq!(peer.status(), PeerStatus::Error);
    assert!(peer.reconnect_scheduled());
    assert_eq!(peer.retry_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_connect_reports_in_progress() {
    let network = MemoryConnector::new();
    network.set_connect(A, ConnectBehavior::Hang);
    let supervisor = pool(&network, PoolConfig::default(), &[A]);

    let first = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.connect(A).await.err() })
    };
    tokio::task::yield_now().await;
    assert_eq!(supervisor.status(A), Some(PeerStatus::Connecting));
    assert_eq!(supervisor.connect(A).await.err(), Some(ConnectError::InProgress));
    assert_eq!(first.await.expect("join"), Some(ConnectError::Timeout));
}

#[tokio::test]
async fn connect_returns_live_transport_when_connected() {
    let network = MemoryConnector::new();
    let supervisor = pool(&network, PoolConfig::default(), &[A]);

    let first = supervisor.connect(A).await.expect("connect");
    let second = supervisor.connect(A).await.expect("connect again");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(network.connect_attempts(A), 1);
}

#[tokio::test]
async fn invalid_address_creates_no_state() {
    let network = MemoryConnector::new();
    let supervisor = pool(&network, PoolConfig::default(), &[]);

    for address in ["relay", "https://relay.test"] {
        assert!(matches!(
            supervisor.connect(address).await,
            Err(ConnectError::InvalidAddress { .. })
        ));
        assert_eq!(supervisor.status(address), None);
    }
    assert!(supervisor.peers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn close_notification_triggers_reconnect() {
    let network = MemoryConnector::new();
    let supervisor = pool(&network, PoolConfig::default(), &[A]);
    supervisor.connect(A).await.expect("connect");

    assert!(network.emit(A, PeerEvent::Closed));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(supervisor.status(A), Some(PeerStatus::Disconnected));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(network.connect_attempts(A), 2);
    let peer = &supervisor.snapshot()[0];
    assert_eq!(peer.status(), PeerStatus::Connected);
    assert_eq!(peer.retry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn error_notification_records_reason() {
    let network = MemoryConnector::new();
    let supervisor = pool(&network, PoolConfig::default(), &[A]);
    supervisor.connect(A).await.expect("connect");

    assert!(network.emit(A, PeerEvent::Error("reset by peer".into())));
    tokio::time::sleep(Duration::from_millis(10)).await;
    let peer = &supervisor.snapshot()[0];
    assert_eq!(peer.status(), PeerStatus::Error);
    assert_eq!(peer.last_error(), Some("reset by peer"));
    assert!(peer.reconnect_scheduled());
}

#[tokio::test(start_paused = true)]
async fn close_all_cancels_pending_reconnects() {
    let network = MemoryConnector::new();
    network.set_connect(A, ConnectBehavior::Fail("refused".into()));
    let supervisor = pool(&network, PoolConfig::default(), &[A, B]);

    let summary = supervisor.connect_all().await;
    assert_eq!((summary.attempted, summary.connected), (2, 1));
    assert!(network.is_open(B));

    supervisor.close_all().await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(network.connect_attempts(A), 1);
    assert!(!network.is_open(B));
    assert!(supervisor.snapshot().is_empty());
    assert_eq!(supervisor.connect(B).await.err(), Some(ConnectError::ShuttingDown));
}

#[tokio::test]
async fn publish_succeeds_if_any_peer_accepts() {
    let network = MemoryConnector::new();
    network.set_publish(B, PublishBehavior::Reject("blocked".into()));
    let supervisor = pool(&network, PoolConfig::default(), &[A, B]);
    supervisor.connect_all().await;

    let report = Coordinator::new(supervisor.clone()).publish(&event("e1")).await;
    assert!(report.success);
    assert_eq!(report.success_count(), 1);
    assert_eq!(report.failure_count(), 1);
    assert_eq!(report.outcomes[1].address, B);
    assert_eq!(
        report.outcomes[1].error.as_deref(),
        Some("relay rejected event: blocked")
    );
    assert_eq!(network.published(A).len(), 1);
}

#[tokio::test]
async fn publish_with_no_connected_peers_fails() {
    let network = MemoryConnector::new();
    let supervisor = pool(&network, PoolConfig::default(), &[A]);

    let report = Coordinator::new(supervisor).publish(&event("e1")).await;
    assert!(!report.success);
    assert!(report.outcomes.is_empty());
}

#[tokio::test]
async fn peer_disabled_after_consecutive_failures() {
    let network = MemoryConnector::new();
    network.set_publish(B, PublishBehavior::Reject("blocked".into()));
    let supervisor = pool(&network, PoolConfig::default(), &[A, B]);
    supervisor.connect_all().await;
    let coordinator = Coordinator::new(supervisor.clone());

    for (i, expected) in [1, 2].into_iter().enumerate() {
        coordinator.publish(&event(&format!("e{i}"))).await;
        let b = &supervisor.snapshot()[1];
        assert_eq!(b.publish_error_count(), expected);
        assert_eq!(b.status(), PeerStatus::Connected);
    }

    let third = coordinator.publish(&event("e3")).await;
    assert_eq!(third.outcomes.len(), 2);
    assert_eq!(supervisor.status(B), Some(PeerStatus::Disabled));

    let fourth = coordinator.publish(&event("e4")).await;
    assert_eq!(fourth.outcomes.len(), 1);
    assert_eq!(fourth.outcomes[0].address, A);
    // Disabled peers stay connected but are never retried.
    assert!(network.is_open(B));
    assert_eq!(supervisor.connect(B).await.err(), Some(ConnectError::Disabled));
}

#[tokio::test]
async fn success_resets_publish_error_streak() {
    let network = MemoryConnector::new();
    network.set_publish(A, PublishBehavior::Reject("busy".into()));
    let supervisor = pool(&network, PoolConfig::default(), &[A]);
    supervisor.connect_all().await;
    let coordinator = Coordinator::new(supervisor.clone());

    coordinator.publish(&event("e1")).await;
    coordinator.publish(&event("e2")).await;
    network.set_publish(A, PublishBehavior::Accept);
    assert!(coordinator.publish(&event("e3")).await.success);
    assert_eq!(supervisor.snapshot()[0].publish_error_count(), 0);

    network.set_publish(A, PublishBehavior::Reject("busy".into()));
    coordinator.publish(&event("e4")).await;
    assert_eq!(supervisor.status(A), Some(PeerStatus::Connected));
}

#[tokio::test(start_paused = true)]
async fn only_connected_peers_are_attempted() {
    let network = MemoryConnector::new();
    network.set_publish(B, PublishBehavior::Reject("blocked".into()));
    let config = PoolConfig {
        max_publish_errors: 1,
        ..PoolConfig::default()
    };
    let supervisor = pool(&network, config, &[A, B, C]);
    supervisor.connect(A).await.expect("connect a");
    supervisor.connect(B).await.expect("connect b");
    let coordinator = Coordinator::new(supervisor.clone());
    coordinator.publish(&event("e0")).await;
    assert_eq!(supervisor.status(B), Some(PeerStatus::Disabled));

    network.set_connect(C, ConnectBehavior::Fail("refused".into()));
    let _ = supervisor.connect(C).await;
    assert_eq!(supervisor.status(C), Some(PeerStatus::Error));

    let report = coordinator.publish(&event("e1")).await;
    let attempted: Vec<&str> = report.outcomes.iter().map(|o| o.address.as_str()).collect();
    assert_eq!(attempted, vec![A]);
    assert!(report.success);
}

#[tokio::test(start_paused = true)]
async fn hung_publish_times_out() {
    let network = MemoryConnector::new();
    network.set_publish(B, PublishBehavior::Hang);
    let config = PoolConfig {
        fanout: FanOutMode::Concurrent,
        ..PoolConfig::default()
    };
    let supervisor = pool(&network, config, &[A, B]);
    supervisor.connect_all().await;

    let report = Coordinator::new(supervisor.clone()).publish(&event("e1")).await;
    assert!(report.success);
    assert_eq!(
        report.outcomes[1].error.as_deref(),
        Some("publish timed out after 5000ms")
    );
    assert_eq!(supervisor.snapshot()[1].publish_error_count(), 1);
}

#[tokio::test]
async fn reset_peer_reenables_disabled_peer() {
    let network = MemoryConnector::new();
    network.set_publish(A, PublishBehavior::Reject("blocked".into()));
    let config = PoolConfig {
        max_publish_errors: 1,
        ..PoolConfig::default()
    };
    let supervisor = pool(&network, config, &[A]);
    supervisor.connect_all().await;
    Coordinator::new(supervisor.clone()).publish(&event("e1")).await;
    assert_eq!(supervisor.status(A), Some(PeerStatus::Disabled));

    assert!(supervisor.reset_peer(A).await);
    assert_eq!(supervisor.status(A), Some(PeerStatus::Disconnected));
    supervisor.connect(A).await.expect("reconnect");
    assert_eq!(supervisor.status(A), Some(PeerStatus::Connected));
}

#[tokio::test]
async fn set_peers_drops_removed_relays() {
    let network = MemoryConnector::new();
    let supervisor = pool(&network, PoolConfig::default(), &[A, B]);
    supervisor.connect_all().await;

    let added = supervisor.set_peers([B, C]).await;
    assert_eq!(added, vec![C.to_string()]);
    assert_eq!(supervisor.peers(), vec![B.to_string(), C.to_string()]);
    assert_eq!(supervisor.status(A), None);
    assert!(!network.is_open(A));
    assert_eq!(supervisor.connected_peers(), vec![B.to_string()]);
}

#[tokio::test]
async fn subscription_matches_reach_inbound_queue() {
    let network = MemoryConnector::new();
    let supervisor = pool(&network, PoolConfig::default(), &[A]);
    let mut inbound = supervisor.take_inbound().expect("inbound");
    assert!(supervisor.take_inbound().is_none());
    supervisor.connect(A).await.expect("connect");

    assert!(network.emit(
        A,
        PeerEvent::Message {
            subscription: "mentions".to_string(),
            event: event("m1"),
        }
    ));
    let message = inbound.recv().await.expect("message");
    assert_eq!(message.relay, A);
    assert_eq!(message.subscription, "mentions");
    assert_eq!(message.event.id, "m1");
}

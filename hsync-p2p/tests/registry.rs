use futures::StreamExt;
use hsync_p2p::loopback::LoopbackTransport;
use hsync_p2p::{
    new_registry, ConfigurationError, ConnectionEvent, ConnectionRegistry, ConnectionSession, PeerEvent,
    RegistryError, ReleaseOutcome, SendOutcome, SessionEvent, Topic,
};
use libhsync::{ConnectionConfig, ConnectionStatus, RtcStatus};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const NODE_A: &str = "wss://node-a.example";

fn spawn_registry(transport: &LoopbackTransport) -> ConnectionRegistry {
    env_logger::try_init().ok();
    let (registry, event_loop) = new_registry(transport.clone());
    tokio::spawn(event_loop.run());
    registry
}

fn spawn_resolve(
    registry: &ConnectionRegistry,
    config: ConnectionConfig,
) -> JoinHandle<Result<ConnectionSession, RegistryError>> {
    let registry = registry.clone();
    tokio::spawn(async move { registry.resolve(config).await })
}

async fn settle<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Waits until the single registry entry has `count` callers waiting on or subscribed to it.
async fn wait_for_subscribers(registry: &ConnectionRegistry, count: usize) {
    for _ in 0..200 {
        let connections = registry.connections().await.expect("connections");
        if connections.first().map(|c| c.subscribers) == Some(count) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("registry never reached {count} subscribers");
}

#[tokio::test]
async fn equal_configs_share_one_session() {
    let transport = LoopbackTransport::new();
    let registry = spawn_registry(&transport);
    let a = registry.resolve(ConnectionConfig::new(NODE_A, "s")).await.expect("first resolve");
    // Same remote, written differently.
    let b = registry.resolve(ConnectionConfig::new("wss://NODE-A.example/", "s")).await.expect("second resolve");
    assert!(a.same_session(&b));
    assert_eq!(transport.establish_calls(), 1);
    assert_eq!(a.subscriber_count(), 2);
    assert_eq!(a.connected().await, ConnectionStatus::Connected);
}

#[tokio::test]
async fn differing_config_ends_the_old_handle_before_building() {
    let transport = LoopbackTransport::new();
    let registry = spawn_registry(&transport);
    let old = registry.resolve(ConnectionConfig::new(NODE_A, "s")).await.expect("resolve");
    old.connected().await;

    transport.hold();
    let pending = spawn_resolve(&registry, ConnectionConfig::new(NODE_A, "s").with_local("0.0.0.0", 3001));
    settle(|| transport.establish_calls() == 2).await;
    let first = transport.connection(0).expect("first connection");
    assert_eq!(first.end_calls(), 1);
    assert_eq!(transport.connection_count(), 1);
    assert_eq!(old.status(), ConnectionStatus::Closed);

    transport.release();
    let new = pending.await.expect("join").expect("resolve");
    assert!(!new.same_session(&old));
    assert_eq!(new.subscriber_count(), 1);
    assert_eq!(first.end_calls(), 1);
    // The superseded session is no longer registered.
    assert_eq!(registry.release(&old, true).await.expect("release"), ReleaseOutcome::NotRegistered);
    assert_eq!(first.end_calls(), 1);
}

#[tokio::test]
async fn superseding_an_in_flight_build() {
    let transport = LoopbackTransport::new().held();
    let registry = spawn_registry(&transport);
    let first = spawn_resolve(&registry, ConnectionConfig::new(NODE_A, "old"));
    let joined = spawn_resolve(&registry, ConnectionConfig::new(NODE_A, "old"));
    settle(|| transport.establish_calls() == 1).await;
    wait_for_subscribers(&registry, 2).await;
    let connections = registry.connections().await.expect("connections");
    assert_eq!(connections.len(), 1);
    assert!(connections[0].building);

    let winner = spawn_resolve(&registry, ConnectionConfig::new(NODE_A, "new"));
    for waiter in [first, joined] {
        let result = waiter.await.expect("join");
        assert!(matches!(result, Err(RegistryError::Superseded(_))));
    }
    settle(|| transport.establish_calls() == 2).await;
    transport.release();
    let session = winner.await.expect("join").expect("resolve");
    assert_eq!(session.config().secret.expose(), "new");

    settle(|| transport.connection_count() == 2).await;
    let abandoned = (0..2)
        .filter_map(|i| transport.connection(i))
        .find(|c| c.config().secret.expose() == "old")
        .expect("abandoned connection");
    settle(|| abandoned.end_calls() == 1).await;
    let kept = (0..2).filter_map(|i| transport.connection(i)).find(|c| c.config().secret.expose() == "new");
    assert_eq!(kept.expect("kept connection").end_calls(), 0);
}

#[tokio::test]
async fn restart_never_ends_the_handle() {
    let transport = LoopbackTransport::new();
    let registry = spawn_registry(&transport);
    let config = ConnectionConfig::new(NODE_A, "s");
    let a = registry.resolve(config.clone()).await.expect("resolve");
    let _b = registry.resolve(config.clone()).await.expect("resolve");
    assert_eq!(registry.release(&a, false).await.expect("release"), ReleaseOutcome::Retained { subscribers: 1 });
    assert_eq!(registry.release(&a, false).await.expect("release"), ReleaseOutcome::Retained { subscribers: 0 });
    assert_eq!(registry.release(&a, false).await.expect("release"), ReleaseOutcome::Retained { subscribers: 0 });
    assert_eq!(transport.connection(0).expect("connection").end_calls(), 0);

    // A restarted node picks up the same session.
    let c = registry.resolve(config).await.expect("resolve after restart");
    assert!(c.same_session(&a));
    assert_eq!(transport.establish_calls(), 1);
}

#[tokio::test]
async fn explicit_removal_ends_the_handle_exactly_once() {
    let transport = LoopbackTransport::new();
    let registry = spawn_registry(&transport);
    let config = ConnectionConfig::new(NODE_A, "s");
    let a = registry.resolve(config.clone()).await.expect("resolve");
    let _b = registry.resolve(config.clone()).await.expect("resolve");
    assert_eq!(registry.release(&a, true).await.expect("release"), ReleaseOutcome::Ended);
    assert_eq!(registry.release(&a, true).await.expect("release"), ReleaseOutcome::NotRegistered);
    assert_eq!(transport.connection(0).expect("connection").end_calls(), 1);
    assert!(registry.connections().await.expect("connections").is_empty());

    // The next resolve builds a fresh session.
    let fresh = registry.resolve(config).await.expect("resolve");
    assert!(!fresh.same_session(&a));
    assert_ne!(fresh.id(), a.id());
    assert_eq!(transport.establish_calls(), 2);
}

#[tokio::test]
async fn self_peering_is_rejected_before_anything_is_created() {
    let transport = LoopbackTransport::new();
    let registry = spawn_registry(&transport);
    let session = registry.resolve(ConnectionConfig::new(NODE_A, "s")).await.expect("resolve");
    let err = registry.peer(&session, "https://node-a.example/").await.expect_err("self peer");
    assert!(matches!(err, RegistryError::Configuration(ConfigurationError::SelfPeer(_))));
    assert_eq!(transport.connection(0).expect("connection").peer_count(), 0);
    let err = registry.peer(&session, "  ").await.expect_err("empty peer");
    assert!(matches!(err, RegistryError::Configuration(ConfigurationError::EmptyPeerIdentity)));
    let info = registry.connections().await.expect("connections");
    assert_eq!(info[0].peers, 0);
}

#[tokio::test]
async fn empty_remote_identity_is_rejected() {
    let transport = LoopbackTransport::new();
    let registry = spawn_registry(&transport);
    let err = registry.resolve(ConnectionConfig::new("   ", "s")).await.expect_err("empty remote");
    assert!(matches!(err, RegistryError::Configuration(ConfigurationError::EmptyRemoteIdentity)));
    assert_eq!(transport.establish_calls(), 0);
}

#[tokio::test]
async fn data_channel_is_only_open_while_open() {
    let transport = LoopbackTransport::new();
    let registry = spawn_registry(&transport);
    let session = registry.resolve(ConnectionConfig::new(NODE_A, "s")).await.expect("resolve");
    let peer = registry.peer(&session, "node-b.example").await.expect("peer");
    let again = registry.peer(&session, "NODE-B.example").await.expect("peer");
    assert!(peer.same_session(&again));

    let violated = Arc::new(AtomicBool::new(false));
    let watched = peer.clone();
    let flag = Arc::clone(&violated);
    peer.router().on(Topic::Status, move |event| {
        if let SessionEvent::Rtc(status) = event {
            if watched.data_channel_open() && status != RtcStatus::Open {
                flag.store(true, Ordering::SeqCst);
            }
        }
    });

    let remote = transport.connection(0).expect("connection").peer(peer.peer_key()).expect("remote peer");
    peer.ensure_connecting().await.expect("connect");
    assert!(!peer.data_channel_open());
    remote.emit(PeerEvent::DataChannelOpen);
    settle(|| peer.data_channel_open()).await;
    remote.emit(PeerEvent::Error("ice restart".into()));
    settle(|| peer.rtc_status() == RtcStatus::Error).await;
    assert!(!peer.data_channel_open());
    peer.ensure_connecting().await.expect("reconnect");
    remote.emit(PeerEvent::DataChannelOpen);
    settle(|| peer.data_channel_open()).await;
    remote.emit(PeerEvent::Closed);
    settle(|| peer.rtc_status() == RtcStatus::Closed).await;
    assert!(!peer.data_channel_open());
    assert!(!violated.load(Ordering::SeqCst));
}

#[tokio::test]
async fn closed_channels_never_reach_the_transport() {
    let transport = LoopbackTransport::new();
    let registry = spawn_registry(&transport);
    let session = registry.resolve(ConnectionConfig::new(NODE_A, "s")).await.expect("resolve");
    let peer = registry.peer(&session, "node-b.example").await.expect("peer");
    let remote = transport.connection(0).expect("connection").peer(peer.peer_key()).expect("remote peer");
    assert_eq!(peer.send(json!({"payload": 1})).expect("send"), SendOutcome::Dropped);
    peer.ensure_connecting().await.expect("connect");
    assert_eq!(peer.send(json!("bare")).expect("send"), SendOutcome::Dropped);
    assert!(remote.sent().is_empty());

    remote.emit(PeerEvent::DataChannelOpen);
    settle(|| peer.data_channel_open()).await;
    assert_eq!(peer.send(json!("bare")).expect("send"), SendOutcome::Sent);
    assert_eq!(remote.sent(), vec![json!({"payload": "bare", "from": "node-a.example", "topic": "_"})]);
}

#[tokio::test]
async fn node_a_scenario() {
    let transport = LoopbackTransport::new();
    let registry = spawn_registry(&transport);
    let config = ConnectionConfig::new(NODE_A, "s");
    let first = registry.resolve(config.clone()).await.expect("resolve");
    let second = registry.resolve(config).await.expect("resolve");
    assert!(first.same_session(&second));
    assert_eq!(transport.establish_calls(), 1);
    assert_eq!(first.subscriber_count(), 2);

    let peer = registry.peer(&first, "node-b.example").await.expect("peer");
    assert_eq!(registry.release(&first, true).await.expect("release"), ReleaseOutcome::Ended);
    let remote = transport.connection(0).expect("connection");
    assert_eq!(remote.end_calls(), 1);
    assert_eq!(peer.rtc_status(), RtcStatus::Closed);

    assert_eq!(registry.release(&second, false).await.expect("release"), ReleaseOutcome::NotRegistered);
    assert_eq!(remote.end_calls(), 1);
    let err = registry.peer(&second, "node-c.example").await.expect_err("stale session");
    assert!(matches!(err, RegistryError::StaleSession(_)));
}

#[tokio::test]
async fn concurrent_resolves_share_a_failed_build() {
    let transport = LoopbackTransport::new().held();
    transport.fail_next_establish("connection refused");
    let registry = spawn_registry(&transport);
    let waiters = (0..3).map(|_| spawn_resolve(&registry, ConnectionConfig::new(NODE_A, "s"))).collect::<Vec<_>>();
    settle(|| transport.establish_calls() == 1).await;
    // All three are queued on the one build before it resolves.
    wait_for_subscribers(&registry, 3).await;
    assert_eq!(transport.establish_calls(), 1);

    transport.release();
    for waiter in waiters {
        match waiter.await.expect("join") {
            Err(RegistryError::TransportEstablish { source, .. }) => assert_eq!(source.0, "connection refused"),
            other => panic!("expected an establish failure, got {other:?}"),
        }
    }
    assert_eq!(transport.establish_calls(), 1);
    assert!(registry.connections().await.expect("connections").is_empty());

    // Nothing was stored, so the next resolve tries again.
    registry.resolve(ConnectionConfig::new(NODE_A, "s")).await.expect("retry");
    assert_eq!(transport.establish_calls(), 2);
}

#[tokio::test]
async fn runtime_errors_are_broadcast_and_the_entry_is_kept() {
    let transport = LoopbackTransport::new();
    let registry = spawn_registry(&transport);
    let session = registry.resolve(ConnectionConfig::new(NODE_A, "s")).await.expect("resolve");
    session.connected().await;
    let (_, mut errors) = session.router().channel(Topic::Error);
    transport.connection(0).expect("connection").emit(ConnectionEvent::Error("socket reset".into()));
    assert_eq!(errors.next().await, Some(SessionEvent::Error("socket reset".into())));
    let again = registry.resolve(ConnectionConfig::new(NODE_A, "s")).await.expect("resolve");
    assert!(again.same_session(&session));
}

#[tokio::test]
async fn closed_sessions_are_rebuilt() {
    let transport = LoopbackTransport::new();
    let registry = spawn_registry(&transport);
    let session = registry.resolve(ConnectionConfig::new(NODE_A, "s")).await.expect("resolve");
    session.connected().await;
    transport.connection(0).expect("connection").emit(ConnectionEvent::Closed);
    settle(|| session.status() == ConnectionStatus::Closed).await;
    let rebuilt = registry.resolve(ConnectionConfig::new(NODE_A, "s")).await.expect("resolve");
    assert!(!rebuilt.same_session(&session));
    assert_eq!(transport.establish_calls(), 2);
    assert_eq!(transport.connection(0).expect("connection").end_calls(), 1);
}

#[tokio::test]
async fn shutdown_ends_every_connection() {
    let transport = LoopbackTransport::new();
    let registry = spawn_registry(&transport);
    registry.resolve(ConnectionConfig::new(NODE_A, "s")).await.expect("resolve");
    registry.resolve(ConnectionConfig::new("wss://node-b.example", "s")).await.expect("resolve");
    let handle = registry.clone();
    assert!(registry.shutdown().await.expect("shutdown"));
    assert_eq!(transport.connection(0).expect("connection").end_calls(), 1);
    assert_eq!(transport.connection(1).expect("connection").end_calls(), 1);
    let err = handle.resolve(ConnectionConfig::new(NODE_A, "s")).await.expect_err("closed");
    assert!(matches!(err, RegistryError::RegistryClosed));
}

#[tokio::test]
async fn ended_sessions_stop_forwarding_events() {
    let transport = LoopbackTransport::new();
    let registry = spawn_registry(&transport);
    let old = registry.resolve(ConnectionConfig::new(NODE_A, "s")).await.expect("resolve");
    let peer = registry.peer(&old, "node-b.example").await.expect("peer");
    let remote = transport.connection(0).expect("connection");
    let remote_peer = remote.peer(peer.peer_key()).expect("remote peer");
    assert!(remote.emit(ConnectionEvent::Json(json!({"payload": 1}))));
    assert!(remote_peer.emit(PeerEvent::Json(json!({"payload": 1}))));

    // Superseding ends the old session and closes its peers.
    let new = registry.resolve(ConnectionConfig::new(NODE_A, "other")).await.expect("supersede");
    settle(|| !remote.emit(ConnectionEvent::Json(json!({"payload": 2})))).await;
    settle(|| !remote_peer.emit(PeerEvent::Json(json!({"payload": 2})))).await;

    // The replacement keeps forwarding until it is removed.
    let current = transport.connection(1).expect("connection");
    assert!(current.emit(ConnectionEvent::Json(json!({"payload": 3}))));
    assert_eq!(registry.release(&new, true).await.expect("release"), ReleaseOutcome::Ended);
    settle(|| !current.emit(ConnectionEvent::Json(json!({"payload": 4})))).await;
}

//! Adapters between registry sessions and the flow host that embeds them.
//!
//! A host sees three kinds of node. A [`ConnectionNode`] holds one subscription on a registry session. An [`InNode`]
//! turns session events into host status updates and forwards inbound messages. An [`OutNode`] takes flow messages
//! and delivers them through the relay or a peer channel.

use crate::errors::{DeliveryError, RegistryError};
use crate::peer::PeerSession;
use crate::registry::{ConnectionRegistry, ReleaseOutcome};
use crate::relay::RelayClient;
use crate::router::{Delivery, MessageRouter, Outbound, SessionEvent, SubscriptionHandle, Topic};
use crate::session::ConnectionSession;
use libhsync::{display_host, ConnectionConfig, ConnectionStatus, MessageKind, StatusIndicator};
use log::*;
use serde_json::Value;
use std::sync::Arc;

/// The surface a flow host exposes to its nodes.
pub trait NodeHost: Send + Sync + 'static {
    /// Emit a message to the next nodes in the flow.
    fn send(&self, message: Value);
    fn status(&self, indicator: StatusIndicator);
    fn error(&self, detail: &str);
}

pub struct ConnectionNode {
    registry: ConnectionRegistry,
    session: ConnectionSession,
}

impl ConnectionNode {
    /// Resolve the shared session for `config`. A failure is reported to the host as well as returned.
    pub async fn start<H: NodeHost + ?Sized>(
        registry: ConnectionRegistry,
        config: ConnectionConfig,
        host: &H,
    ) -> Result<Self, RegistryError> {
        match registry.resolve(config).await {
            Ok(session) => Ok(Self { registry, session }),
            Err(err) => {
                host.error(&err.to_string());
                Err(err)
            }
        }
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// `removed` is true when the node was deleted, and false when it is only being restarted.
    pub async fn on_close(self, removed: bool) -> Result<ReleaseOutcome, RegistryError> {
        self.registry.release(&self.session, removed).await
    }
}

/// Status label for a connected session: the host of its remote address.
fn connected_label(session: &ConnectionSession) -> String {
    display_host(&session.config().remote_identity).unwrap_or_else(|| "connected".to_string())
}

pub struct InNode {
    subscriptions: Vec<(MessageRouter, SubscriptionHandle)>,
}

impl InNode {
    pub fn attach<H: NodeHost>(session: &ConnectionSession, host: Arc<H>) -> Self {
        let router = session.router();
        let label = connected_label(session);
        let mut subscriptions = Vec::with_capacity(4);

        let h = Arc::clone(&host);
        let handle = router.on(Topic::Error, move |_| h.status(StatusIndicator::error()));
        subscriptions.push((router.clone(), handle));

        let h = Arc::clone(&host);
        let connected = label.clone();
        let handle = router.on(Topic::Status, move |event| {
            if event == SessionEvent::Status(ConnectionStatus::Connected) {
                h.status(StatusIndicator::connected(connected.clone()));
            }
        });
        subscriptions.push((router.clone(), handle));

        for kind in [MessageKind::Json, MessageKind::ExternalMessage] {
            let h = Arc::clone(&host);
            let handle = router.on_message(kind, move |body| h.send(body));
            subscriptions.push((router.clone(), handle));
        }

        if session.status() == ConnectionStatus::Connected {
            host.status(StatusIndicator::connected(label));
        }
        Self { subscriptions }
    }

    /// Also forward messages arriving over a peer channel.
    pub fn attach_peer<H: NodeHost>(&mut self, peer: &PeerSession, host: Arc<H>) {
        let router = peer.router();
        let handle = router.on_message(MessageKind::PeerJson, move |body| host.send(body));
        self.subscriptions.push((router.clone(), handle));
    }

    pub fn on_close(self) {
        let count = self.subscriptions.len();
        for (router, handle) in self.subscriptions {
            router.unsubscribe(handle);
        }
        trace!("In node detached {count} subscription(s)");
    }
}

pub struct OutNode {
    outbound: Outbound,
}

impl OutNode {
    pub fn new(outbound: Outbound) -> Self {
        Self { outbound }
    }

    pub fn relay(base: &str) -> Result<Self, DeliveryError> {
        Ok(Self::new(Outbound::Relay(RelayClient::new(base)?)))
    }

    pub fn peer(peer: PeerSession) -> Self {
        Self::new(Outbound::Peer(peer))
    }

    /// Deliver one flow message. Failures are reported to the host, with the HTTP status when the relay answered.
    pub async fn on_input<H: NodeHost + ?Sized>(&self, message: &Value, host: &H) -> Result<Delivery, DeliveryError> {
        let result = self.outbound.deliver(message).await;
        match &result {
            Ok(Delivery::Dropped) => debug!("Peer channel not open; message dropped"),
            Ok(delivery) => trace!("Message delivered: {delivery:?}"),
            Err(DeliveryError::Relay(err)) => match err.status() {
                Some(status) => host.error(&format!("{err} (HTTP {status})")),
                None => host.error(&err.to_string()),
            },
            Err(err) => host.error(&err.to_string()),
        }
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::loopback::LoopbackTransport;
    use crate::registry::new_registry;
    use crate::transport::{ConnectionEvent, PeerEvent};
    use libhsync::{StatusColor, StatusShape};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingHost {
        sent: Mutex<Vec<Value>>,
        statuses: Mutex<Vec<StatusIndicator>>,
        errors: Mutex<Vec<String>>,
    }

    impl NodeHost for RecordingHost {
        fn send(&self, message: Value) {
            self.sent.lock().unwrap().push(message);
        }

        fn status(&self, indicator: StatusIndicator) {
            self.statuses.lock().unwrap().push(indicator);
        }

        fn error(&self, detail: &str) {
            self.errors.lock().unwrap().push(detail.to_string());
        }
    }

    async fn settle<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn in_node_reports_status_and_forwards_messages() {
        env_logger::try_init().ok();
        let transport = LoopbackTransport::new().without_auto_connect();
        let (registry, event_loop) = new_registry(transport.clone());
        tokio::spawn(event_loop.run());
        let host = Arc::new(RecordingHost::default());
        let config = ConnectionConfig::new("wss://node-a.example:8443/path", "s");
        let node = ConnectionNode::start(registry.clone(), config, host.as_ref()).await.expect("start");
        let in_node = InNode::attach(node.session(), Arc::clone(&host));
        assert!(host.statuses.lock().unwrap().is_empty());

        let remote = transport.connection(0).expect("connection");
        remote.emit(ConnectionEvent::Connected);
        remote.emit(ConnectionEvent::Json(json!({"payload": "a"})));
        remote.emit(ConnectionEvent::ExternalMessage(json!({"payload": "b"})));
        remote.emit(ConnectionEvent::Error("flaky".into()));
        settle(|| host.statuses.lock().unwrap().len() == 2).await;

        let statuses = host.statuses.lock().unwrap().clone();
        assert_eq!(statuses[0], StatusIndicator::new(StatusColor::Green, StatusShape::Dot, "node-a.example"));
        assert_eq!(statuses[1], StatusIndicator::new(StatusColor::Red, StatusShape::Ring, "error"));
        assert_eq!(*host.sent.lock().unwrap(), vec![json!({"payload": "a"}), json!({"payload": "b"})]);

        in_node.on_close();
        remote.emit(ConnectionEvent::Json(json!({"payload": "c"})));
        assert_eq!(node.on_close(true).await.expect("release"), ReleaseOutcome::Ended);
        assert_eq!(host.sent.lock().unwrap().len(), 2);
        assert_eq!(node_session_subscribers(&registry).await, 0);
    }

    async fn node_session_subscribers(registry: &ConnectionRegistry) -> usize {
        registry.connections().await.expect("connections").iter().map(|c| c.subscribers).sum()
    }

    #[tokio::test]
    async fn in_node_reports_an_existing_connection_at_once() {
        let transport = LoopbackTransport::new();
        let (registry, event_loop) = new_registry(transport);
        tokio::spawn(event_loop.run());
        let host = Arc::new(RecordingHost::default());
        let session = registry.resolve(ConnectionConfig::new("not a url", "s")).await.expect("resolve");
        session.connected().await;
        let _node = InNode::attach(&session, Arc::clone(&host));
        assert_eq!(*host.statuses.lock().unwrap(), vec![StatusIndicator::connected("connected")]);
    }

    #[tokio::test]
    async fn connection_node_reports_establish_failures() {
        let transport = LoopbackTransport::new();
        transport.fail_next_establish("refused");
        let (registry, event_loop) = new_registry(transport);
        tokio::spawn(event_loop.run());
        let host = RecordingHost::default();
        let result = ConnectionNode::start(registry, ConnectionConfig::new("wss://node-a.example", "s"), &host).await;
        assert!(matches!(result, Err(RegistryError::TransportEstablish { .. })));
        let errors = host.errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("refused"));
    }

    #[tokio::test]
    async fn out_node_sends_over_open_peer_channels() {
        let transport = LoopbackTransport::new().with_auto_open_peers();
        let (registry, event_loop) = new_registry(transport.clone());
        tokio::spawn(event_loop.run());
        let host = Arc::new(RecordingHost::default());
        let session = registry.resolve(ConnectionConfig::new("wss://node-a.example", "s")).await.expect("resolve");
        let peer = registry.peer(&session, "wss://node-b.example").await.expect("peer");
        let out = OutNode::peer(peer.clone());
        let mut in_node = InNode::attach(&session, Arc::clone(&host));
        in_node.attach_peer(&peer, Arc::clone(&host));

        assert_eq!(out.on_input(&json!({"payload": 1}), host.as_ref()).await.expect("deliver"), Delivery::Dropped);
        peer.ensure_connecting().await.expect("connect");
        settle(|| peer.data_channel_open()).await;
        assert_eq!(out.on_input(&json!({"payload": 2}), host.as_ref()).await.expect("deliver"), Delivery::Sent);

        let remote = transport.connection(0).expect("connection").peer(peer.peer_key()).expect("peer");
        assert_eq!(remote.sent(), vec![json!({"payload": 2, "from": "node-a.example", "topic": "_"})]);
        remote.emit(PeerEvent::Json(json!({"payload": "hi"})));
        settle(|| !host.sent.lock().unwrap().is_empty()).await;
        assert_eq!(*host.sent.lock().unwrap(), vec![json!({"payload": "hi"})]);
        assert!(host.errors.lock().unwrap().is_empty());
    }
}

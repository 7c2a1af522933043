//! An in-memory [`Transport`] that never touches the network.
//!
//! Every connection and peer channel it produces stays inspectable through the transport, so tests and local tooling
//! can drive events by hand and check what was sent. By default a new connection reports `Connected` straight away.

use crate::errors::TransportError;
use crate::transport::{ConnectionEvent, ConnectionHandle, Established, PeerEvent, PeerHandle, PeerLink, Transport};
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use libhsync::{ConnectionConfig, IdentityKey};
use log::*;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct TransportState {
    hold_connect: bool,
    peer_connect_error: Option<String>,
    auto_open_peers: bool,
    establish_calls: usize,
    next_failure: Option<String>,
    connections: Vec<LoopbackConnection>,
}

#[derive(Clone)]
pub struct LoopbackTransport {
    state: Arc<Mutex<TransportState>>,
    gate: Arc<watch::Sender<bool>>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        let (gate, _) = watch::channel(true);
        Self { state: Arc::default(), gate: Arc::new(gate) }
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// New connections stay in `Connecting` until a `Connected` event is emitted by hand.
    pub fn without_auto_connect(self) -> Self {
        lock(&self.state).hold_connect = true;
        self
    }

    /// Peer channels report `DataChannelOpen` as soon as negotiation succeeds.
    pub fn with_auto_open_peers(self) -> Self {
        lock(&self.state).auto_open_peers = true;
        self
    }

    /// Every peer negotiation fails with `detail`.
    pub fn failing_peer_connects(self, detail: &str) -> Self {
        lock(&self.state).peer_connect_error = Some(detail.to_string());
        self
    }

    /// Hold every `establish` call until [`LoopbackTransport::release`] is called.
    pub fn held(self) -> Self {
        self.hold();
        self
    }

    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// The next `establish` call fails with `detail`.
    pub fn fail_next_establish(&self, detail: &str) {
        lock(&self.state).next_failure = Some(detail.to_string());
    }

    pub fn establish_calls(&self) -> usize {
        lock(&self.state).establish_calls
    }

    /// The connection opened by the `index`-th successful `establish` call.
    pub fn connection(&self, index: usize) -> Option<LoopbackConnection> {
        lock(&self.state).connections.get(index).cloned()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.state).connections.len()
    }
}

impl Transport for LoopbackTransport {
    fn establish(&self, config: ConnectionConfig) -> impl Future<Output = Result<Established, TransportError>> + Send {
        let this = self.clone();
        async move {
            let mut gate = this.gate.subscribe();
            lock(&this.state).establish_calls += 1;
            let released = gate.wait_for(|open| *open).await.is_ok();
            if !released {
                return Err(TransportError::new("loopback transport was dropped"));
            }
            let mut state = lock(&this.state);
            if let Some(detail) = state.next_failure.take() {
                debug!("Loopback establish for {} fails: {detail}", config.remote_identity);
                return Err(TransportError::new(detail));
            }
            let (events, receiver) = mpsc::unbounded();
            let connection = LoopbackConnection {
                inner: Arc::new(ConnectionInner {
                    config,
                    events,
                    end_calls: AtomicUsize::new(0),
                    peers: Mutex::new(Vec::new()),
                    peer_connect_error: state.peer_connect_error.clone(),
                    auto_open_peers: state.auto_open_peers,
                }),
            };
            if !state.hold_connect {
                connection.emit(ConnectionEvent::Connected);
            }
            state.connections.push(connection.clone());
            trace!("Loopback connection {} established", state.connections.len() - 1);
            Ok(Established { handle: Box::new(connection), events: receiver.boxed() })
        }
    }
}

struct ConnectionInner {
    config: ConnectionConfig,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    end_calls: AtomicUsize,
    peers: Mutex<Vec<LoopbackPeer>>,
    peer_connect_error: Option<String>,
    auto_open_peers: bool,
}

#[derive(Clone)]
pub struct LoopbackConnection {
    inner: Arc<ConnectionInner>,
}

impl LoopbackConnection {
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Raise an event as if it came from the remote server. Returns false if nobody is listening any more.
    pub fn emit(&self, event: ConnectionEvent) -> bool {
        self.inner.events.unbounded_send(event).is_ok()
    }

    pub fn end_calls(&self) -> usize {
        self.inner.end_calls.load(Ordering::SeqCst)
    }

    pub fn peer(&self, key: &IdentityKey) -> Option<LoopbackPeer> {
        lock(&self.inner.peers).iter().find(|p| &p.inner.key == key).cloned()
    }

    /// How many peer handles have been requested through this connection.
    pub fn peer_count(&self) -> usize {
        lock(&self.inner.peers).len()
    }
}

impl ConnectionHandle for LoopbackConnection {
    fn peer_handle(&self, peer: &IdentityKey) -> Result<PeerLink, TransportError> {
        let (events, receiver) = mpsc::unbounded();
        let loopback = LoopbackPeer {
            inner: Arc::new(PeerInner {
                key: peer.clone(),
                events,
                connect_calls: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
                connect_error: self.inner.peer_connect_error.clone(),
                auto_open: self.inner.auto_open_peers,
            }),
        };
        lock(&self.inner.peers).push(loopback.clone());
        Ok(PeerLink { handle: Box::new(loopback), events: receiver.boxed() })
    }

    fn end(&self, force: bool) {
        let calls = self.inner.end_calls.fetch_add(1, Ordering::SeqCst) + 1;
        trace!("Loopback connection {} ended (force: {force}, calls: {calls})", self.inner.config.remote_identity);
    }
}

struct PeerInner {
    key: IdentityKey,
    events: mpsc::UnboundedSender<PeerEvent>,
    connect_calls: AtomicUsize,
    sent: Mutex<Vec<Value>>,
    connect_error: Option<String>,
    auto_open: bool,
}

#[derive(Clone)]
pub struct LoopbackPeer {
    inner: Arc<PeerInner>,
}

impl LoopbackPeer {
    pub fn key(&self) -> &IdentityKey {
        &self.inner.key
    }

    pub fn emit(&self, event: PeerEvent) -> bool {
        self.inner.events.unbounded_send(event).is_ok()
    }

    pub fn connect_calls(&self) -> usize {
        self.inner.connect_calls.load(Ordering::SeqCst)
    }

    /// Every message handed to the transport, in order.
    pub fn sent(&self) -> Vec<Value> {
        lock(&self.inner.sent).clone()
    }
}

impl PeerHandle for LoopbackPeer {
    fn connect(&self) -> BoxFuture<'static, Result<(), TransportError>> {
        self.inner.connect_calls.fetch_add(1, Ordering::SeqCst);
        let this = self.clone();
        async move {
            if let Some(detail) = &this.inner.connect_error {
                return Err(TransportError::new(detail.clone()));
            }
            if this.inner.auto_open {
                this.emit(PeerEvent::DataChannelOpen);
            }
            Ok(())
        }
        .boxed()
    }

    fn send(&self, message: &Value) -> Result<(), TransportError> {
        lock(&self.inner.sent).push(message.clone());
        Ok(())
    }
}

//! The boundary to the transport collaborator that performs the actual network handshake and peer negotiation.
//!
//! A [`Transport`] opens connections. Each connection is a boxed [`ConnectionHandle`] plus a stream of
//! [`ConnectionEvent`]s; each peer channel opened through it is a boxed [`PeerHandle`] plus a stream of
//! [`PeerEvent`]s. The registry owns the handles and turns the event streams into status transitions and
//! subscriber notifications, in the order the streams yield them.
//!
//! [`crate::loopback::LoopbackTransport`] is an in-memory implementation.

use crate::errors::TransportError;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use libhsync::{ConnectionConfig, IdentityKey};
use serde_json::Value;
use std::future::Future;

#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    /// The remote handshake completed.
    Connected,
    /// A runtime failure. The connection may still recover.
    Error(String),
    Disconnected,
    Closed,
    Json(Value),
    ExternalMessage(Value),
}

#[derive(Clone, Debug, PartialEq)]
pub enum PeerEvent {
    DataChannelOpen,
    Error(String),
    Disconnected,
    Closed,
    Json(Value),
}

pub struct Established {
    pub handle: Box<dyn ConnectionHandle>,
    pub events: BoxStream<'static, ConnectionEvent>,
}

pub struct PeerLink {
    pub handle: Box<dyn PeerHandle>,
    pub events: BoxStream<'static, PeerEvent>,
}

pub trait Transport: Send + Sync + 'static {
    /// Open a new connection. Resolving does not mean the remote handshake is done; that is signalled by
    /// [`ConnectionEvent::Connected`].
    fn establish(&self, config: ConnectionConfig) -> impl Future<Output = Result<Established, TransportError>> + Send;
}

pub trait ConnectionHandle: Send + Sync {
    /// Produce a handle for a direct channel to `peer`. Negotiation starts with [`PeerHandle::connect`].
    fn peer_handle(&self, peer: &IdentityKey) -> Result<PeerLink, TransportError>;

    fn end(&self, force: bool);
}

pub trait PeerHandle: Send + Sync {
    fn connect(&self) -> BoxFuture<'static, Result<(), TransportError>>;

    fn send(&self, message: &Value) -> Result<(), TransportError>;
}

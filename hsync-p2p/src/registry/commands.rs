use crate::errors::{RegistryError, TransportError};
use crate::peer::PeerSession;
use crate::session::ConnectionSession;
use crate::transport::{ConnectionEvent, Established, PeerEvent};
use futures::channel::oneshot;
use libhsync::{ConnectionConfig, ConnectionStatus, IdentityKey};
use serde::Serialize;

pub enum RegistryCommand {
    Resolve {
        config: ConnectionConfig,
        sender: oneshot::Sender<Result<ConnectionSession, RegistryError>>,
    },
    Release {
        session: ConnectionSession,
        removed: bool,
        sender: oneshot::Sender<ReleaseOutcome>,
    },
    GetPeer {
        connection: ConnectionSession,
        peer: IdentityKey,
        sender: oneshot::Sender<Result<PeerSession, RegistryError>>,
    },
    Connections {
        sender: oneshot::Sender<Vec<ConnectionInfo>>,
    },
    Shutdown(oneshot::Sender<bool>),
}

/// What a call to [`crate::ConnectionRegistry::release`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The session stays registered, with this many subscribers left.
    Retained { subscribers: usize },
    /// The session was ended and removed, along with its peers.
    Ended,
    /// The session was not the one registered for its key (already removed or superseded). Nothing happened.
    NotRegistered,
}

/// A registry entry as reported by [`crate::ConnectionRegistry::connections`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub key: IdentityKey,
    pub status: ConnectionStatus,
    pub subscribers: usize,
    /// True while the first establish attempt is still in flight.
    pub building: bool,
    pub peers: usize,
}

/// Everything the transport tells the loop, funnelled through one channel so events are handled one at a time.
pub(crate) enum LoopEvent {
    Built {
        key: IdentityKey,
        build_id: u64,
        result: Result<Established, TransportError>,
    },
    Connection {
        key: IdentityKey,
        session_id: u64,
        event: ConnectionEvent,
    },
    Peer {
        connection: IdentityKey,
        peer: IdentityKey,
        peer_id: u64,
        event: PeerEvent,
    },
}

use futures::channel::{mpsc, oneshot};
use libhsync::IdentityKey;
use thiserror::Error;

/// A failure reported by the transport collaborator.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("Transport error: {0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(msg: impl Into<String>) -> Self {
        TransportError(msg.into())
    }
}

impl From<&str> for TransportError {
    fn from(s: &str) -> Self {
        TransportError(s.to_string())
    }
}

/// Caught before any asynchronous work starts, and never retried.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("A connection cannot open a peer channel to its own identity ({0})")]
    SelfPeer(IdentityKey),
    #[error("The peer identity is empty")]
    EmptyPeerIdentity,
    #[error("The remote identity is empty")]
    EmptyRemoteIdentity,
}

#[derive(Clone, Debug, Error)]
pub enum RegistryError {
    #[error("Invalid configuration. {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("Could not establish a connection to {key}. {source}")]
    TransportEstablish { key: IdentityKey, source: TransportError },
    #[error("The connection build for {0} was superseded by a different configuration")]
    Superseded(IdentityKey),
    #[error("The session for {0} is no longer registered")]
    StaleSession(IdentityKey),
    #[error("Could not open a peer channel to {peer}. {source}")]
    PeerHandle { peer: IdentityKey, source: TransportError },
    #[error("The registry event loop has stopped")]
    RegistryClosed,
}

impl From<mpsc::SendError> for RegistryError {
    fn from(_: mpsc::SendError) -> Self {
        RegistryError::RegistryClosed
    }
}

impl From<oneshot::Canceled> for RegistryError {
    fn from(_: oneshot::Canceled) -> Self {
        RegistryError::RegistryClosed
    }
}

#[derive(Clone, Debug, Error)]
pub enum PeerError {
    #[error("Peer channel negotiation with {peer} failed. {source}")]
    Connect { peer: IdentityKey, source: TransportError },
    #[error("The peer channel to {0} is closed")]
    Closed(IdentityKey),
    #[error("Sending to {peer} failed. {source}")]
    Send { peer: IdentityKey, source: TransportError },
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Relay delivery failed with status {status}. {detail}")]
    Delivery { status: u16, detail: String },
    #[error("Relay request failed. {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid relay address {0}")]
    InvalidAddress(String),
}

impl RelayError {
    /// The HTTP status of the failed delivery, if the relay answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            RelayError::Delivery { status, .. } => Some(*status),
            RelayError::Http(err) => err.status().map(|s| s.as_u16()),
            RelayError::InvalidAddress(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

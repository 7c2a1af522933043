use super::commands::{ConnectionInfo, RegistryCommand, ReleaseOutcome};
use crate::errors::{ConfigurationError, RegistryError};
use crate::peer::{check_peer_identity, PeerSession};
use crate::session::ConnectionSession;
use futures::channel::{mpsc, oneshot};
use futures::SinkExt;
use libhsync::{ConnectionConfig, IdentityKey};
use log::*;

/// A handle to the registry event loop. Cheap to clone and share between tasks.
///
/// Every method sends one [`RegistryCommand`] to the [`super::RegistryEventLoop`] and waits for its reply. None of them
/// do any work themselves apart from the configuration checks that must fail before anything is sent.
#[derive(Clone)]
pub struct ConnectionRegistry {
    sender: mpsc::Sender<RegistryCommand>,
}

impl ConnectionRegistry {
    pub(crate) fn new(sender: mpsc::Sender<RegistryCommand>) -> Self {
        Self { sender }
    }

    /// Return the shared session for `config`'s remote, building or superseding it as needed.
    ///
    /// The returned session may still be `Connecting`; use [`ConnectionSession::connected`] to wait for the handshake.
    /// Every successful call counts as one subscriber and should be paired with a [`ConnectionRegistry::release`].
    pub async fn resolve(&self, config: ConnectionConfig) -> Result<ConnectionSession, RegistryError> {
        if config.identity_key().is_empty() {
            return Err(ConfigurationError::EmptyRemoteIdentity.into());
        }
        let (sender, receiver) = oneshot::channel();
        self.sender.clone().send(RegistryCommand::Resolve { config, sender }).await?;
        receiver.await?
    }

    /// Give up one subscription. With `removed` set, the session is ended and forgotten regardless of how many other
    /// subscribers remain; otherwise (a restart) the session is left running.
    pub async fn release(&self, session: &ConnectionSession, removed: bool) -> Result<ReleaseOutcome, RegistryError> {
        let (sender, receiver) = oneshot::channel();
        let session = session.clone();
        self.sender.clone().send(RegistryCommand::Release { session, removed, sender }).await?;
        let outcome = receiver.await?;
        trace!("Release (removed: {removed}) -> {outcome:?}");
        Ok(outcome)
    }

    /// The peer channel from `connection` to `peer`, created on first use.
    pub async fn peer(&self, connection: &ConnectionSession, peer: &str) -> Result<PeerSession, RegistryError> {
        let peer = IdentityKey::from_address(peer);
        check_peer_identity(connection.key(), &peer)?;
        let (sender, receiver) = oneshot::channel();
        let connection = connection.clone();
        self.sender.clone().send(RegistryCommand::GetPeer { connection, peer, sender }).await?;
        receiver.await?
    }

    pub async fn connections(&self) -> Result<Vec<ConnectionInfo>, RegistryError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.clone().send(RegistryCommand::Connections { sender }).await?;
        let connections = receiver.await?;
        Ok(connections)
    }

    /// End every connection and stop the event loop.
    pub async fn shutdown(self) -> Result<bool, RegistryError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.clone().send(RegistryCommand::Shutdown(sender)).await?;
        let result = receiver.await?;
        Ok(result)
    }
}

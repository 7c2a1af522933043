//! Direct peer data channels opened through a connection session.
//!
//! A [`PeerSession`] tracks one peer channel through its lifecycle:
//!
//! ```text
//!   Idle ──connect──▶ Connecting ──dc open──▶ Open ──disconnected──▶ Disconnected
//!                        │  ▲                  │                         │
//!                  error │  └──── connect ─────┼──────── connect ────────┘
//!                        ▼                     │
//!                      Error ◀────error────────┘          any ──closed──▶ Closed (terminal)
//! ```
//!
//! `data_channel_open` is only ever true while the status is `Open`. Messages are only handed to the transport while
//! the channel is open; anything sent before that is dropped.

use crate::errors::{ConfigurationError, PeerError, RegistryError, TransportError};
use crate::router::{MessageRouter, SessionEvent};
use crate::session::{ConnectionSession, WeakSession};
use crate::transport::{PeerEvent, PeerHandle, PeerLink};
use futures::stream::BoxStream;
use libhsync::message::stamp_peer_message;
use libhsync::{IdentityKey, MessageKind, RtcStatus};
use log::*;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::AbortHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Dropped,
}

#[derive(Clone, Copy, Debug)]
struct PeerState {
    rtc_status: RtcStatus,
    data_channel_open: bool,
}

struct PeerInner {
    id: u64,
    peer: IdentityKey,
    local: IdentityKey,
    connection: WeakSession,
    handle: Box<dyn PeerHandle>,
    state: Mutex<PeerState>,
    forwarder: Mutex<Option<AbortHandle>>,
    router: MessageRouter,
}

#[derive(Clone)]
pub struct PeerSession {
    inner: Arc<PeerInner>,
}

impl PeerSession {
    fn new(id: u64, peer: IdentityKey, connection: &ConnectionSession, handle: Box<dyn PeerHandle>) -> Self {
        let inner = PeerInner {
            id,
            peer,
            local: connection.key().clone(),
            connection: connection.downgrade(),
            handle,
            state: Mutex::new(PeerState { rtc_status: RtcStatus::Idle, data_channel_open: false }),
            forwarder: Mutex::new(None),
            router: MessageRouter::new(),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_key(&self) -> &IdentityKey {
        &self.inner.peer
    }

    /// The identity of the connection this channel runs through, stamped as `from` on outgoing messages.
    pub fn local_key(&self) -> &IdentityKey {
        &self.inner.local
    }

    pub fn rtc_status(&self) -> RtcStatus {
        self.state().rtc_status
    }

    pub fn data_channel_open(&self) -> bool {
        self.state().data_channel_open
    }

    /// The owning connection, if it is still alive.
    pub fn connection(&self) -> Option<ConnectionSession> {
        self.inner.connection.upgrade()
    }

    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    pub fn same_session(&self, other: &PeerSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn state(&self) -> MutexGuard<'_, PeerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the state under the lock, then publish the new status if it changed.
    fn transition<F>(&self, f: F) -> Option<RtcStatus>
    where
        F: FnOnce(&mut PeerState),
    {
        let changed = {
            let mut state = self.state();
            let before = state.rtc_status;
            f(&mut state);
            debug_assert!(!state.data_channel_open || state.rtc_status == RtcStatus::Open);
            (state.rtc_status != before).then_some(state.rtc_status)
        };
        if let Some(status) = changed {
            trace!("Peer channel {} -> {} is now {status}", self.inner.local, self.inner.peer);
            self.inner.router.publish(SessionEvent::Rtc(status));
        }
        changed
    }

    /// Start negotiating the channel unless it is already open or connecting.
    ///
    /// A failed negotiation moves the channel to `Error` and is returned to the caller.
    pub async fn ensure_connecting(&self) -> Result<(), PeerError> {
        let mut closed = false;
        let mut start = false;
        self.transition(|state| match state.rtc_status {
            RtcStatus::Closed => closed = true,
            RtcStatus::Connecting => {}
            _ if state.data_channel_open => {}
            _ => {
                state.rtc_status = RtcStatus::Connecting;
                start = true;
            }
        });
        if closed {
            return Err(PeerError::Closed(self.inner.peer.clone()));
        }
        if !start {
            trace!("Peer channel to {} is already open or connecting", self.inner.peer);
            return Ok(());
        }
        debug!("Negotiating peer channel {} -> {}", self.inner.local, self.inner.peer);
        match self.inner.handle.connect().await {
            Ok(()) => Ok(()),
            Err(source) => {
                warn!("Peer channel negotiation with {} failed: {source}", self.inner.peer);
                self.fail(source.0.clone());
                Err(PeerError::Connect { peer: self.inner.peer.clone(), source })
            }
        }
    }

    /// Send a message over the open channel. A missing `from` is set to the local identity and a missing `topic` to
    /// the default topic. If the channel is not open the message is dropped and the transport is not called.
    pub fn send(&self, message: Value) -> Result<SendOutcome, PeerError> {
        if !self.data_channel_open() {
            debug!("Peer channel to {} is not open; dropping message", self.inner.peer);
            return Ok(SendOutcome::Dropped);
        }
        let message = stamp_peer_message(message, self.inner.local.as_str());
        self.inner
            .handle
            .send(&message)
            .map_err(|source| PeerError::Send { peer: self.inner.peer.clone(), source })?;
        Ok(SendOutcome::Sent)
    }

    fn fail(&self, detail: String) {
        let mut broadcast = false;
        self.transition(|state| {
            if matches!(state.rtc_status, RtcStatus::Closed | RtcStatus::Error) {
                return;
            }
            state.rtc_status = RtcStatus::Error;
            state.data_channel_open = false;
            broadcast = true;
        });
        if broadcast {
            self.inner.router.publish(SessionEvent::Error(detail));
        } else {
            trace!("Peer channel to {} already failed or closed: {detail}", self.inner.peer);
        }
    }

    /// Attach the task feeding this channel's events into the registry. It is aborted when the channel closes.
    pub(crate) fn set_forwarder(&self, forwarder: AbortHandle) {
        if self.rtc_status() == RtcStatus::Closed {
            forwarder.abort();
            return;
        }
        let previous = self.inner.forwarder.lock().unwrap_or_else(PoisonError::into_inner).replace(forwarder);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub(crate) fn close(&self) {
        self.transition(|state| {
            state.rtc_status = RtcStatus::Closed;
            state.data_channel_open = false;
        });
        if let Some(forwarder) = self.inner.forwarder.lock().unwrap_or_else(PoisonError::into_inner).take() {
            forwarder.abort();
        }
    }

    /// Apply an event raised by the underlying peer handle.
    pub(crate) fn apply(&self, event: PeerEvent) {
        let peer = &self.inner.peer;
        match event {
            PeerEvent::DataChannelOpen => {
                let mut opened = false;
                let mut from = RtcStatus::Idle;
                self.transition(|state| {
                    from = state.rtc_status;
                    if state.rtc_status == RtcStatus::Connecting {
                        state.rtc_status = RtcStatus::Open;
                        state.data_channel_open = true;
                        opened = true;
                    }
                });
                if opened {
                    info!("Peer channel to {peer} is open");
                } else {
                    debug!("Ignoring data channel open for {peer} while {from}");
                }
            }
            PeerEvent::Error(detail) => {
                warn!("Peer channel to {peer} reported an error: {detail}");
                self.fail(detail);
            }
            PeerEvent::Disconnected => {
                self.transition(|state| {
                    state.data_channel_open = false;
                    if state.rtc_status == RtcStatus::Open {
                        state.rtc_status = RtcStatus::Disconnected;
                    }
                });
            }
            PeerEvent::Closed => {
                info!("Peer channel to {peer} closed");
                self.close();
            }
            PeerEvent::Json(body) => {
                self.inner.router.publish(SessionEvent::Message { kind: MessageKind::PeerJson, body });
            }
        }
    }
}

impl Debug for PeerSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = *self.state();
        f.debug_struct("PeerSession")
            .field("id", &self.inner.id)
            .field("local", &self.inner.local)
            .field("peer", &self.inner.peer)
            .field("rtc_status", &state.rtc_status)
            .field("data_channel_open", &state.data_channel_open)
            .finish()
    }
}

/// Rejects peering a connection with itself.
pub fn check_peer_identity(connection: &IdentityKey, peer: &IdentityKey) -> Result<(), ConfigurationError> {
    if peer.is_empty() {
        return Err(ConfigurationError::EmptyPeerIdentity);
    }
    if peer == connection {
        return Err(ConfigurationError::SelfPeer(peer.clone()));
    }
    Ok(())
}

pub enum PeerEntry {
    Existing(PeerSession),
    /// Newly created; the caller is responsible for feeding the event stream back through [`PeerSession::apply`].
    Created(PeerSession, BoxStream<'static, PeerEvent>),
}

/// Peer sessions keyed by (connection identity, peer identity).
#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<(IdentityKey, IdentityKey), PeerSession>,
    next_id: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, connection: &IdentityKey, peer: &IdentityKey) -> Option<&PeerSession> {
        self.peers.get(&(connection.clone(), peer.clone()))
    }

    pub fn get_or_create(
        &mut self,
        connection: &ConnectionSession,
        peer: IdentityKey,
    ) -> Result<PeerEntry, RegistryError> {
        check_peer_identity(connection.key(), &peer)?;
        let key = (connection.key().clone(), peer);
        if let Some(existing) = self.peers.get(&key) {
            return Ok(PeerEntry::Existing(existing.clone()));
        }
        let PeerLink { handle, events } = connection
            .open_peer_link(&key.1)
            .map_err(|source: TransportError| RegistryError::PeerHandle { peer: key.1.clone(), source })?;
        self.next_id += 1;
        let session = PeerSession::new(self.next_id, key.1.clone(), connection, handle);
        debug!("Created peer session {} -> {} (id {})", key.0, key.1, self.next_id);
        self.peers.insert(key, session.clone());
        Ok(PeerEntry::Created(session, events))
    }

    /// Close and forget every peer opened through `connection`. Returns how many were removed.
    pub fn remove_connection(&mut self, connection: &IdentityKey) -> usize {
        let before = self.peers.len();
        self.peers.retain(|(conn, _), peer| {
            if conn == connection {
                peer.close();
                false
            } else {
                true
            }
        });
        before - self.peers.len()
    }

    pub fn count_for(&self, connection: &IdentityKey) -> usize {
        self.peers.keys().filter(|(conn, _)| conn == connection).count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        for peer in self.peers.values() {
            peer.close();
        }
        self.peers.clear();
    }
}

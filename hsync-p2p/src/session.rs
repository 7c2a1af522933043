use crate::errors::TransportError;
use crate::router::{MessageRouter, SessionEvent};
use crate::transport::{ConnectionEvent, ConnectionHandle, PeerLink};
use libhsync::{ConnectionConfig, ConnectionStatus, IdentityKey, MessageKind};
use log::*;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::watch;
use tokio::task::AbortHandle;

pub(crate) struct SessionInner {
    id: u64,
    key: IdentityKey,
    config: ConnectionConfig,
    handle: Box<dyn ConnectionHandle>,
    status: watch::Sender<ConnectionStatus>,
    subscribers: AtomicUsize,
    ended: AtomicBool,
    forwarder: Mutex<Option<AbortHandle>>,
    router: MessageRouter,
}

/// One live connection to a remote hsync server, shared by every caller that resolved the same identity.
///
/// Cloning is cheap and every clone is the same session. Only the registry event loop changes a session's status or
/// ends its handle; callers read the status, watch it, and subscribe to its [`MessageRouter`].
#[derive(Clone)]
pub struct ConnectionSession {
    inner: Arc<SessionInner>,
}

impl ConnectionSession {
    pub(crate) fn new(id: u64, key: IdentityKey, config: ConnectionConfig, handle: Box<dyn ConnectionHandle>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let inner = SessionInner {
            id,
            key,
            config,
            handle,
            status,
            subscribers: AtomicUsize::new(0),
            ended: AtomicBool::new(false),
            forwarder: Mutex::new(None),
            router: MessageRouter::new(),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Unique per build. A session rebuilt under the same key gets a new id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn key(&self) -> &IdentityKey {
        &self.inner.key
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Waits until the session reports `Connected`. Returns the terminal status instead if the session closes first.
    pub async fn connected(&self) -> ConnectionStatus {
        let mut watcher = self.watch_status();
        let result = watcher
            .wait_for(|s| matches!(s, ConnectionStatus::Connected | ConnectionStatus::Closed))
            .await
            .map(|s| *s);
        result.unwrap_or(ConnectionStatus::Closed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.load(Ordering::SeqCst)
    }

    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    pub fn same_session(&self, other: &ConnectionSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.inner))
    }

    pub(crate) fn add_subscriber(&self) -> usize {
        self.inner.subscribers.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the remaining count. Never goes below zero.
    pub(crate) fn release_subscriber(&self) -> usize {
        let previous = self
            .inner
            .subscribers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    /// Attach the task feeding this session's transport events into the registry. It is aborted when the session ends.
    pub(crate) fn set_forwarder(&self, forwarder: AbortHandle) {
        if self.is_ended() {
            forwarder.abort();
            return;
        }
        let previous = self.inner.forwarder.lock().unwrap_or_else(PoisonError::into_inner).replace(forwarder);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.inner.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            trace!("Connection {} is now {status}", self.inner.key);
            self.inner.router.publish(SessionEvent::Status(status));
        }
    }

    /// Ends the underlying handle. Only the first call has any effect; returns whether this call ended it.
    pub(crate) fn end(&self) -> bool {
        if self.inner.ended.swap(true, Ordering::SeqCst) {
            trace!("Connection {} was already ended", self.inner.key);
            return false;
        }
        info!("Ending connection {} (session {})", self.inner.key, self.inner.id);
        if self.status() != ConnectionStatus::Closed {
            self.set_status(ConnectionStatus::Closing);
        }
        self.inner.handle.end(true);
        if let Some(forwarder) = self.inner.forwarder.lock().unwrap_or_else(PoisonError::into_inner).take() {
            forwarder.abort();
        }
        self.set_status(ConnectionStatus::Closed);
        true
    }

    pub(crate) fn open_peer_link(&self, peer: &IdentityKey) -> Result<PeerLink, TransportError> {
        if self.is_ended() {
            return Err(TransportError::new(format!("connection {} has been ended", self.inner.key)));
        }
        self.inner.handle.peer_handle(peer)
    }

    /// Apply an event raised by the underlying handle.
    pub(crate) fn apply(&self, event: ConnectionEvent) {
        let key = &self.inner.key;
        match event {
            ConnectionEvent::Connected => {
                if self.is_ended() {
                    debug!("Ignoring connected event for ended connection {key}");
                    return;
                }
                info!("Connection {key} connected");
                self.set_status(ConnectionStatus::Connected);
            }
            ConnectionEvent::Disconnected => {
                if !self.is_ended() {
                    warn!("Connection {key} disconnected");
                    self.set_status(ConnectionStatus::Disconnected);
                }
            }
            ConnectionEvent::Closed => {
                info!("Connection {key} closed by transport");
                self.set_status(ConnectionStatus::Closed);
            }
            ConnectionEvent::Error(detail) => {
                warn!("Connection {key} reported an error: {detail}");
                self.inner.router.publish(SessionEvent::Error(detail));
            }
            ConnectionEvent::Json(body) => {
                self.inner.router.publish(SessionEvent::Message { kind: MessageKind::Json, body });
            }
            ConnectionEvent::ExternalMessage(body) => {
                self.inner.router.publish(SessionEvent::Message { kind: MessageKind::ExternalMessage, body });
            }
        }
    }
}

impl Debug for ConnectionSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("status", &self.status())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// A non-owning reference to a session, held by the peer sessions opened through it.
#[derive(Clone)]
pub(crate) struct WeakSession(Weak<SessionInner>);

impl WeakSession {
    pub fn upgrade(&self) -> Option<ConnectionSession> {
        self.0.upgrade().map(|inner| ConnectionSession { inner })
    }
}

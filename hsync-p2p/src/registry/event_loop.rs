use super::commands::{ConnectionInfo, LoopEvent, RegistryCommand, ReleaseOutcome};
use crate::errors::{RegistryError, TransportError};
use crate::peer::{PeerEntry, PeerRegistry, PeerSession};
use crate::session::ConnectionSession;
use crate::transport::{ConnectionEvent, Established, PeerEvent, Transport};
use futures::channel::{mpsc, oneshot};
use futures::stream::BoxStream;
use futures::StreamExt;
use libhsync::{ConnectionConfig, ConnectionStatus, IdentityKey};
use log::*;
use std::collections::HashMap;
use std::sync::Arc;

type Waiter = oneshot::Sender<Result<ConnectionSession, RegistryError>>;

struct PendingBuild {
    build_id: u64,
    config: ConnectionConfig,
    waiters: Vec<Waiter>,
}

enum Entry {
    Building(PendingBuild),
    Live(ConnectionSession),
}

/// Owns every connection, in-flight build and peer channel. Nothing else mutates them.
///
/// Commands from [`super::ConnectionRegistry`] and events from the transport are handled one at a time, each to
/// completion, so the maps need no locking. Establishing a connection happens in a spawned task; its result comes back
/// as an event.
pub struct RegistryEventLoop<T: Transport> {
    transport: Arc<T>,
    commands: mpsc::Receiver<RegistryCommand>,
    events: mpsc::UnboundedReceiver<LoopEvent>,
    event_sender: mpsc::UnboundedSender<LoopEvent>,
    entries: HashMap<IdentityKey, Entry>,
    peers: PeerRegistry,
    next_id: u64,
}

impl<T: Transport> RegistryEventLoop<T> {
    pub(crate) fn new(transport: T, commands: mpsc::Receiver<RegistryCommand>) -> Self {
        let (event_sender, events) = mpsc::unbounded();
        Self {
            transport: Arc::new(transport),
            commands,
            events,
            event_sender,
            entries: HashMap::new(),
            peers: PeerRegistry::new(),
            next_id: 0,
        }
    }

    /// Runs until a shutdown command arrives or every [`super::ConnectionRegistry`] handle has been dropped.
    pub async fn run(mut self) {
        debug!("Connection registry event loop started");
        loop {
            tokio::select! {
                command = self.commands.next() => match command {
                    Some(RegistryCommand::Shutdown(sender)) => {
                        self.shutdown();
                        let _ = sender.send(true);
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All registry handles dropped");
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = self.events.next() => self.handle_event(event),
            }
        }
        debug!("Connection registry event loop stopped");
    }

    fn handle_command(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Resolve { config, sender } => self.resolve(config, sender),
            RegistryCommand::Release { session, removed, sender } => {
                let outcome = self.release(&session, removed);
                let _ = sender.send(outcome);
            }
            RegistryCommand::GetPeer { connection, peer, sender } => {
                let result = self.get_peer(&connection, peer);
                let _ = sender.send(result);
            }
            RegistryCommand::Connections { sender } => {
                let _ = sender.send(self.connection_info());
            }
            RegistryCommand::Shutdown(sender) => {
                // Handled in `run`, since it stops the loop.
                let _ = sender.send(false);
            }
        }
    }

    fn handle_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Built { key, build_id, result } => self.on_built(key, build_id, result),
            LoopEvent::Connection { key, session_id, event } => self.on_connection_event(&key, session_id, event),
            LoopEvent::Peer { connection, peer, peer_id, event } => {
                match self.peers.get(&connection, &peer) {
                    Some(session) if session.id() == peer_id => session.apply(event),
                    _ => trace!("Dropping event for retired peer channel {connection} -> {peer}: {event:?}"),
                }
            }
        }
    }

    fn resolve(&mut self, config: ConnectionConfig, sender: Waiter) {
        let key = config.identity_key();
        match self.entries.get_mut(&key) {
            Some(Entry::Live(session)) if session.config() == &config && is_reusable(session) => {
                let subscribers = session.add_subscriber();
                debug!("Reusing connection {key} (session {}, {subscribers} subscribers)", session.id());
                if sender.send(Ok(session.clone())).is_err() {
                    session.release_subscriber();
                }
                return;
            }
            Some(Entry::Building(pending)) if pending.config == config => {
                debug!("Joining in-flight build of {key}");
                pending.waiters.push(sender);
                return;
            }
            _ => {}
        }
        if let Some(previous) = self.entries.remove(&key) {
            self.retire(&key, previous);
        }
        self.start_build(key, config, sender);
    }

    /// End whatever is registered under `key`, before a new build replaces it.
    fn retire(&mut self, key: &IdentityKey, entry: Entry) {
        match entry {
            Entry::Live(session) => {
                if is_reusable(&session) {
                    info!("Connection {key} superseded by a new configuration");
                } else {
                    debug!("Rebuilding closed connection {key}");
                }
                self.peers.remove_connection(key);
                session.end();
            }
            Entry::Building(pending) => {
                info!("In-flight build of {key} superseded; {} waiter(s) notified", pending.waiters.len());
                for waiter in pending.waiters {
                    let _ = waiter.send(Err(RegistryError::Superseded(key.clone())));
                }
            }
        }
    }

    fn start_build(&mut self, key: IdentityKey, config: ConnectionConfig, sender: Waiter) {
        self.next_id += 1;
        let build_id = self.next_id;
        debug!("Establishing connection {key} (build {build_id})");
        let transport = Arc::clone(&self.transport);
        let events = self.event_sender.clone();
        let build_key = key.clone();
        let build_config = config.clone();
        tokio::spawn(async move {
            let result = transport.establish(build_config).await;
            if let Err(err) = events.unbounded_send(LoopEvent::Built { key: build_key, build_id, result }) {
                if let LoopEvent::Built { key, result: Ok(established), .. } = err.into_inner() {
                    warn!("Registry stopped while {key} was being established; ending the new connection");
                    established.handle.end(true);
                }
            }
        });
        self.entries.insert(key, Entry::Building(PendingBuild { build_id, config, waiters: vec![sender] }));
    }

    fn on_built(&mut self, key: IdentityKey, build_id: u64, result: Result<Established, TransportError>) {
        let current = matches!(self.entries.get(&key), Some(Entry::Building(p)) if p.build_id == build_id);
        if !current {
            match result {
                Ok(established) => {
                    info!("Superseded build {build_id} of {key} resolved; ending it");
                    established.handle.end(true);
                }
                Err(err) => debug!("Superseded build {build_id} of {key} failed: {err}"),
            }
            return;
        }
        let Some(Entry::Building(pending)) = self.entries.remove(&key) else {
            return;
        };
        match result {
            Ok(Established { handle, events }) => {
                let session = ConnectionSession::new(build_id, key.clone(), pending.config, handle);
                self.forward_connection_events(&session, events);
                for waiter in pending.waiters {
                    session.add_subscriber();
                    if waiter.send(Ok(session.clone())).is_err() {
                        session.release_subscriber();
                    }
                }
                info!("Connection {key} established with {} subscriber(s)", session.subscriber_count());
                self.entries.insert(key, Entry::Live(session));
            }
            Err(source) => {
                warn!("Could not establish connection {key}: {source}");
                let err = RegistryError::TransportEstablish { key, source };
                for waiter in pending.waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
        }
    }

    fn on_connection_event(&mut self, key: &IdentityKey, session_id: u64, event: ConnectionEvent) {
        let session = match self.entries.get(key) {
            Some(Entry::Live(session)) if session.id() == session_id => session.clone(),
            _ => {
                trace!("Dropping event for retired connection {key}: {event:?}");
                return;
            }
        };
        let closed = event == ConnectionEvent::Closed;
        session.apply(event);
        if closed {
            let count = self.peers.remove_connection(key);
            if count > 0 {
                debug!("Closed {count} peer channel(s) of {key}");
            }
        }
    }

    fn release(&mut self, session: &ConnectionSession, removed: bool) -> ReleaseOutcome {
        let key = session.key();
        let registered = matches!(self.entries.get(key), Some(Entry::Live(s)) if s.same_session(session));
        if !registered {
            debug!("Ignoring release of stale session {} for {key}", session.id());
            return ReleaseOutcome::NotRegistered;
        }
        let remaining = session.release_subscriber();
        if !removed {
            trace!("Released {key} for restart; {remaining} subscriber(s) left");
            return ReleaseOutcome::Retained { subscribers: remaining };
        }
        self.entries.remove(key);
        self.peers.remove_connection(key);
        session.end();
        ReleaseOutcome::Ended
    }

    fn get_peer(&mut self, connection: &ConnectionSession, peer: IdentityKey) -> Result<PeerSession, RegistryError> {
        let key = connection.key();
        let registered = matches!(self.entries.get(key), Some(Entry::Live(s)) if s.same_session(connection));
        if !registered || connection.is_ended() {
            return Err(RegistryError::StaleSession(key.clone()));
        }
        match self.peers.get_or_create(connection, peer)? {
            PeerEntry::Existing(session) => Ok(session),
            PeerEntry::Created(session, events) => {
                self.forward_peer_events(&session, events);
                Ok(session)
            }
        }
    }

    fn connection_info(&self) -> Vec<ConnectionInfo> {
        let mut info = self
            .entries
            .iter()
            .map(|(key, entry)| match entry {
                Entry::Building(pending) => ConnectionInfo {
                    key: key.clone(),
                    status: ConnectionStatus::Connecting,
                    subscribers: pending.waiters.len(),
                    building: true,
                    peers: 0,
                },
                Entry::Live(session) => ConnectionInfo {
                    key: key.clone(),
                    status: session.status(),
                    subscribers: session.subscriber_count(),
                    building: false,
                    peers: self.peers.count_for(key),
                },
            })
            .collect::<Vec<_>>();
        info.sort_by(|a, b| a.key.cmp(&b.key));
        info
    }

    /// Feed the session's transport events into the loop until the stream ends or the session is ended.
    fn forward_connection_events(&self, session: &ConnectionSession, mut events: BoxStream<'static, ConnectionEvent>) {
        let sender = self.event_sender.clone();
        let key = session.key().clone();
        let session_id = session.id();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let event = LoopEvent::Connection { key: key.clone(), session_id, event };
                if sender.unbounded_send(event).is_err() {
                    break;
                }
            }
            trace!("Event stream for {key} (session {session_id}) ended");
        });
        session.set_forwarder(task.abort_handle());
    }

    fn forward_peer_events(&self, session: &PeerSession, mut events: BoxStream<'static, PeerEvent>) {
        let sender = self.event_sender.clone();
        let connection = session.local_key().clone();
        let peer = session.peer_key().clone();
        let peer_id = session.id();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let event = LoopEvent::Peer { connection: connection.clone(), peer: peer.clone(), peer_id, event };
                if sender.unbounded_send(event).is_err() {
                    break;
                }
            }
        });
        session.set_forwarder(task.abort_handle());
    }

    fn shutdown(&mut self) {
        info!("Shutting down connection registry ({} entries)", self.entries.len());
        self.peers.clear();
        for (key, entry) in self.entries.drain() {
            match entry {
                Entry::Live(session) => {
                    session.end();
                }
                Entry::Building(pending) => {
                    trace!("Abandoning in-flight build of {key}");
                    for waiter in pending.waiters {
                        let _ = waiter.send(Err(RegistryError::RegistryClosed));
                    }
                }
            }
        }
    }
}

fn is_reusable(session: &ConnectionSession) -> bool {
    !session.is_ended() && session.status() != ConnectionStatus::Closed
}

//! Event fan-out and outbound message routing.
//!
//! [`EventBus`] is the subscribe/unsubscribe/publish capability shared by connection and peer sessions. Every handler
//! registered for a topic receives every event published on it, in publish order, exactly once, and each handler gets
//! its own clone of the event. Handlers run outside the bus lock, so a handler may subscribe or unsubscribe.
//!
//! [`Outbound`] sends a flow message either through the HTTP relay or through an open peer channel.

use crate::errors::DeliveryError;
use crate::peer::{PeerSession, SendOutcome};
use crate::relay::RelayClient;
use futures::channel::mpsc;
use libhsync::{ConnectionStatus, MessageKind, OutboundMessage, RtcStatus};
use log::*;
use serde_json::Value;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

struct BusInner<K, T> {
    next_id: u64,
    handlers: HashMap<K, Vec<(u64, Handler<T>)>>,
}

pub struct EventBus<K, T> {
    inner: Arc<Mutex<BusInner<K, T>>>,
}

impl<K, T> Clone for EventBus<K, T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<K, T> Default for EventBus<K, T> {
    fn default() -> Self {
        Self { inner: Arc::new(Mutex::new(BusInner { next_id: 0, handlers: HashMap::new() })) }
    }
}

impl<K, T> EventBus<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusInner<K, T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe<F>(&self, kind: K, handler: F) -> SubscriptionHandle
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.handlers.entry(kind).or_default().push((id, Arc::new(handler)));
        SubscriptionHandle(id)
    }

    /// Subscribe with a channel instead of a callback. Events are queued until the receiver reads them.
    pub fn subscribe_channel(&self, kind: K) -> (SubscriptionHandle, mpsc::UnboundedReceiver<T>) {
        let (sender, receiver) = mpsc::unbounded();
        let handle = self.subscribe(kind, move |event| {
            if sender.unbounded_send(event).is_err() {
                trace!("Subscription receiver dropped; event discarded");
            }
        });
        (handle, receiver)
    }

    /// Returns false if the handle was not subscribed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut inner = self.lock();
        let mut found = false;
        for handlers in inner.handlers.values_mut() {
            let before = handlers.len();
            handlers.retain(|(id, _)| *id != handle.0);
            found |= handlers.len() != before;
        }
        inner.handlers.retain(|_, handlers| !handlers.is_empty());
        found
    }

    /// Deliver `payload` to every handler subscribed to `kind`. Returns the number of handlers called.
    pub fn publish(&self, kind: &K, payload: T) -> usize {
        let handlers: Vec<Handler<T>> = match self.lock().handlers.get(kind) {
            Some(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return 0,
        };
        for handler in &handlers {
            handler(payload.clone());
        }
        handlers.len()
    }

    pub fn subscriber_count(&self, kind: &K) -> usize {
        self.lock().handlers.get(kind).map(Vec::len).unwrap_or(0)
    }

    pub fn clear(&self) {
        self.lock().handlers.clear();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    Status,
    Error,
    Message(MessageKind),
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Status(ConnectionStatus),
    Rtc(RtcStatus),
    Error(String),
    Message { kind: MessageKind, body: Value },
}

impl SessionEvent {
    pub fn topic(&self) -> Topic {
        match self {
            SessionEvent::Status(_) | SessionEvent::Rtc(_) => Topic::Status,
            SessionEvent::Error(_) => Topic::Error,
            SessionEvent::Message { kind, .. } => Topic::Message(*kind),
        }
    }
}

/// The event bus of one connection or peer session.
#[derive(Clone, Default)]
pub struct MessageRouter {
    bus: EventBus<Topic, SessionEvent>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, topic: Topic, handler: F) -> SubscriptionHandle
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(topic, handler)
    }

    /// Subscribe to the message bodies of one kind.
    pub fn on_message<F>(&self, kind: MessageKind, handler: F) -> SubscriptionHandle
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.bus.subscribe(Topic::Message(kind), move |event| {
            if let SessionEvent::Message { body, .. } = event {
                handler(body);
            }
        })
    }

    pub fn channel(&self, topic: Topic) -> (SubscriptionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        self.bus.subscribe_channel(topic)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.bus.unsubscribe(handle)
    }

    pub fn publish(&self, event: SessionEvent) -> usize {
        let topic = event.topic();
        self.bus.publish(&topic, event)
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.bus.subscriber_count(&topic)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted by the relay.
    Relayed,
    /// Handed to an open peer channel.
    Sent,
    /// The peer channel was not open.
    Dropped,
}

/// Where an outbound flow message goes.
#[derive(Clone)]
pub enum Outbound {
    Relay(RelayClient),
    Peer(PeerSession),
}

impl Outbound {
    pub async fn deliver(&self, message: &Value) -> Result<Delivery, DeliveryError> {
        match self {
            Outbound::Relay(relay) => {
                relay.publish(&OutboundMessage::from_flow(message)).await?;
                Ok(Delivery::Relayed)
            }
            Outbound::Peer(peer) => match peer.send(message.clone())? {
                SendOutcome::Sent => Ok(Delivery::Sent),
                SendOutcome::Dropped => Ok(Delivery::Dropped),
            },
        }
    }
}

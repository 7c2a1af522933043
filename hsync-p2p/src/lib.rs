//! Shared connections to remote hsync servers, direct peer data channels, and message routing.
//!
//! - [`registry`] keeps one [`ConnectionSession`] per remote identity, shared by every caller that resolves it.
//! - [`peer`] manages the [`PeerSession`] state machine for channels opened through a connection.
//! - [`router`] fans session events out to subscribers and delivers outbound messages.
//! - [`relay`] posts messages to the HTTP relay.
//! - [`transport`] is the boundary to the code that does the actual networking; [`loopback`] implements it in memory.
//! - [`nodes`] adapts all of the above to a flow host.
pub mod errors;
pub mod loopback;
pub mod nodes;
pub mod peer;
pub mod registry;
pub mod relay;
pub mod router;
pub mod session;
pub mod transport;

pub use errors::{ConfigurationError, DeliveryError, PeerError, RegistryError, RelayError, TransportError};
pub use nodes::{ConnectionNode, InNode, NodeHost, OutNode};
pub use peer::{PeerSession, SendOutcome};
pub use registry::{new_registry, ConnectionInfo, ConnectionRegistry, RegistryEventLoop, ReleaseOutcome};
pub use relay::RelayClient;
pub use router::{Delivery, EventBus, MessageRouter, Outbound, SessionEvent, SubscriptionHandle, Topic};
pub use session::ConnectionSession;
pub use transport::{ConnectionEvent, ConnectionHandle, Established, PeerEvent, PeerHandle, PeerLink, Transport};

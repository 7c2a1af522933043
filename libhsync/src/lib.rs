//! Core types shared by the hsync connection registry and its adapters.
//!
//! - [`identity`] turns remote addresses into canonical [`IdentityKey`]s.
//! - [`config`] holds [`ConnectionConfig`] and the YAML [`BridgeConfig`] file format.
//! - [`secret`] wraps credentials so they are wiped on drop and never printed.
//! - [`status`] holds the connection and peer-channel status enums, and the host status indicator.
//! - [`message`] has the flow message helpers (stamping, relay bodies, message kinds).
pub mod config;
pub mod error;
pub mod identity;
pub mod message;
pub mod secret;
pub mod status;

pub use config::{BridgeConfig, ConnectionConfig, ConnectionPlan, NamedConnection, PlanAction, RelayTarget};
pub use error::ConfigError;
pub use identity::{display_host, IdentityKey};
pub use message::{MessageKind, OutboundMessage, DEFAULT_TOPIC};
pub use secret::Secret;
pub use status::{ConnectionStatus, RtcStatus, StatusColor, StatusIndicator, StatusShape};

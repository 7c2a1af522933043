//! The connection registry: one shared session per remote identity.
//!
//! [`new_registry`] returns two halves:
//!
//! - [`ConnectionRegistry`], a cloneable handle for resolving, releasing and inspecting sessions from anywhere.
//! - [`RegistryEventLoop`], which owns all state and must be driven, typically with `tokio::spawn(event_loop.run())`.
//!
//! ```ignore
//! let (registry, event_loop) = new_registry(LoopbackTransport::new());
//! tokio::spawn(event_loop.run());
//! let session = registry.resolve(ConnectionConfig::new("wss://node-a.example", "secret")).await?;
//! session.connected().await;
//! ```

mod client;
mod commands;
mod event_loop;

pub use client::ConnectionRegistry;
pub use commands::{ConnectionInfo, ReleaseOutcome};
pub use event_loop::RegistryEventLoop;

use crate::transport::Transport;
use futures::channel::mpsc;

pub fn new_registry<T: Transport>(transport: T) -> (ConnectionRegistry, RegistryEventLoop<T>) {
    let (command_sender, command_receiver) = mpsc::channel(0);
    (ConnectionRegistry::new(command_sender), RegistryEventLoop::new(transport, command_receiver))
}

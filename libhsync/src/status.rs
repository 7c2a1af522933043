use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Lifecycle of a shared connection session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    /// The transport is establishing the connection, or has resolved but not yet reported `connected`.
    Connecting,
    Connected,
    /// The handle is being ended.
    Closing,
    /// The handle was ended. A closed session is never reused.
    Closed,
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "Disconnected"),
            ConnectionStatus::Connecting => write!(f, "Connecting"),
            ConnectionStatus::Connected => write!(f, "Connected"),
            ConnectionStatus::Closing => write!(f, "Closing"),
            ConnectionStatus::Closed => write!(f, "Closed"),
        }
    }
}

/// Lifecycle of a direct peer data channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RtcStatus {
    Idle,
    Connecting,
    Open,
    Error,
    Disconnected,
    /// Terminal.
    Closed,
}

impl RtcStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RtcStatus::Closed)
    }
}

impl Display for RtcStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RtcStatus::Idle => write!(f, "Idle"),
            RtcStatus::Connecting => write!(f, "Connecting"),
            RtcStatus::Open => write!(f, "Open"),
            RtcStatus::Error => write!(f, "Error"),
            RtcStatus::Disconnected => write!(f, "Disconnected"),
            RtcStatus::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusColor {
    Red,
    Green,
    Yellow,
    Blue,
    Grey,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusShape {
    Dot,
    Ring,
}

/// The status badge a node shows in the host editor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusIndicator {
    pub fill: StatusColor,
    pub shape: StatusShape,
    pub text: String,
}

impl StatusIndicator {
    pub fn new(fill: StatusColor, shape: StatusShape, text: impl Into<String>) -> Self {
        Self { fill, shape, text: text.into() }
    }

    pub fn error() -> Self {
        Self::new(StatusColor::Red, StatusShape::Ring, "error")
    }

    pub fn connected(host: impl Into<String>) -> Self {
        Self::new(StatusColor::Green, StatusShape::Dot, host)
    }

    pub fn connecting() -> Self {
        Self::new(StatusColor::Yellow, StatusShape::Ring, "connecting")
    }

    pub fn disconnected() -> Self {
        Self::new(StatusColor::Grey, StatusShape::Ring, "disconnected")
    }
}

impl Display for StatusIndicator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}/{:?}] {}", self.fill, self.shape, self.text)
    }
}

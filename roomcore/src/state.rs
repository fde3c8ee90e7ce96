//! Connection and transport state machines.

use serde::Serialize;
use std::fmt;

/// State of the signaling connection, shared by every component to gate its operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Reconnection attempts are exhausted. Only an explicit reconnect leaves this state.
    Error,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of a send or receive media transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// A transport in one of these states can still carry producers and consumers.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::New | Self::Connecting | Self::Connected)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }

    /// Validates a transition reported by the media engine.
    ///
    /// Re-reporting the current state is accepted as a no-op. `failed` and
    /// `disconnected` are only reachable once a handshake has started, and
    /// nothing leaves `closed`.
    pub fn transition(self, next: TransportState) -> Result<TransportState, InvalidTransition> {
        use TransportState::*;

        if self == next {
            return Ok(next);
        }

        let allowed = match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (New, Connecting) => true,
            (Connecting, Connected | Disconnected | Failed) => true,
            (Connected, Disconnected | Failed) => true,
            (Disconnected, Connecting | Connected | Failed) => true,
            _ => false,
        };

        if allowed {
            Ok(next)
        } else {
            Err(InvalidTransition {
                current_state: self.as_str().to_string(),
                attempted: next.as_str().to_string(),
            })
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition to {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

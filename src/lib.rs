// Wire types and pure state machines live in roomcore
pub use roomcore;

pub mod config;
pub mod error;
pub mod events;

// Signaling
pub mod pending;
pub mod signaling;

// Media plane
pub mod engine;
pub mod negotiator;
pub mod publisher;
pub mod subscriber;
pub mod transport_manager;

pub mod chat;
pub mod diagnostics;
pub mod recovery;
pub mod session;

#[cfg(test)]
pub mod test_utils;

pub use config::ClientConfig;
pub use error::{ClientError, RecoveryError, SignalingError};
pub use events::EventBus;
pub use session::{JoinStatus, RoomClient};

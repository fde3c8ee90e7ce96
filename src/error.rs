//! Error types for each layer of the client.

use roomcore::{CapabilityError, Direction, MediaKind, ProtocolError, RoomId, TransportId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling channel is not connected")]
    NotConnected,
    #[error("signaling reconnection gave up after {0} attempts")]
    ReconnectExhausted(u32),
    #[error("signaling channel is already running")]
    AlreadyRunning,
    #[error("socket error: {0}")]
    Socket(#[from] anyhow::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("capabilities not ready")]
    NotReady,
    #[error("invalid capability descriptor: {0}")]
    InvalidDescriptor(#[from] CapabilityError),
    #[error("media engine rejected capabilities: {0}")]
    Engine(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("capabilities not ready")]
    CapabilitiesNotReady,
    #[error("signaling channel is not connected")]
    NotConnected,
    #[error("{0} transport request superseded by a newer request")]
    Superseded(Direction),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("server rejected transport creation: {0}")]
    Rejected(String),
    #[error("transport is closed")]
    Closed,
    #[error("operation not supported on a {0} transport")]
    WrongDirection(Direction),
    #[error("transport {0} is no longer active")]
    Stale(TransportId),
    #[error("signaling closed while waiting for {0}")]
    SignalingClosed(&'static str),
    #[error("media engine error: {0}")]
    Engine(String),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("signaling channel is not connected")]
    NotConnected,
    #[error("track is {track} but was published as {requested}")]
    KindMismatch {
        track: MediaKind,
        requested: MediaKind,
    },
    #[error("track has ended")]
    TrackEnded,
    #[error("{0} publish superseded by a newer publish of the same kind")]
    Superseded(MediaKind),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("signaling channel is not connected")]
    NotConnected,
    #[error("capabilities not ready")]
    CapabilitiesNotReady,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("a recovery is already in progress")]
    AlreadyInProgress,
    #[error("signaling channel is not connected")]
    NotConnected,
    #[error("transport recreation failed: {0}")]
    Transport(#[from] TransportError),
    #[error("republish failed: {0}")]
    Publish(#[from] PublishError),
    #[error("roster request failed: {0}")]
    Subscribe(#[from] SubscribeError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("signaling channel is not connected")]
    NotConnected,
    #[error("not joined to a room")]
    NotJoined,
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("permission to use media devices was denied")]
    PermissionDenied,
    #[error("no {0} device found")]
    NotFound(MediaKind),
    #[error("media device error: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("room {0} is full")]
    RoomFull(RoomId),
    #[error("join rejected by server: {0}")]
    JoinRejected(String),
    #[error("not joined to a room")]
    NotJoined,
    #[error("timed out waiting for join confirmation")]
    JoinTimeout,
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Subscribe(#[from] SubscribeError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

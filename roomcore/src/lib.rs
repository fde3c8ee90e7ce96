//! Runtime-free building blocks for the room call client.
//!
//! Everything in this crate is plain data and synchronous state: the
//! signaling topics and their JSON payloads, identifier newtypes, the
//! transport state machine, the remote publisher registry, capability
//! descriptors and the chat log. The tokio client in the `roomcall` crate
//! drives these types from network events.

pub mod capabilities;
pub mod chat;
pub mod messages;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod types;

pub use capabilities::{CapabilityDescriptor, CapabilityError};
pub use protocol::{Envelope, ProtocolError, Topic};
pub use registry::{BeginConsume, ConsumptionStatus, PublisherRegistry};
pub use state::{ConnectionState, InvalidTransition, TransportState};
pub use types::{ConsumerId, Direction, MediaKind, ProducerId, PublisherId, RoomId, TransportId};

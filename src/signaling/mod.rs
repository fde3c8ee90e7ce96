pub mod channel;
pub mod dispatcher;
pub mod socket;
pub mod websocket;

#[cfg(test)]
pub mod mock;

pub use channel::SignalingChannel;
pub use dispatcher::{HandlerId, OnceWaiter, Subscription, TopicDispatcher};
pub use socket::{Socket, SocketEvent, SocketFactory};
pub use websocket::WebSocketFactory;

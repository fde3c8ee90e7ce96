use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An event produced by a signaling socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// The socket has successfully connected.
    Connected,
    /// A text frame has been received from the server.
    Message(String),
    /// The connection was lost.
    Disconnected,
}

/// Represents an active signaling connection.
#[async_trait]
pub trait Socket: Send + Sync {
    /// Sends a text frame to the server.
    async fn send_text(&self, text: String) -> Result<(), anyhow::Error>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for dialing new sockets.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    /// Dials `url` and returns the socket along with its stream of events.
    async fn create_socket(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Socket>, mpsc::Receiver<SocketEvent>), anyhow::Error>;
}

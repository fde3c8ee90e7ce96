//! WebSocket signaling socket built on tokio-tungstenite.

use super::socket::{Socket, SocketEvent, SocketFactory};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const EVENT_CHANNEL_CAPACITY: usize = 100;

pub struct WebSocketSocket {
    ws_sink: Mutex<Option<WsSink>>,
}

#[async_trait]
impl Socket for WebSocketSocket {
    async fn send_text(&self, text: String) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;

        trace!(target: "Room/Signaling", "--> {} bytes", text.len());
        sink.send(Message::text(text))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {}", e))?;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(mut sink) = self.ws_sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!(target: "Room/Signaling", "Error closing websocket: {e}");
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketFactory;

impl WebSocketFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SocketFactory for WebSocketFactory {
    async fn create_socket(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Socket>, mpsc::Receiver<SocketEvent>), anyhow::Error> {
        info!(target: "Room/Signaling", "Dialing {url}");
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;

        let (sink, stream) = ws.split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let socket = Arc::new(WebSocketSocket {
            ws_sink: Mutex::new(Some(sink)),
        });

        // Connected must be queued before the pump can queue anything else.
        let _ = event_tx.send(SocketEvent::Connected).await;
        tokio::spawn(read_pump(stream, event_tx));

        Ok((socket, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<SocketEvent>) {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                trace!(target: "Room/Signaling", "<-- {} bytes", text.len());
                if event_tx
                    .send(SocketEvent::Message(text.as_str().to_owned()))
                    .await
                    .is_err()
                {
                    warn!(target: "Room/Signaling", "Event receiver dropped, closing read pump");
                    break;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(target: "Room/Signaling", "Received close frame: {frame:?}");
                break;
            }
            Some(Ok(Message::Binary(data))) => {
                warn!(target: "Room/Signaling", "Ignoring unexpected binary frame ({} bytes)", data.len());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(target: "Room/Signaling", "Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!(target: "Room/Signaling", "Websocket stream ended");
                break;
            }
        }
    }

    let _ = event_tx.send(SocketEvent::Disconnected).await;
}

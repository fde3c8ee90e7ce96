use crate::config::ClientConfig;
use crate::error::ChatError;
use crate::events::EventBus;
use crate::signaling::SignalingChannel;
use log::{debug, info};
use roomcore::RoomId;
use roomcore::chat::{ChatLog, ChatMessage};
use roomcore::messages::ChatPayload;
use std::sync::{Arc, Mutex};

/// Best-effort text messages scoped to the joined room.
///
/// Independent of media state: chat works as long as signaling is up.
pub struct SessionMessaging {
    config: Arc<ClientConfig>,
    signaling: Arc<SignalingChannel>,
    events: Arc<EventBus>,
    log: Mutex<ChatLog>,
}

impl SessionMessaging {
    pub fn new(
        config: Arc<ClientConfig>,
        signaling: Arc<SignalingChannel>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            signaling,
            events,
            log: Mutex::new(ChatLog::new()),
        }
    }

    /// Sends `body` to the room and appends it to the local log as the local author.
    pub async fn send(&self, room_id: &RoomId, body: &str) -> Result<ChatMessage, ChatError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if !self.signaling.is_connected() {
            return Err(ChatError::NotConnected);
        }
        let payload = ChatPayload {
            room_name: room_id.clone(),
            user: self.config.display_name.clone(),
            message: body.to_string(),
        };
        self.signaling
            .send(roomcore::Topic::ChatMessage, &payload)
            .await?;

        let message = ChatMessage::local(room_id.clone(), body.to_string());
        self.append(message.clone());
        debug!(target: "Room/Chat", "Sent message to {room_id}");
        Ok(message)
    }

    /// Records a message pushed by the server.
    pub fn on_incoming(&self, payload: ChatPayload) -> ChatMessage {
        let message = ChatMessage::from_payload(payload);
        info!(target: "Room/Chat", "{}: {}", message.author, message.body);
        self.append(message.clone());
        message
    }

    fn append(&self, message: ChatMessage) {
        if let Ok(mut log) = self.log.lock() {
            log.push(message.clone());
        }
        let _ = self.events.chat.send(Arc::new(message));
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.log
            .lock()
            .map(|log| log.messages().to_vec())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut log) = self.log.lock() {
            log.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::mock::MockSocketFactory;
    use roomcore::Topic;
    use roomcore::chat::LOCAL_AUTHOR;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_and_receive_are_logged_in_order() {
        let config = Arc::new(ClientConfig {
            display_name: "Ana".into(),
            ..Default::default()
        });
        let events = Arc::new(EventBus::new());
        let factory = Arc::new(MockSocketFactory::new());
        let peer = factory.peer();
        let signaling = SignalingChannel::new(config.clone(), factory, events.clone());
        signaling.connect().await.expect("connect");
        let chat = SessionMessaging::new(config, signaling.clone(), events);
        let room = RoomId::new("S1");

        assert!(matches!(
            chat.send(&room, "   ").await,
            Err(ChatError::EmptyMessage)
        ));

        chat.send(&room, " hello ").await.expect("send");
        assert_eq!(
            peer.expect(Topic::ChatMessage).await,
            json!({"roomName": "S1", "user": "Ana", "message": "hello"})
        );
        chat.on_incoming(ChatPayload {
            room_name: room.clone(),
            user: "Bo".into(),
            message: "hi".into(),
        });

        let authors: Vec<_> = chat.messages().into_iter().map(|m| m.author).collect();
        assert_eq!(authors, vec![LOCAL_AUTHOR.to_string(), "Bo".to_string()]);

        signaling.disconnect().await;
        assert!(matches!(
            chat.send(&room, "later").await,
            Err(ChatError::NotConnected)
        ));
    }
}

//! Session-scoped chat log.

use crate::messages::ChatPayload;
use crate::types::RoomId;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Author label used for messages this client sent.
pub const LOCAL_AUTHOR: &str = "You";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub room_id: RoomId,
    pub author: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub local: bool,
}

impl ChatMessage {
    pub fn local(room_id: RoomId, body: String) -> Self {
        Self {
            room_id,
            author: LOCAL_AUTHOR.to_string(),
            body,
            received_at: Utc::now(),
            local: true,
        }
    }

    pub fn from_payload(payload: ChatPayload) -> Self {
        Self {
            room_id: payload.room_name,
            author: payload.user,
            body: payload.message,
            received_at: Utc::now(),
            local: false,
        }
    }
}

/// Append-only log in local receipt order. No total order across participants.
#[derive(Debug, Default)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

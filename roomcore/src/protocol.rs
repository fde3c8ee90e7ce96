//! Signaling topics and the JSON envelope they travel in.
//!
//! Every signaling message is a single text frame of the form
//! `{"event": "<topic>", "data": <payload>}`. Unknown topics decode fine
//! and are surfaced as `None` from [`Envelope::topic`] so the caller can
//! log and skip them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),
    #[error("invalid payload for {topic}: {source}")]
    InvalidPayload {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {topic}: {source}")]
    Encode {
        topic: Topic,
        #[source]
        source: serde_json::Error,
    },
}

/// Every topic exchanged with the session router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    JoinRoom,
    JoinedRoom,
    ProducerList,
    NewProducer,
    ProducerClosed,
    GetProducers,
    CreateWebRtcTransport,
    CreateWebRtcTransportSuccess,
    CreateWebRtcTransportError,
    TransportConnect,
    TransportConnected,
    TransportProduce,
    Produced,
    Consume,
    Consumed,
    ConsumerResumed,
    ChatMessage,
    Error,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::JoinRoom => "joinRoom",
            Topic::JoinedRoom => "joinedRoom",
            Topic::ProducerList => "producerList",
            Topic::NewProducer => "newProducer",
            Topic::ProducerClosed => "producerClosed",
            Topic::GetProducers => "getProducers",
            Topic::CreateWebRtcTransport => "createWebRtcTransport",
            Topic::CreateWebRtcTransportSuccess => "createWebRtcTransportSuccess",
            Topic::CreateWebRtcTransportError => "createWebRtcTransportError",
            Topic::TransportConnect => "transport-connect",
            Topic::TransportConnected => "transport-connected",
            Topic::TransportProduce => "transport-produce",
            Topic::Produced => "produced",
            Topic::Consume => "consume",
            Topic::Consumed => "consumed",
            Topic::ConsumerResumed => "consumer-resumed",
            Topic::ChatMessage => "chatMessage",
            Topic::Error => "error",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let topic = match s {
            "joinRoom" => Topic::JoinRoom,
            "joinedRoom" => Topic::JoinedRoom,
            "producerList" => Topic::ProducerList,
            "newProducer" => Topic::NewProducer,
            "producerClosed" => Topic::ProducerClosed,
            "getProducers" => Topic::GetProducers,
            "createWebRtcTransport" => Topic::CreateWebRtcTransport,
            "createWebRtcTransportSuccess" => Topic::CreateWebRtcTransportSuccess,
            "createWebRtcTransportError" => Topic::CreateWebRtcTransportError,
            "transport-connect" => Topic::TransportConnect,
            "transport-connected" => Topic::TransportConnected,
            "transport-produce" => Topic::TransportProduce,
            "produced" => Topic::Produced,
            "consume" => Topic::Consume,
            "consumed" => Topic::Consumed,
            "consumer-resumed" => Topic::ConsumerResumed,
            "chatMessage" => Topic::ChatMessage,
            "error" => Topic::Error,
            other => return Err(format!("unknown topic: {other}")),
        };
        Ok(topic)
    }
}

/// Wire envelope around every signaling payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(topic: Topic, data: Value) -> Self {
        Self {
            event: topic.as_str().to_string(),
            data,
        }
    }

    pub fn topic(&self) -> Option<Topic> {
        self.event.parse().ok()
    }

    /// Decodes the payload into a typed message.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        decode_payload(&self.event, &self.data)
    }
}

/// Encodes a typed payload for `topic` into a text frame.
pub fn encode<T: Serialize + ?Sized>(topic: Topic, payload: &T) -> Result<String, ProtocolError> {
    let data =
        serde_json::to_value(payload).map_err(|source| ProtocolError::Encode { topic, source })?;
    serde_json::to_string(&Envelope::new(topic, data))
        .map_err(|source| ProtocolError::Encode { topic, source })
}

/// Decodes a text frame into an envelope without interpreting the payload.
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    serde_json::from_str(text).map_err(ProtocolError::MalformedEnvelope)
}

/// Decodes a raw payload received on `topic`.
pub fn decode_payload<T: DeserializeOwned>(topic: &str, data: &Value) -> Result<T, ProtocolError> {
    T::deserialize(data).map_err(|source| ProtocolError::InvalidPayload {
        topic: topic.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ALL_TOPICS: [Topic; 18] = [
        Topic::JoinRoom,
        Topic::JoinedRoom,
        Topic::ProducerList,
        Topic::NewProducer,
        Topic::ProducerClosed,
        Topic::GetProducers,
        Topic::CreateWebRtcTransport,
        Topic::CreateWebRtcTransportSuccess,
        Topic::CreateWebRtcTransportError,
        Topic::TransportConnect,
        Topic::TransportConnected,
        Topic::TransportProduce,
        Topic::Produced,
        Topic::Consume,
        Topic::Consumed,
        Topic::ConsumerResumed,
        Topic::ChatMessage,
        Topic::Error,
    ];

    #[test]
    fn test_topic_names_are_unique_and_parse_back() {
        let mut seen = std::collections::HashSet::new();
        for topic in ALL_TOPICS {
            assert!(seen.insert(topic.as_str()), "duplicate name {topic}");
            assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
        }
    }

    #[test]
    fn test_encode_wraps_payload() {
        let text = encode(Topic::JoinRoom, &json!({"roomName": "S1"})).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "joinRoom");
        assert_eq!(value["data"]["roomName"], "S1");
    }

    #[test]
    fn test_decode_unknown_topic_is_not_an_error() {
        let envelope = decode(r#"{"event":"somethingNew","data":1}"#).unwrap();
        assert_eq!(envelope.topic(), None);
        assert_eq!(envelope.data, json!(1));
    }

    #[test]
    fn test_decode_missing_data_defaults_to_null() {
        let envelope = decode(r#"{"event":"transport-connected"}"#).unwrap();
        assert_eq!(envelope.topic(), Some(Topic::TransportConnected));
        assert!(envelope.data.is_null());
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            decode("not json"),
            Err(ProtocolError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_payload_type_mismatch_names_topic() {
        let envelope = Envelope::new(Topic::Produced, json!("oops"));
        let err = envelope
            .payload::<std::collections::HashMap<String, String>>()
            .unwrap_err();
        assert!(err.to_string().contains("produced"));
    }
}

//! Typed payloads for the signaling topics.
//!
//! Field names follow the session router's JSON (`roomName`,
//! `serverTransportId`, ...). Opaque media-engine blobs (ICE/DTLS/RTP
//! parameters, capabilities) stay as [`serde_json::Value`].

use crate::types::{ConsumerId, MediaKind, ProducerId, PublisherId, RoomId, TransportId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `joinRoom`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub room_name: RoomId,
}

/// `joinedRoom`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedRoom {
    #[serde(default)]
    pub rtp_capabilities: Option<Value>,
}

/// `createWebRtcTransport`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportRequest {
    pub consumer: bool,
    pub force_tcp: bool,
}

/// `createWebRtcTransportSuccess`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    #[serde(default)]
    pub ice_parameters: Value,
    #[serde(default)]
    pub ice_candidates: Value,
    #[serde(default)]
    pub dtls_parameters: Value,
}

/// `transport-connect`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConnect {
    pub server_transport_id: TransportId,
    pub dtls_parameters: Value,
}

/// `transport-produce`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportProduce {
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    #[serde(default)]
    pub app_data: Value,
    pub server_transport_id: TransportId,
}

/// `produced`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Produced {
    #[serde(default)]
    pub id: Option<ProducerId>,
}

/// `consume`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub rtp_capabilities: Value,
    pub remote_producer_id: PublisherId,
    pub server_consumer_transport_id: TransportId,
}

/// `consumed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consumed {
    pub id: ConsumerId,
    pub kind: MediaKind,
    #[serde(default)]
    pub rtp_parameters: Value,
    pub producer_id: PublisherId,
}

/// `chatMessage`, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub room_name: RoomId,
    pub user: String,
    pub message: String,
}

/// `error` and `createWebRtcTransportError`.
///
/// The router sends either a bare string or an object with a `message`
/// field, so this is built from the raw value rather than derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub message: String,
}

impl ServerError {
    const ROOM_FULL_MARKER: &'static str = "room is full";

    pub fn from_value(value: &Value) -> Self {
        let message = match value {
            Value::String(s) => s.clone(),
            Value::Object(map) => match map.get("message").or_else(|| map.get("error")) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => value.to_string(),
            },
            Value::Null => "unspecified server error".to_string(),
            other => other.to_string(),
        };
        Self { message }
    }

    /// Capacity rejection: the room already holds its maximum number of participants.
    pub fn is_room_full(&self) -> bool {
        self.message.to_lowercase().contains(Self::ROOM_FULL_MARKER)
    }
}

/// Extracts a single publisher id from a `newProducer`/`producerClosed` payload.
///
/// Accepts a bare string or an object carrying `producerId` (or `id`).
/// Empty ids are treated as absent.
pub fn parse_publisher_id(value: &Value) -> Option<PublisherId> {
    let raw = match value {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map
            .get("producerId")
            .or_else(|| map.get("id"))
            .and_then(Value::as_str),
        _ => None,
    }?;
    if raw.is_empty() {
        None
    } else {
        Some(PublisherId::new(raw))
    }
}

/// Extracts the roster from a `producerList` payload, skipping null and empty entries.
pub fn parse_publisher_list(value: &Value) -> Vec<PublisherId> {
    match value {
        Value::Array(items) => items.iter().filter_map(parse_publisher_id).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_transport_request_wire_names() {
        let value = serde_json::to_value(CreateTransportRequest {
            consumer: true,
            force_tcp: false,
        })
        .unwrap();
        assert_eq!(value, json!({"consumer": true, "forceTcp": false}));
    }

    #[test]
    fn test_transport_params_tolerate_missing_blobs() {
        let params: TransportParams = serde_json::from_value(json!({"id": "T1"})).unwrap();
        assert_eq!(params.id.as_str(), "T1");
        assert!(params.dtls_parameters.is_null());
    }

    #[test]
    fn test_consumed_payload() {
        let consumed: Consumed = serde_json::from_value(json!({
            "id": "C1",
            "kind": "video",
            "rtpParameters": {"codecs": []},
            "producerId": "P1"
        }))
        .unwrap();
        assert_eq!(consumed.kind, MediaKind::Video);
        assert_eq!(consumed.producer_id.as_str(), "P1");
    }

    #[test]
    fn test_produced_without_id() {
        let produced: Produced = serde_json::from_value(json!({})).unwrap();
        assert!(produced.id.is_none());
    }

    #[test]
    fn test_server_error_shapes() {
        assert_eq!(ServerError::from_value(&json!("boom")).message, "boom");
        let full = ServerError::from_value(&json!({"message": "Room is full (max 2)"}));
        assert!(full.is_room_full());
        assert!(!ServerError::from_value(&json!({"code": 3})).is_room_full());
        assert_eq!(
            ServerError::from_value(&Value::Null).message,
            "unspecified server error"
        );
    }

    #[test]
    fn test_publisher_list_skips_empty_entries() {
        let list = parse_publisher_list(&json!(["P1", null, "", {"producerId": "P2"}, 7]));
        assert_eq!(list, vec![PublisherId::new("P1"), PublisherId::new("P2")]);
        assert!(parse_publisher_list(&json!(null)).is_empty());
    }

    #[test]
    fn test_single_publisher_id() {
        assert_eq!(parse_publisher_id(&json!("P9")), Some(PublisherId::new("P9")));
        assert_eq!(
            parse_publisher_id(&json!({"id": "P3"})),
            Some(PublisherId::new("P3"))
        );
        assert_eq!(parse_publisher_id(&json!("")), None);
        assert_eq!(parse_publisher_id(&json!(5)), None);
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// Generates an opaque, server-issued string identifier.
macro_rules! define_string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

define_string_id! {
    /// Name of the session (room) both participants join.
    RoomId
}

define_string_id! {
    /// Server-assigned id of a remote producer, used to request consumption.
    PublisherId
}

define_string_id! {
    /// Server-issued id of a send or receive transport.
    TransportId
}

define_string_id! {
    /// Id of a local producer. Either confirmed by the peer or a local placeholder.
    ProducerId
}

define_string_id! {
    /// Server-issued id of a consumer bound to a remote publisher.
    ConsumerId
}

impl ProducerId {
    const PLACEHOLDER_PREFIX: &'static str = "local-";

    /// Synthesizes a placeholder id used when the peer never acknowledges a produce request.
    pub fn placeholder(kind: MediaKind, nonce: u32) -> Self {
        Self(format!("{}{}-{:08x}", Self::PLACEHOLDER_PREFIX, kind, nonce))
    }

    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with(Self::PLACEHOLDER_PREFIX)
    }
}

/// Media kind tag carried by every producer and consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub const ALL: [MediaKind; 2] = [MediaKind::Video, MediaKind::Audio];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(MediaKind::Audio),
            "video" => Ok(MediaKind::Video),
            other => Err(format!("unknown media kind: {other}")),
        }
    }
}

/// Direction of a media transport relative to this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Recv,
}

impl Direction {
    /// The peer's `createWebRtcTransport` request flags receive transports as `consumer`.
    pub fn is_consumer(&self) -> bool {
        matches!(self, Direction::Recv)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Send => "send",
            Direction::Recv => "recv",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_producer_id() {
        let id = ProducerId::placeholder(MediaKind::Video, 0xdeadbeef);
        assert_eq!(id.as_str(), "local-video-deadbeef");
        assert!(id.is_placeholder());
        assert!(!ProducerId::new("b2c1-server").is_placeholder());
    }

    #[test]
    fn test_media_kind_round_trip_through_str() {
        for kind in MediaKind::ALL {
            assert_eq!(kind.as_str().parse::<MediaKind>().unwrap(), kind);
        }
        assert!("screen".parse::<MediaKind>().is_err());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let id = PublisherId::new("P1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"P1\"");
        let back: PublisherId = serde_json::from_str("\"P1\"").unwrap();
        assert_eq!(back, id);
    }
}

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// A relay-assist candidate handed to every transport the client creates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub room_id: Option<String>,
    /// Author label attached to outgoing chat messages.
    pub display_name: String,

    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,

    pub transport_request_timeout_ms: u64,
    /// After this long without `transport-connected`, the handshake is assumed to have succeeded.
    pub connect_handshake_timeout_ms: u64,
    /// After this long without `produced`, the producer proceeds under a placeholder id.
    pub produce_timeout_ms: u64,

    pub consume_timeout_ms: u64,
    pub consume_retry_delay_ms: u64,
    pub consume_retry_limit: u32,

    pub recovery_grace_ms: u64,
    pub auto_restart_on_failure: bool,
    pub max_restart_escalations: u32,

    pub force_tcp: bool,
    pub ice_servers: Vec<IceServer>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:3000/mediasoup".to_string(),
            room_id: None,
            display_name: "User".to_string(),
            reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
            transport_request_timeout_ms: 10_000,
            connect_handshake_timeout_ms: 5_000,
            produce_timeout_ms: 5_000,
            consume_timeout_ms: 10_000,
            consume_retry_delay_ms: 500,
            consume_retry_limit: 10,
            recovery_grace_ms: 2_000,
            auto_restart_on_failure: false,
            max_restart_escalations: 2,
            force_tcp: false,
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer {
                    urls: vec!["turn:127.0.0.1:3478".to_string()],
                    username: Some("user".to_string()),
                    credential: Some("pass".to_string()),
                },
            ],
        }
    }
}

impl ClientConfig {
    /// Loads a JSON config file. Missing fields take their defaults.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::Invalid("server_url is empty".into()));
        }
        if self.reconnect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "reconnect_attempts must be at least 1".into(),
            ));
        }
        let timeouts = [
            ("transport_request_timeout_ms", self.transport_request_timeout_ms),
            ("connect_handshake_timeout_ms", self.connect_handshake_timeout_ms),
            ("produce_timeout_ms", self.produce_timeout_ms),
            ("consume_timeout_ms", self.consume_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn transport_request_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_request_timeout_ms)
    }

    pub fn connect_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_handshake_timeout_ms)
    }

    pub fn produce_timeout(&self) -> Duration {
        Duration::from_millis(self.produce_timeout_ms)
    }

    pub fn consume_timeout(&self) -> Duration {
        Duration::from_millis(self.consume_timeout_ms)
    }

    pub fn consume_retry_delay(&self) -> Duration {
        Duration::from_millis(self.consume_retry_delay_ms)
    }

    pub fn recovery_grace(&self) -> Duration {
        Duration::from_millis(self.recovery_grace_ms)
    }
}

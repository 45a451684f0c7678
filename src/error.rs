//! Error types shared by the bridge core

use thiserror::Error;

/// Failures surfaced to callers of the bridge
///
/// Malformed device payloads never show up here; they are rejected by the
/// codec with a [`crate::mqtt::codec::DecodeError`] and dropped.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No broker address configured; the connection manager never starts
    #[error("MQTT broker address is not configured (set broker.url or MQTT_URL); commands cannot be published")]
    UnconfiguredTransport,

    /// Broker configured but currently unreachable
    #[error("MQTT broker is unreachable: {0}")]
    TransportDown(String),

    /// The broker rejected the command or the publish handshake did not complete
    #[error("Failed to publish command {request_id} to {topic}: {reason}")]
    PublishFailed {
        request_id: String,
        topic: String,
        reason: String,
    },

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Attaches the command identity to a transport-level publish failure
    pub(crate) fn for_command(self, request_id: &str, topic: &str) -> Self {
        match self {
            BridgeError::PublishFailed { reason, .. } => BridgeError::PublishFailed {
                request_id: request_id.to_string(),
                topic: topic.to_string(),
                reason,
            },
            other => other,
        }
    }
}

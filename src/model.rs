//! Data model for telemetry, acknowledgements, and commands
//!
//! Field names serialize in camelCase to match the JSON exchanged with the
//! field devices and with the state inspection endpoint.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Milliseconds since the Unix epoch
pub type Millis = i64;

pub fn now_ms() -> Millis {
    chrono::Utc::now().timestamp_millis()
}

/// Latest sensor reading reported by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReading {
    pub device_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: Millis,
}

/// Device confirmation for a previously published command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
    pub request_id: String,
    pub device_id: String,
    pub status: String,
    pub received_at: Millis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Acknowledgement {
    /// Outcome a pending command resolves to when this ack arrives
    pub fn outcome(&self) -> CommandStatus {
        if self.status == "ok" {
            CommandStatus::Ok
        } else {
            CommandStatus::Error
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    LightSet,
    FanSet,
}

impl CommandType {
    /// Channel segment substituted into the command topic template
    pub fn channel(&self) -> &'static str {
        match self {
            CommandType::LightSet => "light",
            CommandType::FanSet => "fan",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CommandType::LightSet => write!(f, "LIGHT_SET"),
            CommandType::FanSet => write!(f, "FAN_SET"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Ok,
    Error,
}

/// A published command awaiting (or resolved by) a device acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCommand {
    pub request_id: String,
    pub device_id: String,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub value: String,
    pub created_at: Millis,
    pub status: CommandStatus,
}

/// Wire payload published on the command topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    pub request_id: String,
    pub device_id: String,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<u32>,
    pub timestamp: Millis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FanState {
    On,
    Off,
}

impl FanState {
    pub fn as_value(&self) -> &'static str {
        match self {
            FanState::On => "ON",
            FanState::Off => "OFF",
        }
    }
}

impl fmt::Display for FanState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_value())
    }
}

/// Full view of the correlation store at one instant
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub telemetry: HashMap<String, TelemetryReading>,
    pub acks: HashMap<String, Acknowledgement>,
    pub pending: HashMap<String, PendingCommand>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_command_serializes_like_the_wire_format() {
        let cmd = PendingCommand {
            request_id: "r1".into(),
            device_id: "nano-esp32-01".into(),
            command_type: CommandType::FanSet,
            value: "ON".into(),
            created_at: 10,
            status: CommandStatus::Pending,
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["requestId"], "r1");
        assert_eq!(json["type"], "FAN_SET");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["createdAt"], 10);
    }

    #[test]
    fn ack_outcome_only_ok_is_success() {
        let mut ack = Acknowledgement {
            request_id: "r1".into(),
            device_id: "d".into(),
            status: "ok".into(),
            received_at: 0,
            message: None,
        };
        assert_eq!(ack.outcome(), CommandStatus::Ok);
        ack.status = "OK".into();
        assert_eq!(ack.outcome(), CommandStatus::Error);
        ack.status = "error".into();
        assert_eq!(ack.outcome(), CommandStatus::Error);
    }

    #[test]
    fn command_channels() {
        assert_eq!(CommandType::LightSet.channel(), "light");
        assert_eq!(CommandType::FanSet.channel(), "fan");
        assert_eq!(CommandType::FanSet.to_string(), "FAN_SET");
    }
}

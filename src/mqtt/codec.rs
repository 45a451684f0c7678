//! Payload codec for the broker wire contract
//!
//! Device payloads are untrusted. Decoding never panics; a bad payload comes
//! back as a [`DecodeError`] which the caller logs and drops.

use crate::model::{now_ms, Acknowledgement, CommandPayload, Millis, TelemetryReading};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

/// Reasons a device payload is rejected
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("Payload is not a JSON object: {0}")]
    InvalidJson(String),

    #[error("Missing or empty field `{0}`")]
    MissingField(&'static str),

    #[error("Field `{0}` is not a finite number")]
    NotANumber(&'static str),
}

/// Decodes a telemetry payload, rejecting it if `deviceId` is missing or the
/// readings are not finite numbers
pub fn decode_telemetry(payload: &[u8]) -> Result<TelemetryReading, DecodeError> {
    let result = parse_object(payload).and_then(|fields| {
        let device_id = required_string(&fields, "deviceId")?;
        let temperature =
            finite_number(fields.get("temperature")).ok_or(DecodeError::NotANumber("temperature"))?;
        let humidity =
            finite_number(fields.get("humidity")).ok_or(DecodeError::NotANumber("humidity"))?;

        Ok(TelemetryReading {
            device_id,
            temperature,
            humidity,
            timestamp: millis_or_now(fields.get("timestamp")),
        })
    });

    if let Err(e) = &result {
        warn!("Ignoring telemetry payload: {}", e);
    }
    result
}

/// Decodes an acknowledgement payload; `deviceId`, `requestId` and `status`
/// are mandatory
pub fn decode_ack(payload: &[u8]) -> Result<Acknowledgement, DecodeError> {
    let result = parse_object(payload).and_then(|fields| {
        let device_id = required_string(&fields, "deviceId")?;
        let request_id = required_string(&fields, "requestId")?;
        let status = required_string(&fields, "status")?;
        let message = match fields.get("message") {
            Some(Value::String(message)) => Some(message.clone()),
            _ => None,
        };

        Ok(Acknowledgement {
            request_id,
            device_id,
            status,
            received_at: millis_or_now(fields.get("receivedAt")),
            message,
        })
    });

    if let Err(e) = &result {
        warn!("Ignoring ack payload: {}", e);
    }
    result
}

/// Serializes an outbound command. Infallible for the payload type
pub fn encode_command(command: &CommandPayload) -> Vec<u8> {
    serde_json::to_vec(command).unwrap_or_default()
}

fn parse_object(payload: &[u8]) -> Result<Map<String, Value>, DecodeError> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(DecodeError::InvalidJson(format!(
            "expected an object, got {}",
            kind_of(&other)
        ))),
        Err(e) => Err(DecodeError::InvalidJson(e.to_string())),
    }
}

fn required_string(fields: &Map<String, Value>, key: &'static str) -> Result<String, DecodeError> {
    match fields.get(key) {
        Some(Value::String(value)) if !value.is_empty() => Ok(value.clone()),
        _ => Err(DecodeError::MissingField(key)),
    }
}

/// JSON numbers and numeric strings both count
fn finite_number(value: Option<&Value>) -> Option<f64> {
    let number = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) if !s.trim().is_empty() => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    number.is_finite().then_some(number)
}

fn millis_or_now(value: Option<&Value>) -> Millis {
    if let Some(Value::Number(n)) = value {
        if let Some(ms) = n.as_i64() {
            return ms;
        }
    }
    finite_number(value)
        .map(|ms| ms.trunc() as Millis)
        .unwrap_or_else(now_ms)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

//! Typed decoding of inbound telemetry payloads.
//!
//! Devices publish one JSON object per reading. Every field is optional: missing
//! readings decode to `None`, missing flags to `false`, and a missing device name
//! to the configured default. Anything that is not a JSON object is rejected.

use core::fmt;
use serde::de::{self, Deserializer, Unexpected};
use serde::Deserialize;
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub const DEFAULT_DEVICE_NAME: &str = "motor-driver-01";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TelemetryPacket {
    #[serde(default, deserialize_with = "device_label")]
    pub device_name: Option<String>,
    /// Device-side uptime/clock in seconds.
    #[serde(default, deserialize_with = "lenient_number")]
    pub time_s: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub target_rpm: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub rpm: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub deviation_rpm: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub deviation_pct: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub pwm: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub duty_pct: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub delta_counts: Option<f64>,
    #[serde(default, deserialize_with = "flag_set")]
    pub flags: FlagSet,
}

/// Fault indicators as reported by the device firmware.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FlagSet {
    #[serde(default, deserialize_with = "truthy")]
    pub sudden_drop: bool,
    #[serde(default, deserialize_with = "truthy")]
    pub stall: bool,
    #[serde(default, deserialize_with = "truthy")]
    pub overshoot: bool,
    #[serde(default, deserialize_with = "truthy")]
    pub encoder_fault: bool,
    #[serde(default, deserialize_with = "status_text")]
    pub status: Option<String>,
}

/// A decoded packet together with the document it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    /// Device name with the default already applied.
    pub device_name: String,
    pub packet: TelemetryPacket,
    /// The parsed payload, retained verbatim for the raw event record.
    pub raw: Value,
}

#[derive(Debug)]
pub enum DecodeError {
    /// Payload is not well-formed JSON (includes truncated input and invalid UTF-8).
    Json(serde_json::Error),
    /// Payload parsed, but its top level is not an object.
    NotAnObject(&'static str),
    /// A known field carries a value of the wrong shape.
    Field(serde_path_to_error::Error<serde_json::Error>),
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Json(e) => write!(f, "malformed json: {}", e),
            DecodeError::NotAnObject(kind) => write!(f, "expected a json object, got {}", kind),
            DecodeError::Field(e) => write!(f, "invalid field {}: {}", e.path(), e.inner()),
        }
    }
}

impl Error for DecodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DecodeError::Json(e) => Some(e),
            DecodeError::NotAnObject(_) => None,
            DecodeError::Field(e) => Some(e.inner()),
        }
    }
}

/// Turns raw transport payloads into [`DecodedMessage`]s.
#[derive(Debug, Clone)]
pub struct TelemetryDecoder {
    default_device_name: String,
}

impl Default for TelemetryDecoder {
    fn default() -> Self {
        TelemetryDecoder::new(DEFAULT_DEVICE_NAME)
    }
}

impl TelemetryDecoder {
    pub fn new(default_device_name: impl Into<String>) -> Self {
        TelemetryDecoder {
            default_device_name: default_device_name.into(),
        }
    }

    pub fn decode(&self, payload: &[u8]) -> Result<DecodedMessage, DecodeError> {
        let raw: Value = serde_json::from_slice(payload).map_err(DecodeError::Json)?;
        if !raw.is_object() {
            return Err(DecodeError::NotAnObject(json_kind(&raw)));
        }

        let packet: TelemetryPacket = serde_path_to_error::deserialize(&raw).map_err(DecodeError::Field)?;
        let device_name = packet
            .device_name
            .clone()
            .unwrap_or_else(|| self.default_device_name.clone());

        Ok(DecodedMessage {
            device_name,
            packet,
            raw,
        })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn unexpected(value: &Value) -> Unexpected<'_> {
    match value {
        Value::Null => Unexpected::Unit,
        Value::Bool(b) => Unexpected::Bool(*b),
        Value::Number(n) => n.as_f64().map(Unexpected::Float).unwrap_or(Unexpected::Other("number")),
        Value::String(s) => Unexpected::Str(s),
        Value::Array(_) => Unexpected::Seq,
        Value::Object(_) => Unexpected::Map,
    }
}

// Numbers pass through; numeric strings are accepted since some firmware
// revisions quote their readings.
fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match &value {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(Some(v)),
            _ => Err(de::Error::invalid_value(unexpected(&value), &"a number")),
        },
        other => Err(de::Error::invalid_type(unexpected(other), &"a number")),
    }
}

// Numeric names are stored as their text. Other non-strings fall back to the
// default name rather than dropping the reading.
fn device_label<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s),
        Value::Number(n) if n.as_f64().is_some_and(|v| v != 0.0) => Some(n.to_string()),
        _ => None,
    })
}

// JSON truthiness: null, false, 0 and "" are false, everything else is true.
fn truthy<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => false,
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0 && !v.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    })
}

fn status_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        _ => None,
    })
}

// A `flags` member that is not an object carries no flags.
fn flag_set<'de, D>(deserializer: D) -> Result<FlagSet, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        value @ Value::Object(_) => FlagSet::deserialize(value).map_err(de::Error::custom),
        _ => Ok(FlagSet::default()),
    }
}

//! Alert server wire protocol
//!
//! Newline-delimited JSON, one frame per line:
//!
//! ```text
//! {"message":"ping","type":"request","clientTime":1700000000,"payload":{}}
//! {"message":"ping","type":"response","clientTime":1700000000,"payload":{"result":"ok"}}
//! ```
//!
//! Session: `authentication` → `registration` → any number of `statechange`
//! and `ping` exchanges. Either side may send `ping` requests.

use std::fmt;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::actors::messages::StateChange;
use crate::error::ProtocolError;
use crate::sensors::PollingSensor;

/// Protocol version spoken by this client
pub const PROTOCOL_VERSION: f32 = 0.5;

/// Protocol revision spoken by this client
pub const PROTOCOL_REVISION: u32 = 0;

pub const CLIENT_TYPE: &str = "sensor";

/// Longest accepted line
pub const MAX_FRAME_LENGTH: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Authentication,
    Registration,
    Ping,
    StateChange,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Authentication => "authentication",
            MessageKind::Registration => "registration",
            MessageKind::Ping => "ping",
            MessageKind::StateChange => "statechange",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
}

/// A single line on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub message: MessageKind,

    #[serde(rename = "type")]
    pub direction: Direction,

    #[serde(rename = "clientTime")]
    pub client_time: i64,

    #[serde(default)]
    pub payload: Value,
}

impl Frame {
    pub fn request(message: MessageKind, payload: &impl Serialize) -> Result<Self, ProtocolError> {
        Self::new(message, Direction::Request, payload)
    }

    pub fn response(message: MessageKind, payload: &ResponsePayload) -> Result<Self, ProtocolError> {
        Self::new(message, Direction::Response, payload)
    }

    fn new(
        message: MessageKind,
        direction: Direction,
        payload: &impl Serialize,
    ) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_value(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        Ok(Self {
            message,
            direction,
            client_time: Utc::now().timestamp(),
            payload,
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ProtocolError::Malformed(format!("invalid {} payload: {e}", self.message))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationRequest {
    pub version: f32,
    pub rev: u32,
    pub username: String,
    pub password: String,
    pub client_type: String,
}

impl AuthenticationRequest {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            rev: PROTOCOL_REVISION,
            username: username.to_string(),
            password: password.to_string(),
            client_type: CLIENT_TYPE.to_string(),
        }
    }
}

/// Sensor metadata sent during registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorRegistration {
    pub client_sensor_id: u32,
    /// Seconds
    pub alert_delay: u64,
    pub alert_levels: Vec<i32>,
    pub description: String,
}

impl From<&PollingSensor> for SensorRegistration {
    fn from(sensor: &PollingSensor) -> Self {
        Self {
            client_sensor_id: sensor.id,
            alert_delay: sensor.alert_delay.as_secs(),
            alert_levels: sensor.alert_levels.clone(),
            description: sensor.description.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub hostname: String,
    /// Sensor clients always keep their connection open
    pub persistent: u8,
    pub sensors: Vec<SensorRegistration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangeRequest {
    pub client_sensor_id: u32,
    pub state: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_level: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl From<&StateChange> for StateChangeRequest {
    fn from(change: &StateChange) -> Self {
        Self {
            client_sensor_id: change.sensor_id,
            state: change.state.as_wire(),
            alert_level: change.alert_level,
            value: Some(change.value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseResult {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub result: ResponseResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponsePayload {
    pub fn ok() -> Self {
        Self {
            result: ResponseResult::Ok,
            version: None,
            rev: None,
            error: None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            result: ResponseResult::Error,
            error: Some(reason.into()),
            ..Self::ok()
        }
    }
}

/// Versions must match exactly; revisions may differ
pub fn check_version(server: f32) -> Result<(), ProtocolError> {
    if (server - PROTOCOL_VERSION).abs() > f32::EPSILON {
        return Err(ProtocolError::VersionMismatch {
            server,
            client: PROTOCOL_VERSION,
        });
    }
    Ok(())
}

//! JSON messages exchanged over the real-time channel.
//!
//! Every message in either direction is an envelope:
//!
//!   {"event": "<name>", "data": { ... }}
//!
//! `data` may be omitted for events that carry no payload.

use serde::{Deserialize, Serialize};

use crate::frame::ZoneColorSet;
use crate::settings::SettingsPatch;

/// Requests sent by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StartVideoProcessing { video_path: Option<String> },
    StopVideoProcessing,
    UpdateSettings(SettingsPatch),
}

/// Events pushed to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    ProcessingStarted { success: bool },
    ProcessingStopped { success: bool },
    SettingsUpdated { success: bool },
    Colors(ZoneColorSet),
    Error { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProcessingStarted { .. } => "processing_started",
            Self::ProcessingStopped { .. } => "processing_stopped",
            Self::SettingsUpdated { .. } => "settings_updated",
            Self::Colors(_) => "colors",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct StartPayload {
    #[serde(default)]
    video_path: Option<String>,
}

impl ClientEvent {
    /// Decode a text frame received from a client.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let data = match envelope.data {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other,
        };

        match envelope.event.as_str() {
            "start_video_processing" => {
                let payload: StartPayload = serde_json::from_value(data)
                    .map_err(|e| ProtocolError::Payload(envelope.event.clone(), e.to_string()))?;
                Ok(Self::StartVideoProcessing {
                    video_path: payload.video_path,
                })
            }
            "stop_video_processing" => Ok(Self::StopVideoProcessing),
            "update_settings" => {
                let patch: SettingsPatch = serde_json::from_value(data)
                    .map_err(|e| ProtocolError::Payload(envelope.event.clone(), e.to_string()))?;
                Ok(Self::UpdateSettings(patch))
            }
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unknown event '{0}'")]
    UnknownEvent(String),
    #[error("invalid payload for '{0}': {1}")]
    Payload(String, String),
    #[error("failed to encode event: {0}")]
    Encode(String),
}

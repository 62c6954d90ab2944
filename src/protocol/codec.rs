//! Streaming wire codec
//!
//! Outgoing frames are `{action, session_id, data}` commands. Incoming frames
//! are JSON text objects tagged by `type`:
//!
//! ```text
//! {"type": "chunk",    "content": "...", "metadata": {"agent": "case", "step": "generating"}}
//! {"type": "progress", "metadata": {"agent": "case", "step": "start", "progress": 10}}
//! {"type": "done",     "content": {...}?, "metadata": {...}}
//! {"type": "error",    "error": "...", "error_code": "LLM_API_ERROR"?, "metadata": {...}}
//! ```
//!
//! Decoding never panics: anything outside this shape is a [`DecodeError`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::constants::stream as stream_constants;
use crate::types::{Result, SessionId};

/// Backend handler selected by an outgoing command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamAction {
    Requirement,
    Scenario,
    Case,
    Code,
    Quality,
    Optimize,
    Supplement,
}

impl StreamAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requirement => "requirement",
            Self::Scenario => "scenario",
            Self::Case => "case",
            Self::Code => "code",
            Self::Quality => "quality",
            Self::Optimize => "optimize",
            Self::Supplement => "supplement",
        }
    }
}

impl std::fmt::Display for StreamAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outgoing command frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub action: StreamAction,
    pub session_id: SessionId,
    pub data: Value,
}

impl Command {
    pub fn new(action: StreamAction, session_id: SessionId, data: Value) -> Self {
        Self {
            action,
            session_id,
            data,
        }
    }
}

/// Agent/step annotations attached to incoming frames
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
}

/// Typed incoming event; immutable once decoded
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk {
        content: String,
        metadata: Option<FrameMetadata>,
    },
    Progress {
        percent: u8,
        metadata: Option<FrameMetadata>,
    },
    Done {
        payload: Option<Value>,
        metadata: Option<FrameMetadata>,
    },
    Error {
        code: String,
        message: String,
        metadata: Option<FrameMetadata>,
    },
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chunk { .. } => "chunk",
            Self::Progress { .. } => "progress",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    pub fn metadata(&self) -> Option<&FrameMetadata> {
        match self {
            Self::Chunk { metadata, .. }
            | Self::Progress { metadata, .. }
            | Self::Done { metadata, .. }
            | Self::Error { metadata, .. } => metadata.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no string `type` field")]
    MissingType,

    #[error("unknown frame type `{0}`")]
    UnknownType(String),

    #[error("invalid `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl DecodeError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

pub struct MessageCodec;

impl MessageCodec {
    /// Serialize an outgoing command to a text frame
    pub fn encode(command: &Command) -> Result<String> {
        Ok(serde_json::to_string(command)?)
    }

    /// Decode a binary frame; must be UTF-8 JSON text
    pub fn decode_bytes(bytes: &[u8]) -> std::result::Result<StreamEvent, DecodeError> {
        let text = std::str::from_utf8(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        Self::decode(text)
    }

    /// Decode an incoming text frame
    pub fn decode(text: &str) -> std::result::Result<StreamEvent, DecodeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let Value::Object(frame) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let frame_type = frame
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingType)?;
        let metadata = decode_metadata(&frame)?;

        match frame_type {
            "chunk" => {
                let content = match frame.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(_) => return Err(DecodeError::invalid("content", "expected a string")),
                };
                Ok(StreamEvent::Chunk { content, metadata })
            }
            "progress" => {
                let raw = metadata
                    .as_ref()
                    .and_then(|m| m.progress)
                    .or_else(|| frame.get("progress").and_then(Value::as_f64))
                    .ok_or_else(|| DecodeError::invalid("progress", "missing percentage"))?;
                if !raw.is_finite() {
                    return Err(DecodeError::invalid("progress", "not a finite number"));
                }
                let percent = raw.round().clamp(0.0, 100.0) as u8;
                Ok(StreamEvent::Progress { percent, metadata })
            }
            "done" => {
                let payload = match frame.get("content") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) if s.trim().is_empty() => None,
                    // Stringified JSON payloads are unwrapped; plain text stays a string.
                    Some(Value::String(s)) => {
                        Some(serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone())))
                    }
                    Some(other) => Some(other.clone()),
                };
                Ok(StreamEvent::Done { payload, metadata })
            }
            "error" => {
                let message = frame
                    .get("error")
                    .or_else(|| frame.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown stream error")
                    .to_string();
                let code = frame
                    .get("error_code")
                    .and_then(Value::as_str)
                    .filter(|c| !c.is_empty())
                    .unwrap_or(stream_constants::DEFAULT_ERROR_CODE)
                    .to_string();
                Ok(StreamEvent::Error {
                    code,
                    message,
                    metadata,
                })
            }
            other => Err(DecodeError::UnknownType(other.to_string())),
        }
    }
}

fn decode_metadata(
    frame: &Map<String, Value>,
) -> std::result::Result<Option<FrameMetadata>, DecodeError> {
    match frame.get("metadata") {
        None | Some(Value::Null) => Ok(None),
        Some(value @ Value::Object(_)) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| DecodeError::invalid("metadata", e.to_string())),
        Some(_) => Err(DecodeError::invalid("metadata", "expected an object")),
    }
}

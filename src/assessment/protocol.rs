//! # Client Wire Protocol
//!
//! Every session speaks the same small protocol over its WebSocket:
//!
//! ```text
//! client                                   server
//!   | -- {"ref_text": "...", ...} ---------> |   config frame (text or binary)
//!   |                                        |
//!   | <------------- {"status":"start"} ---- |
//!   | -- <binary PCM16 frame> -------------> |
//!   | <------ {"status":"intermediate",..} - |   zero or more
//!   | -- {"type":"end"} -------------------> |
//!   | <-------- {"status":"complete",..} --- |   or {"status":"error","error":"..."}
//! ```
//!
//! Exactly one of `complete`/`error` ends a session; nothing is sent after it.

use crate::error::SessionError;
use crate::recognition::AssessmentResult;
use serde::{Deserialize, Serialize};

pub const DEFAULT_ENGINE_TYPE: &str = "16k_en";
pub const DEFAULT_SCORE_COEFF: f64 = 1.1;
/// Used when the client sends a non-positive coefficient
pub const FALLBACK_SCORE_COEFF: f64 = 1.0;

fn default_engine_type() -> String {
    DEFAULT_ENGINE_TYPE.to_string()
}

fn default_score_coeff() -> Option<f64> {
    Some(DEFAULT_SCORE_COEFF)
}

/// The first frame of a session, exactly as the client sent it.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFrame {
    #[serde(default)]
    pub ref_text: Option<String>,
    #[serde(default = "default_engine_type")]
    pub server_engine_type: String,
    /// Absent means the default; an explicit `null` counts as zero
    #[serde(default = "default_score_coeff")]
    pub score_coeff: Option<f64>,
    #[serde(default)]
    pub eval_mode: i64,
    #[serde(default)]
    pub text_mode: i64,
    #[serde(default)]
    pub is_save_audio_file: bool,
}

/// Validated session settings. Immutable once the session leaves `AwaitingConfig`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub ref_text: String,
    pub server_engine_type: String,
    pub score_coeff: f64,
    pub eval_mode: i64,
    pub text_mode: i64,
    pub save_audio: bool,
}

impl SessionSettings {
    /// Parse and validate a config frame payload.
    pub fn parse(payload: &[u8]) -> Result<Self, SessionError> {
        let frame: ConfigFrame = serde_json::from_slice(payload)
            .map_err(|e| SessionError::Config(format!("malformed config frame: {}", e)))?;
        Self::try_from(frame)
    }
}

impl TryFrom<ConfigFrame> for SessionSettings {
    type Error = SessionError;

    fn try_from(frame: ConfigFrame) -> Result<Self, Self::Error> {
        let ref_text = match frame.ref_text {
            Some(text) if !text.trim().is_empty() => text,
            _ => return Err(SessionError::Config("ref_text is required".to_string())),
        };

        let server_engine_type = if frame.server_engine_type.trim().is_empty() {
            default_engine_type()
        } else {
            frame.server_engine_type
        };

        let score_coeff = match frame.score_coeff {
            Some(coeff) if coeff > 0.0 => coeff,
            _ => FALLBACK_SCORE_COEFF,
        };

        Ok(Self {
            ref_text,
            server_engine_type,
            score_coeff,
            eval_mode: frame.eval_mode,
            text_mode: frame.text_mode,
            save_audio: frame.is_save_audio_file,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ControlFrame {
    #[serde(rename = "type")]
    kind: String,
}

/// What a text frame received while streaming means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    EndOfStream,
    /// Anything else; logged and ignored
    Unrecognized(String),
}

pub fn parse_control(text: &str) -> ControlMessage {
    match serde_json::from_str::<ControlFrame>(text) {
        Ok(frame) if frame.kind == "end" => ControlMessage::EndOfStream,
        Ok(frame) => ControlMessage::Unrecognized(format!("unknown control type '{}'", frame.kind)),
        Err(e) => ControlMessage::Unrecognized(format!("unparseable text frame: {}", e)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Start,
    Intermediate,
    Complete,
    Error,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Complete | Status::Error)
    }
}

/// Outbound status frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusFrame {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AssessmentResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusFrame {
    pub fn start() -> Self {
        Self {
            status: Status::Start,
            result: None,
            error: None,
        }
    }

    pub fn intermediate(result: AssessmentResult) -> Self {
        Self {
            status: Status::Intermediate,
            result: Some(result),
            error: None,
        }
    }

    pub fn complete(result: AssessmentResult) -> Self {
        Self {
            status: Status::Complete,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            result: None,
            error: Some(message.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

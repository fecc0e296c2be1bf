// Realtime server events received over the data channel

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
        }
    }
}

/// Interviewer activity shown in the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiState {
    Idle,
    Listening,
    Thinking,
    Speaking,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    SpeechStarted,
    SpeechStopped,
    TranscriptDelta {
        role: Role,
        delta: String,
    },
    TranscriptDone {
        role: Role,
        transcript: Option<String>,
    },
    Error {
        message: String,
    },
    /// Any event type this client does not act on.
    Unknown {
        kind: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed event JSON: {0}")]
    Json(String),

    #[error("event has no type field")]
    MissingType,
}

impl ServerEvent {
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| DecodeError::Json(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingType)?;

        let event = match kind {
            "input_audio_buffer.speech_started" => ServerEvent::SpeechStarted,
            "input_audio_buffer.speech_stopped" => ServerEvent::SpeechStopped,
            "response.audio_transcript.delta"
            | "response.output_audio_transcript.delta"
            | "response.text.delta" => ServerEvent::TranscriptDelta {
                role: Role::Assistant,
                delta: string_field(&value, "delta").unwrap_or_default(),
            },
            "conversation.item.input_audio_transcription.delta" => ServerEvent::TranscriptDelta {
                role: Role::User,
                delta: string_field(&value, "delta").unwrap_or_default(),
            },
            "response.audio_transcript.done"
            | "response.output_audio_transcript.done"
            | "response.text.done" => ServerEvent::TranscriptDone {
                role: Role::Assistant,
                transcript: string_field(&value, "transcript")
                    .or_else(|| string_field(&value, "text")),
            },
            "conversation.item.input_audio_transcription.completed" => {
                ServerEvent::TranscriptDone {
                    role: Role::User,
                    transcript: string_field(&value, "transcript"),
                }
            }
            "error" => ServerEvent::Error {
                message: value
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("realtime server error")
                    .to_string(),
            },
            other => ServerEvent::Unknown {
                kind: other.to_string(),
            },
        };
        Ok(event)
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

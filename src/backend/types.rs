// Backend payloads and errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of any backend HTTP call (credential broker included)
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout")]
    Timeout,

    #[error("{message}")]
    Http { status: u16, message: String },

    #[error("Invalid response from backend: {0}")]
    InvalidResponse(String),
}

impl BrokerError {
    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BrokerError::Timeout
        } else if err.is_decode() {
            BrokerError::InvalidResponse(err.to_string())
        } else {
            BrokerError::Network(err.to_string())
        }
    }
}

/// Body shape of non-2xx responses; either field may carry the message.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EphemeralKeyRequest<'a> {
    pub session_id: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ClientSecret {
    pub value: String,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EphemeralKeyResponse {
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(default, alias = "ephemeralKey", alias = "ephemeral_key")]
    pub key: Option<String>,
    #[serde(default)]
    pub client_secret: Option<ClientSecret>,
    #[serde(default, alias = "expiresAt")]
    pub expires_at: Option<i64>,
    #[serde(
        default,
        alias = "webrtcEndpoint",
        alias = "realtimeUrl",
        alias = "realtime_url"
    )]
    pub webrtc_endpoint: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationLabel {
    Safe,
    Flagged,
}

#[derive(Debug, Serialize)]
pub(crate) struct TextPayload<'a> {
    pub text: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ModerationResponse {
    pub label: ModerationLabel,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GuardrailResponse {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationRequest {
    pub session_id: String,
    pub turn_id: String,
    pub role: String,
    pub text: String,
    pub turn_count: usize,
}

/// Next interview action decided by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OrchestrationDecision {
    Continue,
    FollowUp { prompt: String },
    End { reason: Option<String> },
}

impl Default for OrchestrationDecision {
    fn default() -> Self {
        OrchestrationDecision::Continue
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct OrchestrationResponse {
    #[serde(default, alias = "nextAction", alias = "next_action", alias = "decision")]
    pub action: Option<String>,
    #[serde(default, alias = "followUp", alias = "follow_up", alias = "question")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl OrchestrationResponse {
    pub fn into_decision(self) -> OrchestrationDecision {
        let action = self
            .action
            .map(|a| a.trim().to_ascii_lowercase().replace('-', "_"))
            .unwrap_or_default();
        let prompt = self.prompt.filter(|p| !p.trim().is_empty());

        match (action.as_str(), prompt) {
            ("end" | "finish" | "complete", _) => OrchestrationDecision::End {
                reason: self.reason,
            },
            ("follow_up" | "followup" | "ask", Some(prompt)) => {
                OrchestrationDecision::FollowUp { prompt }
            }
            ("", Some(prompt)) => OrchestrationDecision::FollowUp { prompt },
            _ => OrchestrationDecision::Continue,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CodeRunRequest {
    pub language: String,
    #[serde(rename = "code")]
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRunResult {
    #[serde(default, alias = "output")]
    pub stdout: String,
    #[serde(default, alias = "error")]
    pub stderr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FinalizeAck {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_success() -> bool {
    true
}

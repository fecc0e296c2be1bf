// Backend client for the live-interview API

mod types;

pub use types::{
    BrokerError, CodeRunRequest, CodeRunResult, FinalizeAck, ModerationLabel,
    OrchestrationDecision, OrchestrationRequest,
};

use crate::config::{BackendConfig, RealtimeConfig};
use crate::credentials::EphemeralCredential;
use crate::session::SessionTranscript;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use types::{
    EphemeralKeyRequest, EphemeralKeyResponse, ErrorBody, GuardrailResponse, ModerationResponse,
    OrchestrationResponse, TextPayload,
};

const EPHEMERAL_KEY_PATH: &str = "/api/live-interview/ephemeral-key";
const ORCHESTRATE_PATH: &str = "/api/live-interview/orchestrate";
const MODERATE_PATH: &str = "/api/live-interview/moderate";
const GUARDRAILS_PATH: &str = "/api/live-interview/guardrails/enforce";
const FINALIZE_PATH: &str = "/api/live-interview/finalize";
const RUN_CODE_PATH: &str = "/api/utils/run-code";

/// Assumed lifetime when the broker omits `expiresAt`.
const FALLBACK_KEY_LIFETIME_SECS: i64 = 300;

/// Calls the session core makes against the assessment backend
#[async_trait]
pub trait InterviewBackend: Send + Sync {
    async fn mint_ephemeral_key(&self, session_id: &str)
        -> Result<EphemeralCredential, BrokerError>;

    async fn orchestrate(
        &self,
        request: &OrchestrationRequest,
    ) -> Result<OrchestrationDecision, BrokerError>;

    async fn moderate(&self, text: &str) -> Result<ModerationLabel, BrokerError>;

    async fn enforce_guardrails(&self, text: &str) -> Result<String, BrokerError>;

    async fn run_code(&self, request: &CodeRunRequest) -> Result<CodeRunResult, BrokerError>;

    async fn finalize(&self, transcript: &SessionTranscript) -> Result<FinalizeAck, BrokerError>;
}

pub struct HttpBackend {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
    default_endpoint: String,
    default_voice: String,
}

impl HttpBackend {
    pub fn new(backend: &BackendConfig, realtime: &RealtimeConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(backend.request_timeout_secs))
            .build()
            .unwrap_or_default();

        tracing::info!("Backend client initialized: {}", backend.base_url);

        Self {
            client,
            base_url: backend.base_url.trim_end_matches('/').to_string(),
            auth_token: backend.auth_token.clone(),
            default_endpoint: realtime.default_endpoint.clone(),
            default_voice: realtime.default_voice.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, BrokerError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let mut request = self.client.post(self.url(path)).json(body);
        if let Some(token) = self.auth_token.as_deref() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(BrokerError::from_reqwest)?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = error_message(status, &body);
            tracing::warn!("POST {} failed: HTTP {} {}", path, status.as_u16(), message);
            return Err(BrokerError::Http {
                status: status.as_u16(),
                message,
            });
        }

        response.json::<R>().await.map_err(|e| {
            tracing::warn!("POST {} returned an unreadable body: {}", path, e);
            BrokerError::InvalidResponse(e.to_string())
        })
    }

    fn credential_from(
        &self,
        requested_session: &str,
        raw: EphemeralKeyResponse,
    ) -> Result<EphemeralCredential, BrokerError> {
        let session_id = raw
            .session_id
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| requested_session.to_string());

        let secret_expiry = raw.client_secret.as_ref().and_then(|s| s.expires_at);
        let key = raw
            .key
            .or_else(|| raw.client_secret.map(|s| s.value))
            .or(raw.session_id)
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| BrokerError::InvalidResponse("missing ephemeral key".to_string()))?;

        let expires_at = match raw.expires_at.or(secret_expiry) {
            Some(at) => at,
            None => {
                tracing::warn!(
                    "Broker omitted expiresAt, assuming {}s lifetime",
                    FALLBACK_KEY_LIFETIME_SECS
                );
                chrono::Utc::now().timestamp() + FALLBACK_KEY_LIFETIME_SECS
            }
        };

        Ok(EphemeralCredential {
            session_id,
            key,
            webrtc_endpoint: raw
                .webrtc_endpoint
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| self.default_endpoint.clone()),
            voice: raw
                .voice
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| self.default_voice.clone()),
            expires_at,
        })
    }
}

#[async_trait]
impl InterviewBackend for HttpBackend {
    async fn mint_ephemeral_key(
        &self,
        session_id: &str,
    ) -> Result<EphemeralCredential, BrokerError> {
        let raw: EphemeralKeyResponse = self
            .post_json(EPHEMERAL_KEY_PATH, &EphemeralKeyRequest { session_id })
            .await?;
        self.credential_from(session_id, raw)
    }

    async fn orchestrate(
        &self,
        request: &OrchestrationRequest,
    ) -> Result<OrchestrationDecision, BrokerError> {
        let raw: OrchestrationResponse = self.post_json(ORCHESTRATE_PATH, request).await?;
        Ok(raw.into_decision())
    }

    async fn moderate(&self, text: &str) -> Result<ModerationLabel, BrokerError> {
        let raw: ModerationResponse = self.post_json(MODERATE_PATH, &TextPayload { text }).await?;
        Ok(raw.label)
    }

    async fn enforce_guardrails(&self, text: &str) -> Result<String, BrokerError> {
        let raw: GuardrailResponse = self
            .post_json(GUARDRAILS_PATH, &TextPayload { text })
            .await?;
        Ok(raw.text)
    }

    async fn run_code(&self, request: &CodeRunRequest) -> Result<CodeRunResult, BrokerError> {
        self.post_json(RUN_CODE_PATH, request).await
    }

    async fn finalize(&self, transcript: &SessionTranscript) -> Result<FinalizeAck, BrokerError> {
        self.post_json(FINALIZE_PATH, transcript).await
    }
}

/// Message shown for a failed call: `detail`, then `message`, then the status text.
pub(crate) fn error_message(status: StatusCode, body: &str) -> String {
    let parsed = serde_json::from_str::<ErrorBody>(body).unwrap_or_default();
    parsed
        .detail
        .and_then(value_text)
        .or_else(|| parsed.message.and_then(value_text))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
        })
}

fn value_text(value: serde_json::Value) -> Option<String> {
    let text = match value {
        serde_json::Value::Null => return None,
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:3000";
pub const DEFAULT_REALTIME_ENDPOINT: &str = "https://api.openai.com/v1/realtime";
pub const DEFAULT_VOICE: &str = "alloy";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(String),

    #[error("Failed to save config: {0}")]
    Write(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub backend: BackendConfig,
    pub realtime: RealtimeConfig,
    pub credentials: CredentialConfig,
    pub reconnect: ReconnectConfig,
    pub audio: AudioConfig,
    pub proctoring: ProctoringConfig,
    pub side_effects: SideEffectConfig,
    pub interview: InterviewConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BACKEND_URL.to_string(),
            auth_token: None,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpEncoding {
    /// Raw offer body sent as `application/sdp`.
    Raw,
    /// Offer wrapped as `{"sdp": ...}` JSON.
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub default_endpoint: String,
    pub default_voice: String,
    pub sdp_encoding: SdpEncoding,
    pub event_queue_capacity: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            default_endpoint: DEFAULT_REALTIME_ENDPOINT.to_string(),
            default_voice: DEFAULT_VOICE.to_string(),
            sdp_encoding: SdpEncoding::Raw,
            event_queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    pub refresh_interval_secs: u64,
    pub refresh_margin_secs: i64,
    pub dedupe_window_ms: u64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 240,
            refresh_margin_secs: 60,
            dedupe_window_ms: 5_000,
        }
    }
}

impl CredentialConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn dedupe_window(&self) -> Duration {
        Duration::from_millis(self.dedupe_window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 16_000,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub level_interval_ms: u64,
    pub input_device_name: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            level_interval_ms: 100,
            input_device_name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProctoringConfig {
    pub max_warnings: u32,
    pub debounce_ms: u64,
    pub soft_limit: u32,
    pub count_tab_switch: bool,
    /// Track clipboard and right-click attempts in per-kind counters.
    pub strict_clipboard: bool,
}

impl Default for ProctoringConfig {
    fn default() -> Self {
        Self {
            max_warnings: 3,
            debounce_ms: 1_500,
            soft_limit: 5,
            count_tab_switch: true,
            strict_clipboard: true,
        }
    }
}

impl ProctoringConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SideEffectConfig {
    pub timeout_secs: u64,
    pub guardrails_enabled: bool,
    pub moderation_enabled: bool,
    pub orchestration_enabled: bool,
}

impl Default for SideEffectConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 8,
            guardrails_enabled: true,
            moderation_enabled: true,
            orchestration_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InterviewConfig {
    pub session_id: String,
    pub candidate_id: Option<String>,
    pub duration_limit_secs: Option<u64>,
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();

        if let Ok(url) = env::var("INTERVIEW_BACKEND_URL") {
            config.backend.base_url = url;
        }
        config.backend.auth_token = env::var("INTERVIEW_AUTH_TOKEN").ok();
        if let Ok(endpoint) = env::var("INTERVIEW_REALTIME_ENDPOINT") {
            config.realtime.default_endpoint = endpoint;
        }
        if let Ok(session_id) = env::var("INTERVIEW_SESSION_ID") {
            config.interview.session_id = session_id;
        }
        config.interview.candidate_id = env::var("INTERVIEW_CANDIDATE_ID").ok();

        if let Some(value) = env_parse::<u32>("INTERVIEW_MAX_WARNINGS") {
            config.proctoring.max_warnings = value;
        }
        if let Some(value) = env_parse::<u32>("INTERVIEW_MAX_RECONNECT_ATTEMPTS") {
            config.reconnect.max_attempts = value;
        }
        if let Some(value) = env_parse::<u64>("INTERVIEW_DURATION_SECS") {
            config.interview.duration_limit_secs = Some(value);
        }

        config.normalize();
        config
    }

    /// Reads a JSON config file; a corrupt file is backed up and replaced by defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
        match serde_json::from_str::<SessionConfig>(&raw) {
            Ok(mut config) => {
                config.normalize();
                Ok(config)
            }
            Err(e) => {
                tracing::warn!("Config at {} is invalid ({}), resetting", path.display(), e);
                let backup = path.with_extension("json.bak");
                let _ = fs::copy(path, backup);
                let config = Self::default();
                config.save(path)?;
                Ok(config)
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| ConfigError::Write(e.to_string()))?;
        }
        let json =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Write(e.to_string()))?;
        fs::write(path, json).map_err(|e| ConfigError::Write(e.to_string()))
    }

    pub fn normalize(&mut self) {
        self.backend.base_url = normalize_url(&self.backend.base_url, DEFAULT_BACKEND_URL);
        self.backend.auth_token = normalize_optional(self.backend.auth_token.take());
        self.backend.request_timeout_secs = self.backend.request_timeout_secs.max(1);

        self.realtime.default_endpoint =
            normalize_url(&self.realtime.default_endpoint, DEFAULT_REALTIME_ENDPOINT);
        if self.realtime.default_voice.trim().is_empty() {
            self.realtime.default_voice = DEFAULT_VOICE.to_string();
        }
        self.realtime.event_queue_capacity = self.realtime.event_queue_capacity.max(1);

        self.credentials.refresh_interval_secs = self.credentials.refresh_interval_secs.max(1);
        self.credentials.refresh_margin_secs = self.credentials.refresh_margin_secs.max(0);

        self.reconnect.base_delay_ms = self.reconnect.base_delay_ms.max(1);
        self.reconnect.max_delay_ms = self.reconnect.max_delay_ms.max(self.reconnect.base_delay_ms);

        self.audio.level_interval_ms = self.audio.level_interval_ms.max(10);
        self.audio.input_device_name = normalize_optional(self.audio.input_device_name.take());

        self.proctoring.max_warnings = self.proctoring.max_warnings.max(1);
        self.proctoring.soft_limit = self.proctoring.soft_limit.max(1);

        self.side_effects.timeout_secs = self.side_effects.timeout_secs.max(1);

        self.interview.session_id = self.interview.session_id.trim().to_string();
        self.interview.candidate_id = normalize_optional(self.interview.candidate_id.take());
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn normalize_url(input: &str, default: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        default.to_string()
    } else {
        trimmed.to_string()
    }
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

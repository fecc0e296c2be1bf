// Local persisted session state: identifiers, auth token and autosave snapshot

use crate::events::ConversationTurn;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const TOKEN_XOR_KEY: &[u8] = b"proctored-interview-v1";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to read session store: {0}")]
    Read(String),

    #[error("Failed to write session store: {0}")]
    Write(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutosaveSnapshot {
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub turns: Vec<ConversationTurnSummary>,
    #[serde(default)]
    pub violation_count: u32,
    #[serde(default)]
    pub code_draft: Option<String>,
}

/// Enough of a turn to restore the transcript view after a reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurnSummary {
    pub id: String,
    pub role: String,
    pub text: String,
    pub finalized: bool,
}

impl From<&ConversationTurn> for ConversationTurnSummary {
    fn from(turn: &ConversationTurn) -> Self {
        Self {
            id: turn.id.clone(),
            role: turn.role.to_string(),
            text: turn.shown_text().to_string(),
            finalized: turn.finalized,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    pub session_id: String,
    #[serde(default)]
    pub candidate_id: Option<String>,
    #[serde(default)]
    auth_token_obfuscated: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub autosave: Option<AutosaveSnapshot>,
}

impl StoredSession {
    fn fresh(session_id: &str, candidate_id: Option<String>) -> Self {
        Self {
            session_id: session_id.to_string(),
            candidate_id,
            auth_token_obfuscated: None,
            started_at: Utc::now(),
            autosave: None,
        }
    }
}

pub struct SessionStore {
    path: PathBuf,
    record: StoredSession,
}

impl SessionStore {
    /// Resumes the stored session when it matches `session_id`, otherwise starts a new record.
    pub fn load_or_create(
        path: &Path,
        session_id: &str,
        candidate_id: Option<String>,
    ) -> Result<Self, StoreError> {
        let existing = if path.exists() {
            let raw = fs::read_to_string(path).map_err(|e| StoreError::Read(e.to_string()))?;
            match serde_json::from_str::<StoredSession>(&raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!("Session store {} is corrupt ({}), resetting", path.display(), e);
                    let _ = fs::copy(path, path.with_extension("json.bak"));
                    None
                }
            }
        } else {
            None
        };

        let record = match existing {
            Some(record) if record.session_id == session_id => {
                tracing::info!("Resuming stored session {}", session_id);
                record
            }
            Some(record) => {
                tracing::info!(
                    "Stored session {} replaced by {}",
                    record.session_id,
                    session_id
                );
                StoredSession::fresh(session_id, candidate_id)
            }
            None => StoredSession::fresh(session_id, candidate_id),
        };

        let store = Self {
            path: path.to_path_buf(),
            record,
        };
        store.save()?;
        Ok(store)
    }

    pub fn record(&self) -> &StoredSession {
        &self.record
    }

    pub fn validate(&self, session_id: &str) -> bool {
        !session_id.trim().is_empty() && self.record.session_id == session_id
    }

    pub fn auth_token(&self) -> Option<String> {
        self.record
            .auth_token_obfuscated
            .as_deref()
            .and_then(deobfuscate_token)
    }

    pub fn set_auth_token(&mut self, token: Option<&str>) -> Result<(), StoreError> {
        self.record.auth_token_obfuscated = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(obfuscate_token);
        self.save()
    }

    pub fn save_snapshot(&mut self, mut snapshot: AutosaveSnapshot) -> Result<(), StoreError> {
        snapshot.saved_at = Some(Utc::now());
        self.record.autosave = Some(snapshot);
        self.save()
    }

    pub fn save(&self) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| StoreError::Write(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(&self.record)
            .map_err(|e| StoreError::Write(e.to_string()))?;
        fs::write(&self.path, json).map_err(|e| StoreError::Write(e.to_string()))
    }
}

fn obfuscate_token(token: &str) -> String {
    let mut bytes = token.as_bytes().to_vec();
    for (idx, byte) in bytes.iter_mut().enumerate() {
        *byte ^= TOKEN_XOR_KEY[idx % TOKEN_XOR_KEY.len()];
    }
    BASE64_STANDARD.encode(bytes)
}

fn deobfuscate_token(obfuscated: &str) -> Option<String> {
    let mut bytes = BASE64_STANDARD.decode(obfuscated).ok()?;
    for (idx, byte) in bytes.iter_mut().enumerate() {
        *byte ^= TOKEN_XOR_KEY[idx % TOKEN_XOR_KEY.len()];
    }
    String::from_utf8(bytes).ok()
}

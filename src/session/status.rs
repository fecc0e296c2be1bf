use super::types::{ConnectionStatus, UiEvent};
use crate::audio::{AudioQuality, AudioState};
use crate::events::AiState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Last user-visible error, kept until dismissed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBanner {
    pub message: String,
    pub fatal: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: String,
    pub ai_state: AiState,
    pub connection: ConnectionStatus,
    pub audio: AudioState,
    pub audio_quality: AudioQuality,
    pub muted: bool,
    pub violations: u32,
    pub max_warnings: u32,
    pub reconnect_attempts: u32,
    pub turn_count: usize,
    pub error: Option<ErrorBanner>,
    pub finalized: bool,
}

/// Forwards component events to the host, remembering the latest error.
pub(crate) fn spawn_ui_relay(
    mut internal: mpsc::UnboundedReceiver<UiEvent>,
    host: mpsc::UnboundedSender<UiEvent>,
    banner: Arc<Mutex<Option<ErrorBanner>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = internal.recv().await {
            if let UiEvent::Error {
                message,
                fatal,
                at,
            } = &event
            {
                if let Ok(mut slot) = banner.lock() {
                    *slot = Some(ErrorBanner {
                        message: message.clone(),
                        fatal: *fatal,
                        at: *at,
                    });
                }
            }
            if host.send(event).is_err() {
                tracing::debug!("Host UI receiver dropped");
            }
        }
    })
}

use crate::audio::{AudioError, AudioQuality, AudioState};
use crate::backend::BrokerError;
use crate::events::{AiState, ConversationTurn};
use crate::proctoring::{ProctorError, SoftSignal, ViolationKind};
use crate::rtc::ConnectionError;
use crate::side_effects::SideEffectFailure;
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

pub type UiSender = mpsc::UnboundedSender<UiEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeReason {
    /// Candidate pressed "end interview".
    Completed,
    ViolationLimit,
    RetryExhausted,
    TimeExpired,
    /// Orchestration decided the interview is over.
    InterviewerEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum View {
    Completion,
}

/// Everything the host UI renders, in emission order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UiEvent {
    AiState {
        state: AiState,
    },
    Connection {
        status: ConnectionStatus,
    },
    AudioState {
        state: AudioState,
    },
    AudioQuality {
        quality: AudioQuality,
    },
    Error {
        message: String,
        fatal: bool,
        at: DateTime<Utc>,
    },
    ViolationWarning {
        kind: ViolationKind,
        count: u32,
        max: u32,
        remaining: u32,
    },
    Toast {
        message: String,
    },
    SoftLimitReached {
        kind: SoftSignal,
        count: u32,
    },
    #[serde(rename_all = "camelCase")]
    Reconnecting {
        attempt: u32,
        delay_ms: u64,
    },
    TurnUpdated {
        turn: ConversationTurn,
    },
    Navigate {
        view: View,
        reason: FinalizeReason,
    },
}

impl UiEvent {
    pub fn error(message: impl Into<String>, fatal: bool) -> Self {
        UiEvent::Error {
            message: message.into(),
            fatal,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Microphone unavailable: {0}")]
    Permission(#[from] AudioError),

    #[error("Could not start the interview: {0}")]
    Broker(#[from] BrokerError),

    #[error("Connection problem: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Connection lost after {attempts} reconnect attempts")]
    RetryExhausted { attempts: u32 },

    #[error("{0}")]
    SideEffect(#[from] SideEffectFailure),

    #[error(transparent)]
    Proctoring(#[from] ProctorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Session already started")]
    AlreadyStarted,

    #[error("Session is not active")]
    NotActive,
}

impl SessionError {
    /// Terminal errors end the interview; the rest are shown in the banner.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Broker(_) | SessionError::RetryExhausted { .. }
        )
    }
}

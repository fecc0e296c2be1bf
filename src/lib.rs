pub mod audio;
pub mod backend;
pub mod config;
pub mod credentials;
pub mod events;
pub mod proctoring;
pub mod reconnect;
pub mod rtc;
pub mod session;
pub mod side_effects;
pub mod store;

#[cfg(test)]
mod testing;

pub use audio::{AudioDeviceManager, AudioError, AudioQuality, AudioState, MicrophoneSource};
pub use backend::{BrokerError, HttpBackend, InterviewBackend};
pub use config::SessionConfig;
pub use credentials::{EphemeralCredential, EphemeralKeyProvider};
pub use events::{AiState, ConversationTurn, Role};
pub use proctoring::{BrowserSignal, KeyPress, SignalSink, ViolationKind};
pub use rtc::{HttpSignaling, PeerTransport, PlaybackSink, TransportFactory};
pub use session::{
    ConnectionStatus, FinalizeReason, InterviewSessionController, SessionDeps, SessionError,
    SessionStatus, SessionTranscript, UiEvent,
};
pub use store::SessionStore;

use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// When `store_path` is given the candidate token is taken from the store
/// if the config has none, and a token from the config is persisted.
pub fn build_http_session(
    mut config: SessionConfig,
    microphone: Arc<dyn MicrophoneSource>,
    transports: Arc<dyn TransportFactory>,
    playback: Arc<dyn PlaybackSink>,
    store_path: Option<&Path>,
    host_ui: mpsc::UnboundedSender<UiEvent>,
) -> Result<Arc<InterviewSessionController>, SessionError> {
    config.normalize();
    if config.interview.session_id.trim().is_empty() {
        config.interview.session_id = uuid::Uuid::new_v4().to_string();
    }

    let store = match store_path {
        Some(path) => {
            let mut store = SessionStore::load_or_create(
                path,
                &config.interview.session_id,
                config.interview.candidate_id.clone(),
            )?;
            match config.backend.auth_token.as_deref() {
                Some(token) => store.set_auth_token(Some(token))?,
                None => config.backend.auth_token = store.auth_token(),
            }
            Some(store)
        }
        None => None,
    };

    let deps = SessionDeps {
        backend: Arc::new(HttpBackend::new(&config.backend, &config.realtime)),
        microphone,
        transports,
        signaling: Arc::new(HttpSignaling::new(config.realtime.sdp_encoding)),
        playback,
        store,
    };
    tracing::info!(
        "Interview session {} configured against {}",
        config.interview.session_id,
        config.backend.base_url
    );
    Ok(InterviewSessionController::new(config, deps, host_ui))
}

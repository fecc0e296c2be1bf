// Interview session lifecycle: startup, supervision, finalization

mod status;
mod transcript;
mod types;

pub use status::{ErrorBanner, SessionStatus};
pub use transcript::{CodeSubmission, SessionTranscript};
pub use types::{ConnectionStatus, FinalizeReason, SessionError, UiEvent, UiSender, View};

use crate::audio::{AudioDeviceManager, MicrophoneSource};
use crate::backend::{CodeRunRequest, CodeRunResult, InterviewBackend};
use crate::config::SessionConfig;
use crate::credentials::EphemeralKeyProvider;
use crate::events::{AiState, Guidance, RealtimeEventRouter, TranscriptLog};
use crate::proctoring::{ProctoringMonitor, SignalSink};
use crate::reconnect::{BackoffPolicy, ReconnectDecision, ReconnectionSupervisor};
use crate::rtc::{PeerConnectionController, PeerLifecycle, PlaybackSink, Signaling, TransportFactory};
use crate::side_effects::SideEffects;
use crate::store::{AutosaveSnapshot, ConversationTurnSummary, SessionStore};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub struct SessionDeps {
    pub backend: Arc<dyn InterviewBackend>,
    pub microphone: Arc<dyn MicrophoneSource>,
    pub transports: Arc<dyn TransportFactory>,
    pub signaling: Arc<dyn Signaling>,
    pub playback: Arc<dyn PlaybackSink>,
    pub store: Option<SessionStore>,
}

struct PendingChannels {
    ui_rx: mpsc::UnboundedReceiver<UiEvent>,
    host_ui: UiSender,
    router: RealtimeEventRouter,
    inbound_rx: mpsc::Receiver<String>,
    lifecycle_rx: mpsc::UnboundedReceiver<PeerLifecycle>,
    guidance_rx: mpsc::UnboundedReceiver<Guidance>,
    finalize_rx: mpsc::UnboundedReceiver<FinalizeReason>,
}

pub struct InterviewSessionController {
    config: SessionConfig,
    session_id: String,
    backend: Arc<dyn InterviewBackend>,
    credentials: Arc<EphemeralKeyProvider>,
    audio: Arc<AudioDeviceManager>,
    peer: Arc<PeerConnectionController>,
    proctoring: Arc<ProctoringMonitor>,
    side_effects: Arc<SideEffects>,
    transcript: Arc<Mutex<TranscriptLog>>,
    ai_state: Arc<watch::Sender<AiState>>,
    connection: watch::Sender<ConnectionStatus>,
    supervisor: Mutex<ReconnectionSupervisor>,
    ui: UiSender,
    banner: Arc<Mutex<Option<ErrorBanner>>>,
    code_submissions: Mutex<Vec<CodeSubmission>>,
    store: Option<Mutex<SessionStore>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    started: AtomicBool,
    finalized: AtomicBool,
    finalize_tx: mpsc::UnboundedSender<FinalizeReason>,
    pending: Mutex<Option<PendingChannels>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    relay: Mutex<Option<JoinHandle<()>>>,
}

impl InterviewSessionController {
    pub fn new(config: SessionConfig, deps: SessionDeps, host_ui: UiSender) -> Arc<Self> {
        let session_id = if config.interview.session_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            config.interview.session_id.clone()
        };

        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(config.realtime.event_queue_capacity.max(1));
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let (guidance_tx, guidance_rx) = mpsc::unbounded_channel();
        let (finalize_tx, finalize_rx) = mpsc::unbounded_channel();

        let side_effects = Arc::new(SideEffects::new(
            deps.backend.clone(),
            config.side_effects.clone(),
        ));
        let router = RealtimeEventRouter::new(
            session_id.clone(),
            side_effects.clone(),
            ui_tx.clone(),
            guidance_tx,
        );
        let transcript = router.transcript();
        let ai_state = router.ai_state();

        let peer = Arc::new(PeerConnectionController::new(
            deps.transports,
            deps.signaling,
            deps.playback,
            inbound_tx,
            lifecycle_tx,
        ));
        let credentials = Arc::new(EphemeralKeyProvider::new(
            deps.backend.clone(),
            session_id.clone(),
            &config.credentials,
        ));
        let audio = Arc::new(AudioDeviceManager::new(
            deps.microphone,
            Duration::from_millis(config.audio.level_interval_ms),
        ));
        let proctoring = Arc::new(ProctoringMonitor::new(
            config.proctoring.clone(),
            ui_tx.clone(),
            finalize_tx.clone(),
        ));
        let supervisor = ReconnectionSupervisor::new(BackoffPolicy::from_config(&config.reconnect));
        let (connection, _) = watch::channel(ConnectionStatus::Disconnected);

        Arc::new(Self {
            session_id,
            backend: deps.backend,
            credentials,
            audio,
            peer,
            proctoring,
            side_effects,
            transcript,
            ai_state,
            connection,
            supervisor: Mutex::new(supervisor),
            ui: ui_tx,
            banner: Arc::new(Mutex::new(None)),
            code_submissions: Mutex::new(Vec::new()),
            store: deps.store.map(Mutex::new),
            started_at: Mutex::new(None),
            started: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            finalize_tx,
            pending: Mutex::new(Some(PendingChannels {
                ui_rx,
                host_ui,
                router,
                inbound_rx,
                lifecycle_rx,
                guidance_rx,
                finalize_rx,
            })),
            tasks: Mutex::new(Vec::new()),
            relay: Mutex::new(None),
            config,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_active(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.finalized.load(Ordering::SeqCst)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    pub fn subscribe_ai_state(&self) -> watch::Receiver<AiState> {
        self.ai_state.subscribe()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.subscribe()
    }

    pub async fn start(self: &Arc<Self>) -> Result<SignalSink, SessionError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyStarted);
        }
        let channels = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.take())
            .ok_or(SessionError::NotActive)?;
        self.spawn_background(channels);

        tracing::info!("Starting interview session {}", self.session_id);
        self.set_connection(ConnectionStatus::Connecting);

        let credential = match self.credentials.fetch_key().await {
            Ok(credential) => credential,
            Err(e) => {
                tracing::error!("Could not mint session key: {}", e);
                let error = SessionError::Broker(e);
                self.emit(UiEvent::error(error.to_string(), error.is_fatal()));
                self.set_connection(ConnectionStatus::Failed);
                self.shutdown();
                return Err(error);
            }
        };
        self.abandon_if_finalized()?;
        self.credentials.start_refresh_loop(self.ui.clone());

        let track = match self.audio.request_access().await {
            Ok(track) => Some(track),
            Err(e) => {
                tracing::warn!("Continuing without microphone: {}", e);
                self.audio.set_muted(true);
                self.emit(UiEvent::error(e.user_message(), false));
                None
            }
        };
        self.abandon_if_finalized()?;

        let sink = self.proctoring.install()?;
        self.mark_started_at();
        self.start_duration_timer();

        match self.peer.connect(&credential, track.as_ref()).await {
            Ok(generation) => {
                tracing::info!("Session {} negotiated peer #{}", self.session_id, generation)
            }
            Err(e) => {
                tracing::warn!("Initial connection failed: {}", e);
                self.emit(UiEvent::error(e.to_string(), false));
                self.on_connection_lost();
            }
        }
        self.abandon_if_finalized()?;

        if let Err(e) = self.autosave() {
            tracing::warn!("Autosave failed: {}", e);
        }
        Ok(sink)
    }

    /// Returns `false` when another call already finalized or is finalizing.
    pub async fn finalize(&self, reason: FinalizeReason) -> bool {
        if self.finalized.swap(true, Ordering::SeqCst) {
            tracing::debug!("Finalize ({:?}) ignored, already finalizing", reason);
            return false;
        }
        tracing::info!("Finalizing session {} ({:?})", self.session_id, reason);

        self.proctoring.gate().begin_submission();
        let transcript = self.build_transcript(reason);
        if let Err(e) = self.autosave() {
            tracing::warn!("Final autosave failed: {}", e);
        }
        self.shutdown();

        match self.backend.finalize(&transcript).await {
            Ok(ack) if ack.success => tracing::info!("Session {} submitted", self.session_id),
            Ok(ack) => tracing::warn!(
                "Backend did not accept session {}: {}",
                self.session_id,
                ack.message.unwrap_or_default()
            ),
            Err(e) => {
                tracing::error!("Session submission failed: {}", e);
                self.emit(UiEvent::error(
                    format!("Could not submit the interview: {}", e),
                    false,
                ));
            }
        }
        self.proctoring.gate().mark_submitted();

        if *self.connection.borrow() != ConnectionStatus::Failed {
            self.set_connection(ConnectionStatus::Disconnected);
        }
        self.emit(UiEvent::Navigate {
            view: View::Completion,
            reason,
        });
        true
    }

    pub async fn end_interview(&self) -> bool {
        self.finalize(FinalizeReason::Completed).await
    }

    pub async fn submit_code(
        &self,
        language: &str,
        source: &str,
        stdin: Option<String>,
    ) -> Result<CodeRunResult, SessionError> {
        if !self.is_active() {
            return Err(SessionError::NotActive);
        }
        let request = CodeRunRequest {
            language: language.to_string(),
            source: source.to_string(),
            stdin,
        };
        let outcome = self.backend.run_code(&request).await;
        match &outcome {
            Ok(_) => tracing::info!("Code submission ran ({})", language),
            Err(e) => tracing::warn!("Code submission failed: {}", e),
        }

        if let Ok(mut submissions) = self.code_submissions.lock() {
            submissions.push(CodeSubmission {
                language: request.language,
                source: request.source,
                submitted_at: Utc::now(),
                result: outcome.as_ref().ok().cloned(),
                error: outcome.as_ref().err().map(|e| e.to_string()),
            });
        }
        outcome.map_err(SessionError::Broker)
    }

    pub fn set_muted(&self, muted: bool) {
        self.audio.set_muted(muted);
        if !muted {
            return;
        }
        let reset = self.ai_state.send_if_modified(|state| {
            if *state == AiState::Listening {
                *state = AiState::Idle;
                true
            } else {
                false
            }
        });
        if reset {
            self.emit(UiEvent::AiState {
                state: AiState::Idle,
            });
        }
    }

    pub fn toggle_mute(&self) -> bool {
        let muted = !self.audio.is_muted();
        self.set_muted(muted);
        muted
    }

    pub fn dismiss_error(&self) {
        if let Ok(mut banner) = self.banner.lock() {
            *banner = None;
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.session_id.clone(),
            ai_state: *self.ai_state.borrow(),
            connection: *self.connection.borrow(),
            audio: self.audio.state(),
            audio_quality: self.audio.quality(),
            muted: self.audio.is_muted(),
            violations: self.proctoring.gate().count(),
            max_warnings: self.proctoring.gate().max(),
            reconnect_attempts: self.supervisor.lock().map(|s| s.attempts()).unwrap_or(0),
            turn_count: self.transcript.lock().map(|t| t.len()).unwrap_or(0),
            error: self.banner.lock().ok().and_then(|b| b.clone()),
            finalized: self.is_finalized(),
        }
    }

    pub fn side_effect_metrics(&self) -> crate::side_effects::SideEffectMetrics {
        self.side_effects.metrics()
    }

    pub fn autosave(&self) -> Result<(), SessionError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let turns = self
            .transcript
            .lock()
            .map(|log| log.turns().iter().map(ConversationTurnSummary::from).collect())
            .unwrap_or_default();
        let code_draft = self
            .code_submissions
            .lock()
            .ok()
            .and_then(|s| s.last().map(|c| c.source.clone()));
        let snapshot = AutosaveSnapshot {
            saved_at: None,
            turns,
            violation_count: self.proctoring.gate().count(),
            code_draft,
        };

        let mut store = store.lock().map_err(|_| SessionError::NotActive)?;
        store.save_snapshot(snapshot)?;
        Ok(())
    }

    fn spawn_background(self: &Arc<Self>, channels: PendingChannels) {
        let relay = status::spawn_ui_relay(channels.ui_rx, channels.host_ui, self.banner.clone());
        if let Ok(mut slot) = self.relay.lock() {
            *slot = Some(relay);
        }

        let router = channels.router.spawn(channels.inbound_rx);
        let supervision = tokio::spawn(supervise(
            Arc::downgrade(self),
            channels.lifecycle_rx,
            channels.guidance_rx,
            channels.finalize_rx,
        ));

        let mut audio_state = self.audio.subscribe_state();
        let ui = self.ui.clone();
        let audio_state_task = tokio::spawn(async move {
            while audio_state.changed().await.is_ok() {
                let state = *audio_state.borrow_and_update();
                let _ = ui.send(UiEvent::AudioState { state });
            }
        });

        let mut quality = self.audio.subscribe_quality();
        let ui = self.ui.clone();
        let quality_task = tokio::spawn(async move {
            while quality.changed().await.is_ok() {
                let quality = *quality.borrow_and_update();
                let _ = ui.send(UiEvent::AudioQuality { quality });
            }
        });

        for task in [router, supervision, audio_state_task, quality_task] {
            self.track_task(task);
        }
    }

    fn on_lifecycle(self: &Arc<Self>, event: PeerLifecycle) {
        if self.is_finalized() {
            return;
        }
        let current = self.peer.snapshot().generation;
        match event {
            PeerLifecycle::Connected { generation } if generation == current => {
                if let Ok(mut supervisor) = self.supervisor.lock() {
                    supervisor.on_connected();
                }
                self.set_connection(ConnectionStatus::Connected);
            }
            PeerLifecycle::Lost { generation, state } if generation == current => {
                tracing::warn!("Peer connection #{} lost ({:?})", generation, state);
                self.on_connection_lost();
            }
            stale => tracing::debug!("Ignoring lifecycle event from old connection: {:?}", stale),
        }
    }

    fn on_guidance(&self, guidance: Guidance) {
        match guidance {
            Guidance::FollowUp { turn_id, prompt } => {
                tracing::info!("Follow-up requested after turn {}", turn_id);
                let event = json!({
                    "type": "response.create",
                    "response": { "instructions": prompt },
                });
                if let Err(e) = self.peer.send_event(&event) {
                    tracing::warn!("Could not send follow-up prompt: {}", e);
                }
            }
            Guidance::End { turn_id, reason } => {
                tracing::info!(
                    "Interviewer ended the session after turn {}: {}",
                    turn_id,
                    reason.unwrap_or_default()
                );
                self.request_finalize(FinalizeReason::InterviewerEnded);
            }
        }
    }

    fn on_connection_lost(self: &Arc<Self>) {
        if self.is_finalized() {
            return;
        }
        let decision = match self.supervisor.lock() {
            Ok(mut supervisor) => supervisor.on_failure(),
            Err(_) => ReconnectDecision::Exhausted { attempts: 0 },
        };

        match decision {
            ReconnectDecision::Retry { attempt, delay } => {
                self.set_connection(ConnectionStatus::Reconnecting);
                self.emit(UiEvent::Reconnecting {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
                let this = self.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    this.run_reconnect(attempt).await;
                });
                self.track_task(task);
            }
            ReconnectDecision::AlreadyScheduled => {
                tracing::debug!("Reconnect already in progress");
            }
            ReconnectDecision::Exhausted { attempts } => {
                self.set_connection(ConnectionStatus::Failed);
                let error = SessionError::RetryExhausted { attempts };
                self.emit(UiEvent::error(error.to_string(), error.is_fatal()));
                self.request_finalize(FinalizeReason::RetryExhausted);
            }
        }
    }

    async fn run_reconnect(self: Arc<Self>, attempt: u32) {
        if self.is_finalized() {
            return;
        }
        tracing::info!("Reconnect attempt {} for session {}", attempt, self.session_id);
        self.peer.disconnect();

        let result = match self.credentials.ensure_fresh().await {
            Ok(credential) => {
                let track = self.audio.track();
                self.peer
                    .connect(&credential, track.as_ref())
                    .await
                    .map_err(SessionError::Connection)
            }
            Err(e) => Err(SessionError::Broker(e)),
        };

        if let Ok(mut supervisor) = self.supervisor.lock() {
            supervisor.finish_attempt();
        }
        if self.is_finalized() {
            tracing::debug!("Reconnect attempt {} finished after session end", attempt);
            self.peer.disconnect();
            return;
        }

        match result {
            Ok(generation) => {
                tracing::info!("Reconnect attempt {} negotiated peer #{}", attempt, generation);
                if *self.connection.borrow() == ConnectionStatus::Reconnecting {
                    self.set_connection(ConnectionStatus::Connecting);
                }
            }
            Err(e) => {
                tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
                self.emit(UiEvent::error(e.to_string(), false));
                self.on_connection_lost();
            }
        }
    }

    /// Startup resumed after the session ended; drop what it acquired.
    fn abandon_if_finalized(&self) -> Result<(), SessionError> {
        if !self.is_finalized() {
            return Ok(());
        }
        tracing::info!("Session {} ended during startup", self.session_id);
        self.credentials.stop();
        self.peer.disconnect();
        self.audio.stop();
        Err(SessionError::NotActive)
    }

    fn request_finalize(&self, reason: FinalizeReason) {
        if self.finalize_tx.send(reason).is_err() {
            tracing::warn!("Finalize request ({:?}) dropped", reason);
        }
    }

    fn start_duration_timer(&self) {
        let Some(limit) = self.config.interview.duration_limit_secs else {
            return;
        };
        let finalize = self.finalize_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(limit)).await;
            tracing::info!("Interview time limit of {}s reached", limit);
            let _ = finalize.send(FinalizeReason::TimeExpired);
        });
        self.track_task(task);
    }

    fn mark_started_at(&self) {
        let resumed = self
            .store
            .as_ref()
            .and_then(|s| s.lock().ok().map(|s| s.record().started_at));
        if let Ok(mut started_at) = self.started_at.lock() {
            *started_at = Some(resumed.unwrap_or_else(Utc::now));
        }
    }

    fn build_transcript(&self, reason: FinalizeReason) -> SessionTranscript {
        SessionTranscript {
            session_id: self.session_id.clone(),
            candidate_id: self.config.interview.candidate_id.clone(),
            started_at: self.started_at.lock().ok().and_then(|s| *s),
            ended_at: Utc::now(),
            reason,
            turns: self
                .transcript
                .lock()
                .map(|log| {
                    log.turns()
                        .iter()
                        .filter(|t| t.finalized || !t.text.trim().is_empty())
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
            violations: self.proctoring.gate().records(),
            soft_events: self.proctoring.soft_events(),
            soft_counters: self.proctoring.soft_counters(),
            code_submissions: self
                .code_submissions
                .lock()
                .map(|s| s.clone())
                .unwrap_or_default(),
        }
    }

    // Leaves the UI relay running.
    fn shutdown(&self) {
        let tasks = self
            .tasks
            .lock()
            .map(|mut t| std::mem::take(&mut *t))
            .unwrap_or_default();
        for task in tasks {
            task.abort();
        }
        self.credentials.stop();
        self.peer.disconnect();
        self.audio.stop();
        self.proctoring.teardown();
        tracing::info!("Session {} resources released", self.session_id);
    }

    fn track_task(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }
    }

    fn set_connection(&self, status: ConnectionStatus) {
        let changed = self.connection.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            tracing::info!("Session connection -> {:?}", status);
            self.emit(UiEvent::Connection { status });
        }
    }

    fn emit(&self, event: UiEvent) {
        let _ = self.ui.send(event);
    }
}

impl Drop for InterviewSessionController {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        if let Ok(mut relay) = self.relay.lock() {
            if let Some(relay) = relay.take() {
                relay.abort();
            }
        }
    }
}

async fn supervise(
    session: Weak<InterviewSessionController>,
    mut lifecycle: mpsc::UnboundedReceiver<PeerLifecycle>,
    mut guidance: mpsc::UnboundedReceiver<Guidance>,
    mut finalize: mpsc::UnboundedReceiver<FinalizeReason>,
) {
    loop {
        tokio::select! {
            Some(event) = lifecycle.recv() => {
                let Some(session) = session.upgrade() else { break };
                session.on_lifecycle(event);
            }
            Some(next) = guidance.recv() => {
                let Some(session) = session.upgrade() else { break };
                session.on_guidance(next);
            }
            Some(reason) = finalize.recv() => {
                let Some(session) = session.upgrade() else { break };
                // Finalize aborts this loop, so it runs on its own task.
                tokio::spawn(async move {
                    session.finalize(reason).await;
                });
            }
            else => break,
        }
    }
}

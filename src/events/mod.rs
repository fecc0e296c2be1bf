// Single-consumer router for realtime data-channel events

mod turns;
mod types;

pub use turns::{ConversationTurn, TranscriptLog, TurnAnnotation};
pub use types::{AiState, DecodeError, Role, ServerEvent};

use crate::backend::{OrchestrationDecision, OrchestrationRequest};
use crate::session::{UiEvent, UiSender};
use crate::side_effects::SideEffects;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Orchestration guidance the session has to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guidance {
    FollowUp { turn_id: String, prompt: String },
    End { turn_id: String, reason: Option<String> },
}

pub struct RealtimeEventRouter {
    session_id: String,
    log: Arc<Mutex<TranscriptLog>>,
    ai_state: Arc<watch::Sender<AiState>>,
    effects: Arc<SideEffects>,
    ui: UiSender,
    guidance: mpsc::UnboundedSender<Guidance>,
    annotations_tx: mpsc::UnboundedSender<TurnAnnotation>,
    annotations_rx: mpsc::UnboundedReceiver<TurnAnnotation>,
}

impl RealtimeEventRouter {
    pub fn new(
        session_id: impl Into<String>,
        effects: Arc<SideEffects>,
        ui: UiSender,
        guidance: mpsc::UnboundedSender<Guidance>,
    ) -> Self {
        let (ai_state, _) = watch::channel(AiState::Idle);
        let (annotations_tx, annotations_rx) = mpsc::unbounded_channel();
        Self {
            session_id: session_id.into(),
            log: Arc::new(Mutex::new(TranscriptLog::new())),
            ai_state: Arc::new(ai_state),
            effects,
            ui,
            guidance,
            annotations_tx,
            annotations_rx,
        }
    }

    /// Read handle on the transcript; the router stays its only writer.
    pub fn transcript(&self) -> Arc<Mutex<TranscriptLog>> {
        self.log.clone()
    }

    pub fn ai_state(&self) -> Arc<watch::Sender<AiState>> {
        self.ai_state.clone()
    }

    pub fn spawn(self, inbound: mpsc::Receiver<String>) -> JoinHandle<()> {
        tokio::spawn(self.run(inbound))
    }

    /// Processes events in arrival order until the inbound channel closes.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<String>) {
        loop {
            tokio::select! {
                biased;
                Some(annotation) = self.annotations_rx.recv() => {
                    self.apply_annotation(annotation);
                }
                message = inbound.recv() => match message {
                    Some(raw) => self.handle_raw(&raw),
                    None => break,
                },
            }
        }
        tracing::debug!("Event router stopped for session {}", self.session_id);
    }

    fn handle_raw(&mut self, raw: &str) {
        match ServerEvent::decode(raw) {
            Ok(event) => self.handle(event),
            Err(e) => tracing::warn!("Dropping realtime message: {}", e),
        }
    }

    pub(crate) fn handle(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SpeechStarted => {
                self.with_log(|log| {
                    log.ensure_open(Role::User);
                });
                self.set_ai_state(AiState::Listening);
            }
            ServerEvent::SpeechStopped => self.set_ai_state(AiState::Thinking),
            ServerEvent::TranscriptDelta { role, delta } => {
                let turn = self.with_log(|log| log.append_delta(role, &delta).clone());
                if let Some(turn) = turn {
                    self.emit(UiEvent::TurnUpdated { turn });
                }
                if role == Role::Assistant {
                    self.set_ai_state(AiState::Speaking);
                }
            }
            ServerEvent::TranscriptDone { role, transcript } => {
                let finalized = self
                    .with_log(|log| {
                        log.finalize(role, transcript.as_deref())
                            .map(|turn| (turn, log.turns().iter().filter(|t| t.finalized).count()))
                    })
                    .flatten();
                if role == Role::Assistant {
                    self.set_ai_state(AiState::Idle);
                }
                if let Some((turn, turn_count)) = finalized {
                    tracing::info!("Finalized {} turn {}", turn.role, turn.id);
                    self.emit(UiEvent::TurnUpdated { turn: turn.clone() });
                    self.spawn_side_effects(turn, turn_count);
                }
            }
            ServerEvent::Error { message } => {
                tracing::error!("Realtime server error: {}", message);
                self.emit(UiEvent::error(message, false));
            }
            ServerEvent::Unknown { kind } => {
                tracing::trace!("Ignoring realtime event {}", kind);
            }
        }
    }

    fn spawn_side_effects(&self, turn: ConversationTurn, turn_count: usize) {
        let effects = self.effects.clone();
        let annotations = self.annotations_tx.clone();
        let text = turn.text.clone();
        let turn_id = turn.id.clone();
        let role = turn.role;
        tokio::spawn(async move {
            let display_text = match role {
                Role::Assistant => Some(effects.scrub(&text).await),
                Role::User => None,
            };
            let moderation_label = effects
                .moderate(display_text.as_deref().unwrap_or(&text))
                .await;
            let _ = annotations.send(TurnAnnotation {
                turn_id,
                display_text: display_text.filter(|scrubbed| *scrubbed != text),
                moderation_label,
            });
        });

        if turn.role != Role::User {
            return;
        }
        let effects = self.effects.clone();
        let guidance = self.guidance.clone();
        let request = OrchestrationRequest {
            session_id: self.session_id.clone(),
            turn_id: turn.id,
            role: turn.role.to_string(),
            text: turn.text,
            turn_count,
        };
        tokio::spawn(async move {
            let next = match effects.orchestrate(&request).await {
                OrchestrationDecision::Continue => return,
                OrchestrationDecision::FollowUp { prompt } => Guidance::FollowUp {
                    turn_id: request.turn_id,
                    prompt,
                },
                OrchestrationDecision::End { reason } => Guidance::End {
                    turn_id: request.turn_id,
                    reason,
                },
            };
            let _ = guidance.send(next);
        });
    }

    fn apply_annotation(&mut self, annotation: TurnAnnotation) {
        let turn = self
            .with_log(|log| log.annotate(annotation).cloned())
            .flatten();
        if let Some(turn) = turn {
            self.emit(UiEvent::TurnUpdated { turn });
        }
    }

    fn set_ai_state(&self, state: AiState) {
        let changed = self.ai_state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::debug!("AI state -> {:?}", state);
            self.emit(UiEvent::AiState { state });
        }
    }

    fn with_log<T>(&self, f: impl FnOnce(&mut TranscriptLog) -> T) -> Option<T> {
        match self.log.lock() {
            Ok(mut log) => Some(f(&mut log)),
            Err(_) => {
                tracing::error!("Transcript lock poisoned");
                None
            }
        }
    }

    fn emit(&self, event: UiEvent) {
        let _ = self.ui.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ModerationLabel;
    use crate::config::SideEffectConfig;
    use crate::testing::FakeBackend;
    use std::time::Duration;

    struct Harness {
        inbound: mpsc::Sender<String>,
        log: Arc<Mutex<TranscriptLog>>,
        ai_state: watch::Receiver<AiState>,
        guidance: mpsc::UnboundedReceiver<Guidance>,
        _ui: mpsc::UnboundedReceiver<UiEvent>,
        backend: Arc<FakeBackend>,
    }

    fn start() -> Harness {
        let backend = Arc::new(FakeBackend::default());
        let effects = Arc::new(SideEffects::new(backend.clone(), SideEffectConfig::default()));
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        let (guidance_tx, guidance_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(32);

        let router = RealtimeEventRouter::new("sess_1", effects, ui_tx, guidance_tx);
        let log = router.transcript();
        let ai_state = router.ai_state().subscribe();
        router.spawn(inbound_rx);

        Harness {
            inbound: inbound_tx,
            log,
            ai_state,
            guidance: guidance_rx,
            _ui: ui_rx,
            backend,
        }
    }

    async fn send(h: &Harness, raw: &str) {
        h.inbound.send(raw.to_string()).await.unwrap();
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_deltas_grow_one_turn_and_done_starts_next() {
        let h = start();
        send(&h, r#"{"type":"response.audio_transcript.delta","delta":"Why "}"#).await;
        send(&h, r#"{"type":"response.audio_transcript.delta","delta":"Rust?"}"#).await;

        let log = h.log.clone();
        wait_until(|| {
            log.lock()
                .unwrap()
                .open_turn(Role::Assistant)
                .map(|t| t.text == "Why Rust?")
                .unwrap_or(false)
        })
        .await;
        assert_eq!(*h.ai_state.borrow(), AiState::Speaking);

        send(&h, r#"{"type":"response.audio_transcript.done","transcript":"Why Rust?"}"#).await;
        send(&h, r#"{"type":"response.audio_transcript.delta","delta":"Next"}"#).await;

        wait_until(|| log.lock().unwrap().len() == 2).await;
        let log = h.log.lock().unwrap();
        assert!(log.turns()[0].finalized);
        assert_eq!(log.turns()[0].text, "Why Rust?");
        assert_ne!(log.turns()[0].id, log.turns()[1].id);
        assert!(!log.turns()[1].finalized);
    }

    #[tokio::test]
    async fn test_ai_state_follows_speech_events() {
        let h = start();
        let mut states = h.ai_state.clone();

        send(&h, r#"{"type":"input_audio_buffer.speech_started"}"#).await;
        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), AiState::Listening);

        send(&h, r#"{"type":"input_audio_buffer.speech_stopped"}"#).await;
        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), AiState::Thinking);

        send(&h, r#"{"type":"response.output_audio_transcript.delta","delta":"Ok"}"#).await;
        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), AiState::Speaking);

        send(&h, r#"{"type":"response.output_audio_transcript.done"}"#).await;
        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), AiState::Idle);
    }

    #[tokio::test]
    async fn test_speech_start_opens_user_turn_before_transcript() {
        let h = start();
        send(&h, r#"{"type":"input_audio_buffer.speech_started"}"#).await;

        let log = h.log.clone();
        wait_until(|| log.lock().unwrap().open_turn(Role::User).is_some()).await;
        let opened_at = log.lock().unwrap().turns()[0].started_at;

        tokio::time::sleep(Duration::from_millis(20)).await;
        send(&h, r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"hello there"}"#).await;
        wait_until(|| log.lock().unwrap().open_turn(Role::User).is_none()).await;

        let log = h.log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log.turns()[0].finalized);
        assert_eq!(log.turns()[0].text, "hello there");
        assert_eq!(log.turns()[0].started_at, opened_at);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_messages_are_ignored() {
        let h = start();
        send(&h, "{not json").await;
        send(&h, r#"{"type":"session.created","session":{}}"#).await;
        send(&h, r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"hello"}"#).await;

        let log = h.log.clone();
        wait_until(|| log.lock().unwrap().len() == 1).await;
        assert_eq!(log.lock().unwrap().turns()[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_finalized_assistant_turn_is_scrubbed_and_labeled() {
        let h = start();
        h.backend.set_moderation(ModerationLabel::Safe);
        send(&h, r#"{"type":"response.audio_transcript.delta","delta":"call me at 555"}"#).await;
        send(&h, r#"{"type":"response.audio_transcript.done"}"#).await;

        let log = h.log.clone();
        wait_until(|| {
            log.lock()
                .unwrap()
                .turns()
                .first()
                .map(|t| t.moderation_label.is_some())
                .unwrap_or(false)
        })
        .await;
        let log = h.log.lock().unwrap();
        let turn = &log.turns()[0];
        assert_eq!(turn.text, "call me at 555");
        assert_eq!(turn.shown_text(), "call me at [redacted]");
        assert_eq!(turn.moderation_label, Some(ModerationLabel::Safe));
    }

    #[tokio::test]
    async fn test_side_effect_failures_leave_turn_intact() {
        let h = start();
        h.backend.fail_side_effects();
        send(&h, r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"my answer"}"#).await;

        let log = h.log.clone();
        wait_until(|| log.lock().unwrap().len() == 1).await;
        wait_until(|| h.backend.moderation_calls() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let log = h.log.lock().unwrap();
        let turn = &log.turns()[0];
        assert!(turn.finalized);
        assert_eq!(turn.shown_text(), "my answer");
        assert_eq!(turn.moderation_label, None);
    }

    #[tokio::test]
    async fn test_user_turn_forwards_follow_up_guidance() {
        let mut h = start();
        h.backend.set_orchestration(OrchestrationDecision::FollowUp {
            prompt: "Can you walk through the complexity?".to_string(),
        });
        send(&h, r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"I used a heap"}"#).await;

        let guidance = tokio::time::timeout(Duration::from_secs(2), h.guidance.recv())
            .await
            .unwrap()
            .unwrap();
        match guidance {
            Guidance::FollowUp { prompt, .. } => {
                assert_eq!(prompt, "Can you walk through the complexity?")
            }
            other => panic!("unexpected guidance {:?}", other),
        }
        assert_eq!(h.backend.orchestration_requests()[0].turn_count, 1);
    }
}

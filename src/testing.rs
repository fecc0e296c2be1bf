// In-process fakes for the backend, microphone and WebRTC seams

use crate::audio::{AudioError, LocalAudioStream, LocalAudioTrack, MicrophoneSource};
use crate::backend::{
    BrokerError, CodeRunRequest, CodeRunResult, FinalizeAck, InterviewBackend, ModerationLabel,
    OrchestrationDecision, OrchestrationRequest,
};
use crate::credentials::{unix_now, EphemeralCredential};
use crate::rtc::{
    ConnectionError, PeerTransport, PlaybackSink, RemoteAudioTrack, Signaling, TransportEvent,
    TransportFactory,
};
use crate::session::SessionTranscript;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Answers exactly one HTTP request and returns the raw request text.
pub async fn serve_once(status_line: &str, body: &str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let status_line = status_line.to_string();
    let body = body.to_string();

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];

        let header_end = loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break raw.len();
            }
            raw.extend_from_slice(&buf[..n]);
            if let Some(pos) = find_header_end(&raw) {
                break pos;
            }
        };

        let headers = String::from_utf8_lossy(&raw[..header_end]).to_ascii_lowercase();
        let content_length = headers
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while raw.len() < header_end + content_length {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
        }

        let response = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status_line,
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        let _ = socket.shutdown().await;
        String::from_utf8_lossy(&raw).to_string()
    });

    (url, handle)
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

#[derive(Default)]
struct BackendState {
    queued: VecDeque<EphemeralCredential>,
    mint_error: Option<BrokerError>,
    side_effects_fail: bool,
    finalize_fails: bool,
    moderation: Option<ModerationLabel>,
    orchestration: OrchestrationDecision,
    orchestration_requests: Vec<OrchestrationRequest>,
    side_effect_delay: Option<Duration>,
    finalized: Vec<SessionTranscript>,
}

#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
    mints: AtomicUsize,
    moderation_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn credential_expiring_at(expires_at: i64) -> EphemeralCredential {
        EphemeralCredential {
            session_id: "sess_1".to_string(),
            key: "ek_test".to_string(),
            webrtc_endpoint: "https://rt.example/v1/realtime".to_string(),
            voice: "alloy".to_string(),
            expires_at,
        }
    }

    pub fn push_credential(&self, credential: EphemeralCredential) {
        self.state.lock().unwrap().queued.push_back(credential);
    }

    pub fn fail_mints_with(&self, error: BrokerError) {
        self.state.lock().unwrap().mint_error = Some(error);
    }

    pub fn mint_count(&self) -> usize {
        self.mints.load(Ordering::SeqCst)
    }

    pub fn fail_side_effects(&self) {
        self.state.lock().unwrap().side_effects_fail = true;
    }

    pub fn fail_finalize(&self) {
        self.state.lock().unwrap().finalize_fails = true;
    }

    pub fn set_moderation(&self, label: ModerationLabel) {
        self.state.lock().unwrap().moderation = Some(label);
    }

    pub fn moderation_calls(&self) -> usize {
        self.moderation_calls.load(Ordering::SeqCst)
    }

    pub fn set_side_effect_delay(&self, delay: Duration) {
        self.state.lock().unwrap().side_effect_delay = Some(delay);
    }

    pub fn set_orchestration(&self, decision: OrchestrationDecision) {
        self.state.lock().unwrap().orchestration = decision;
    }

    pub fn orchestration_requests(&self) -> Vec<OrchestrationRequest> {
        self.state.lock().unwrap().orchestration_requests.clone()
    }

    pub fn finalize_count(&self) -> usize {
        self.state.lock().unwrap().finalized.len()
    }

    pub fn finalized(&self) -> Vec<SessionTranscript> {
        self.state.lock().unwrap().finalized.clone()
    }

    async fn side_effect_gate(&self) -> Result<(), BrokerError> {
        let (delay, fail) = {
            let state = self.state.lock().unwrap();
            (state.side_effect_delay, state.side_effects_fail)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(BrokerError::Http {
                status: 503,
                message: "side effect unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl InterviewBackend for FakeBackend {
    async fn mint_ephemeral_key(
        &self,
        session_id: &str,
    ) -> Result<EphemeralCredential, BrokerError> {
        let n = self.mints.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.lock().unwrap();
        if let Some(error) = &state.mint_error {
            return Err(error.clone());
        }
        Ok(state.queued.pop_front().unwrap_or_else(|| EphemeralCredential {
            session_id: session_id.to_string(),
            key: format!("ek_{}", n),
            ..Self::credential_expiring_at(unix_now() + 300)
        }))
    }

    async fn orchestrate(
        &self,
        request: &OrchestrationRequest,
    ) -> Result<OrchestrationDecision, BrokerError> {
        self.side_effect_gate().await?;
        let mut state = self.state.lock().unwrap();
        state.orchestration_requests.push(request.clone());
        Ok(state.orchestration.clone())
    }

    async fn moderate(&self, _text: &str) -> Result<ModerationLabel, BrokerError> {
        self.moderation_calls.fetch_add(1, Ordering::SeqCst);
        self.side_effect_gate().await?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .moderation
            .unwrap_or(ModerationLabel::Safe))
    }

    async fn enforce_guardrails(&self, text: &str) -> Result<String, BrokerError> {
        self.side_effect_gate().await?;
        Ok(text.replace("555", "[redacted]"))
    }

    async fn run_code(&self, request: &CodeRunRequest) -> Result<CodeRunResult, BrokerError> {
        Ok(CodeRunResult {
            stdout: request.source.clone(),
            stderr: String::new(),
        })
    }

    async fn finalize(&self, transcript: &SessionTranscript) -> Result<FinalizeAck, BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.finalized.push(transcript.clone());
        if state.finalize_fails {
            return Err(BrokerError::Network("connection reset".to_string()));
        }
        Ok(FinalizeAck {
            success: true,
            message: None,
        })
    }
}

pub struct FakeStream {
    id: String,
    enabled: AtomicBool,
    level: Mutex<f32>,
    stops: AtomicUsize,
}

impl FakeStream {
    pub fn is_stopped(&self) -> bool {
        self.stop_count() > 0
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_level(&self, level: f32) {
        *self.level.lock().unwrap() = level;
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl LocalAudioStream for FakeStream {
    fn track(&self) -> LocalAudioTrack {
        LocalAudioTrack {
            id: self.id.clone(),
            label: "Fake microphone".to_string(),
        }
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn level(&self) -> f32 {
        *self.level.lock().unwrap()
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeMicrophone {
    error: Option<AudioError>,
    open_delay: Option<Duration>,
    streams: Mutex<Vec<Arc<FakeStream>>>,
}

impl FakeMicrophone {
    pub fn failing(error: AudioError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    /// Grants access only after `delay`, like a pending permission prompt.
    pub fn slow(delay: Duration) -> Self {
        Self {
            open_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn streams(&self) -> Vec<Arc<FakeStream>> {
        self.streams.lock().unwrap().clone()
    }
}

#[async_trait]
impl MicrophoneSource for FakeMicrophone {
    async fn open(&self) -> Result<Arc<dyn LocalAudioStream>, AudioError> {
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        let mut streams = self.streams.lock().unwrap();
        let stream = Arc::new(FakeStream {
            id: format!("mic-{}", streams.len() + 1),
            enabled: AtomicBool::new(true),
            level: Mutex::new(0.0),
            stops: AtomicUsize::new(0),
        });
        streams.push(stream.clone());
        Ok(stream)
    }
}

pub struct FakeTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    tracks: Mutex<Vec<String>>,
    answer: Mutex<Option<String>>,
    sent: Mutex<Vec<String>>,
    closes: AtomicUsize,
}

impl FakeTransport {
    pub fn tracks(&self) -> Vec<String> {
        self.tracks.lock().unwrap().clone()
    }

    pub fn answer(&self) -> Option<String> {
        self.answer.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    fn add_audio_track(&self, track: &LocalAudioTrack) -> Result<(), ConnectionError> {
        self.tracks.lock().unwrap().push(track.id.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, ConnectionError> {
        Ok("v=0\r\noffer".to_string())
    }

    async fn apply_answer(&self, sdp: &str) -> Result<(), ConnectionError> {
        *self.answer.lock().unwrap() = Some(sdp.to_string());
        Ok(())
    }

    fn send(&self, message: &str) -> Result<(), ConnectionError> {
        if self.close_count() > 0 {
            return Err(ConnectionError::Closed);
        }
        self.sent.lock().unwrap().push(message.to_string());
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeTransportFactory {
    transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeTransportFactory {
    pub fn created(&self) -> usize {
        self.transports.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Arc<FakeTransport>> {
        self.transports.lock().unwrap().last().cloned()
    }
}

impl TransportFactory for FakeTransportFactory {
    fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, ConnectionError> {
        let transport = Arc::new(FakeTransport {
            events,
            tracks: Mutex::new(Vec::new()),
            answer: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        });
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

#[derive(Default)]
pub struct FakeSignaling {
    fail: bool,
}

impl FakeSignaling {
    pub fn failing() -> Self {
        Self { fail: true }
    }
}

#[async_trait]
impl Signaling for FakeSignaling {
    async fn exchange(
        &self,
        _credential: &EphemeralCredential,
        _offer_sdp: &str,
    ) -> Result<String, ConnectionError> {
        if self.fail {
            return Err(ConnectionError::Signaling(BrokerError::Http {
                status: 500,
                message: "realtime endpoint unavailable".to_string(),
            }));
        }
        Ok("v=0\r\nanswer".to_string())
    }
}

#[derive(Default)]
pub struct FakePlayback {
    attached: Mutex<Vec<String>>,
    detaches: AtomicUsize,
}

impl FakePlayback {
    pub fn attached(&self) -> Vec<String> {
        self.attached.lock().unwrap().clone()
    }

    pub fn detach_count(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }
}

impl PlaybackSink for FakePlayback {
    fn attach(&self, track: &RemoteAudioTrack) {
        self.attached.lock().unwrap().push(track.id.clone());
    }

    fn detach(&self) {
        self.detaches.fetch_add(1, Ordering::SeqCst);
    }
}

pub mod signaling;
pub mod state;
pub mod transport;

pub use signaling::{HttpSignaling, Signaling};
pub use state::{IceState, PeerState, SignalingState, TransportState};
pub use transport::{PeerTransport, PlaybackSink, RemoteAudioTrack, TransportEvent, TransportFactory};

use crate::audio::LocalAudioTrack;
use crate::backend::BrokerError;
use crate::credentials::{unix_now, EphemeralCredential};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("Session key expired before connecting")]
    CredentialExpired,

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Signaling failed: {0}")]
    Signaling(BrokerError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLifecycle {
    Connected { generation: u64 },
    Lost { generation: u64, state: PeerState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub state: PeerState,
    pub ice: IceState,
    pub signaling: SignalingState,
    pub generation: u64,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            state: PeerState::New,
            ice: IceState::New,
            signaling: SignalingState::Stable,
            generation: 0,
        }
    }
}

struct ActiveConnection {
    generation: u64,
    transport: Arc<dyn PeerTransport>,
    pump: JoinHandle<()>,
}

pub struct PeerConnectionController {
    factory: Arc<dyn TransportFactory>,
    signaling: Arc<dyn Signaling>,
    playback: Arc<dyn PlaybackSink>,
    inbound: mpsc::Sender<String>,
    lifecycle: mpsc::UnboundedSender<PeerLifecycle>,
    snapshot: Arc<watch::Sender<ConnectionSnapshot>>,
    active: Mutex<Option<ActiveConnection>>,
    generation: AtomicU64,
    clock: fn() -> i64,
}

impl PeerConnectionController {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn Signaling>,
        playback: Arc<dyn PlaybackSink>,
        inbound: mpsc::Sender<String>,
        lifecycle: mpsc::UnboundedSender<PeerLifecycle>,
    ) -> Self {
        let (snapshot, _) = watch::channel(ConnectionSnapshot::default());
        Self {
            factory,
            signaling,
            playback,
            inbound,
            lifecycle,
            snapshot: Arc::new(snapshot),
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
            clock: unix_now,
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        *self.snapshot.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn state(&self) -> PeerState {
        self.snapshot().state
    }

    /// Any previous instance is torn down first. `track` is `None` when the
    /// microphone is unavailable; the connection is then receive-only.
    pub async fn connect(
        &self,
        credential: &EphemeralCredential,
        track: Option<&LocalAudioTrack>,
    ) -> Result<u64, ConnectionError> {
        if credential.is_expired_at((self.clock)()) {
            tracing::warn!("Refusing to connect with an expired session key");
            return Err(ConnectionError::CredentialExpired);
        }

        self.disconnect();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.snapshot.send_replace(ConnectionSnapshot {
            generation,
            ..ConnectionSnapshot::default()
        });
        self.apply_state(generation, |state| state.begin_connect());
        tracing::info!("Peer connection #{} connecting", generation);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = match self.factory.create(events_tx) {
            Ok(transport) => transport,
            Err(e) => {
                self.apply_state(generation, |_| Some(PeerState::Failed));
                return Err(e);
            }
        };

        let pump = self.spawn_pump(generation, events_rx);
        if let Ok(mut guard) = self.active.lock() {
            *guard = Some(ActiveConnection {
                generation,
                transport: transport.clone(),
                pump,
            });
        }

        match self.negotiate(transport.as_ref(), credential, track).await {
            Ok(()) => {
                tracing::info!("Peer connection #{} negotiated", generation);
                Ok(generation)
            }
            Err(e) => {
                tracing::warn!("Peer connection #{} negotiation failed: {}", generation, e);
                self.teardown(Some(generation), PeerState::Failed);
                Err(e)
            }
        }
    }

    /// Full teardown of the current instance. Safe on a closed or never-opened connection.
    pub fn disconnect(&self) {
        self.teardown(None, PeerState::Closed);
    }

    pub fn send_event(&self, event: &serde_json::Value) -> Result<(), ConnectionError> {
        let transport = self
            .active
            .lock()
            .ok()
            .and_then(|a| a.as_ref().map(|c| c.transport.clone()))
            .ok_or(ConnectionError::Closed)?;
        transport.send(&event.to_string())
    }

    async fn negotiate(
        &self,
        transport: &dyn PeerTransport,
        credential: &EphemeralCredential,
        track: Option<&LocalAudioTrack>,
    ) -> Result<(), ConnectionError> {
        match track {
            Some(track) => transport.add_audio_track(track)?,
            None => tracing::warn!("No local audio track, connecting receive-only"),
        }

        let offer = transport.create_offer().await?;
        let answer = self.signaling.exchange(credential, &offer).await?;
        transport.apply_answer(&answer).await
    }

    fn teardown(&self, only_generation: Option<u64>, final_state: PeerState) {
        let taken = match self.active.lock() {
            Ok(mut guard) => {
                let matches = match (guard.as_ref(), only_generation) {
                    (Some(active), Some(generation)) => active.generation == generation,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if matches {
                    guard.take()
                } else {
                    None
                }
            }
            Err(_) => None,
        };

        if let Some(active) = taken {
            active.pump.abort();
            active.transport.close();
            self.playback.detach();
            tracing::info!(
                "Peer connection #{} torn down ({:?})",
                active.generation,
                final_state
            );
        }

        self.snapshot.send_modify(|snapshot| {
            if only_generation.map_or(true, |g| g == snapshot.generation) {
                snapshot.state = final_state;
                if final_state == PeerState::Closed {
                    snapshot.ice = IceState::Closed;
                    snapshot.signaling = SignalingState::Closed;
                }
            }
        });
    }

    fn apply_state(&self, generation: u64, step: impl FnOnce(PeerState) -> Option<PeerState>) {
        apply_state(&self.snapshot, generation, step);
    }

    fn spawn_pump(
        &self,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let snapshot = self.snapshot.clone();
        let lifecycle = self.lifecycle.clone();
        let inbound = self.inbound.clone();
        let playback = self.playback.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::ConnectionState(reported) => {
                        let changed =
                            apply_state(&snapshot, generation, |s| s.on_transport(reported));
                        match changed {
                            Some(PeerState::Connected) => {
                                let _ = lifecycle.send(PeerLifecycle::Connected { generation });
                            }
                            Some(state) if state.is_lost() => {
                                let _ = lifecycle.send(PeerLifecycle::Lost { generation, state });
                            }
                            _ => {}
                        }
                    }
                    TransportEvent::IceState(ice) => {
                        snapshot.send_if_modified(|s| {
                            let current = s.generation == generation && s.ice != ice;
                            if current {
                                s.ice = ice;
                            }
                            current
                        });
                    }
                    TransportEvent::SignalingState(signaling) => {
                        snapshot.send_if_modified(|s| {
                            let current = s.generation == generation && s.signaling != signaling;
                            if current {
                                s.signaling = signaling;
                            }
                            current
                        });
                    }
                    TransportEvent::RemoteTrack(track) => {
                        tracing::info!("Remote audio track {} attached", track.id);
                        playback.attach(&track);
                    }
                    TransportEvent::ChannelOpen => {
                        tracing::info!("Realtime data channel open (#{})", generation);
                    }
                    // A stalled router must not hold up connection state handling.
                    TransportEvent::ChannelMessage(message) => match inbound.try_send(message) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            tracing::warn!(
                                "Realtime event queue full, dropping message (#{})",
                                generation
                            );
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            tracing::debug!("Event router gone, dropping realtime message");
                        }
                    },
                    TransportEvent::ChannelClosed => {
                        tracing::info!("Realtime data channel closed (#{})", generation);
                    }
                }
            }
        })
    }
}

impl Drop for PeerConnectionController {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn apply_state(
    snapshot: &watch::Sender<ConnectionSnapshot>,
    generation: u64,
    step: impl FnOnce(PeerState) -> Option<PeerState>,
) -> Option<PeerState> {
    let mut changed = None;
    snapshot.send_if_modified(|s| {
        if s.generation != generation {
            return false;
        }
        match step(s.state) {
            Some(next) => {
                tracing::debug!("Peer connection #{}: {:?} -> {:?}", generation, s.state, next);
                s.state = next;
                changed = Some(next);
                true
            }
            None => false,
        }
    });
    changed
}

// Seams to the WebRTC engine and the audio output

use super::state::{IceState, SignalingState, TransportState};
use super::ConnectionError;
use crate::audio::LocalAudioTrack;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAudioTrack {
    pub id: String,
}

/// Everything the engine reports for one peer connection, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionState(TransportState),
    IceState(IceState),
    SignalingState(SignalingState),
    RemoteTrack(RemoteAudioTrack),
    ChannelOpen,
    ChannelMessage(String),
    ChannelClosed,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn add_audio_track(&self, track: &LocalAudioTrack) -> Result<(), ConnectionError>;

    async fn create_offer(&self) -> Result<String, ConnectionError>;

    async fn apply_answer(&self, sdp: &str) -> Result<(), ConnectionError>;

    /// Writes one message to the realtime data channel.
    fn send(&self, message: &str) -> Result<(), ConnectionError>;

    /// Stops local tracks, closes the data channel and the connection.
    fn close(&self);
}

pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, ConnectionError>;
}

/// Designated output for the interviewer's voice.
pub trait PlaybackSink: Send + Sync {
    fn attach(&self, track: &RemoteAudioTrack);
    fn detach(&self);
}

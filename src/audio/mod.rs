#[cfg(feature = "native-audio")]
pub mod capture;
pub mod level;

pub use level::AudioQuality;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AudioError {
    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("No microphone found")]
    DeviceNotFound,

    #[error("Microphone error: {0}")]
    Device(String),
}

impl AudioError {
    pub fn user_message(&self) -> String {
        match self {
            AudioError::PermissionDenied => "Microphone access was denied. Allow microphone \
                access to answer by voice; the interview continues muted."
                .to_string(),
            AudioError::DeviceNotFound => {
                "No microphone was found. Connect one to answer by voice.".to_string()
            }
            AudioError::Device(detail) => format!("Could not start the microphone: {}", detail),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioState {
    Idle,
    Requesting,
    Active,
    Muted,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAudioTrack {
    pub id: String,
    pub label: String,
}

pub trait LocalAudioStream: Send + Sync {
    fn track(&self) -> LocalAudioTrack;
    fn set_enabled(&self, enabled: bool);
    /// Normalized input energy in `0.0..=1.0`.
    fn level(&self) -> f32;
    fn stop(&self);
}

#[async_trait]
pub trait MicrophoneSource: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn LocalAudioStream>, AudioError>;
}

pub struct AudioDeviceManager {
    source: Arc<dyn MicrophoneSource>,
    level_interval: Duration,
    stream: Mutex<Option<Arc<dyn LocalAudioStream>>>,
    desired_enabled: Arc<AtomicBool>,
    state: watch::Sender<AudioState>,
    quality: Arc<watch::Sender<AudioQuality>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl AudioDeviceManager {
    pub fn new(source: Arc<dyn MicrophoneSource>, level_interval: Duration) -> Self {
        let (state, _) = watch::channel(AudioState::Idle);
        let (quality, _) = watch::channel(AudioQuality::Unknown);
        Self {
            source,
            level_interval,
            stream: Mutex::new(None),
            desired_enabled: Arc::new(AtomicBool::new(true)),
            state,
            quality: Arc::new(quality),
            monitor: Mutex::new(None),
        }
    }

    pub fn state(&self) -> AudioState {
        *self.state.borrow()
    }

    pub fn quality(&self) -> AudioQuality {
        *self.quality.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AudioState> {
        self.state.subscribe()
    }

    pub fn subscribe_quality(&self) -> watch::Receiver<AudioQuality> {
        self.quality.subscribe()
    }

    pub fn is_muted(&self) -> bool {
        !self.desired_enabled.load(Ordering::SeqCst)
    }

    pub fn track(&self) -> Option<LocalAudioTrack> {
        self.stream
            .lock()
            .ok()
            .and_then(|s| s.as_ref().map(|stream| stream.track()))
    }

    pub async fn request_access(&self) -> Result<LocalAudioTrack, AudioError> {
        self.release();
        self.state.send_replace(AudioState::Requesting);

        let stream = match self.source.open().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Microphone unavailable: {}", e);
                self.state.send_replace(AudioState::Error);
                return Err(e);
            }
        };

        let enabled = self.desired_enabled.load(Ordering::SeqCst);
        stream.set_enabled(enabled);
        let track = stream.track();

        if let Ok(mut guard) = self.stream.lock() {
            *guard = Some(stream.clone());
        }
        self.state.send_replace(if enabled {
            AudioState::Active
        } else {
            AudioState::Muted
        });
        self.start_level_monitor(stream);

        tracing::info!("Microphone ready: {} (enabled={})", track.label, enabled);
        Ok(track)
    }

    pub fn set_muted(&self, muted: bool) {
        self.desired_enabled.store(!muted, Ordering::SeqCst);

        let stream = self.stream.lock().ok().and_then(|s| s.clone());
        if let Some(stream) = stream {
            stream.set_enabled(!muted);
            self.state.send_replace(if muted {
                AudioState::Muted
            } else {
                AudioState::Active
            });
        }
        if muted {
            self.quality.send_replace(AudioQuality::Unknown);
        }
        tracing::info!("Microphone {}", if muted { "muted" } else { "unmuted" });
    }

    pub fn toggle_mute(&self) -> bool {
        let muted = !self.is_muted();
        self.set_muted(muted);
        muted
    }

    /// Releases the stream and the level monitor. Safe to call repeatedly.
    pub fn stop(&self) {
        self.release();
        if *self.state.borrow() != AudioState::Error {
            self.state.send_replace(AudioState::Idle);
        }
    }

    fn release(&self) {
        if let Ok(mut guard) = self.monitor.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        let previous = self.stream.lock().ok().and_then(|mut s| s.take());
        if let Some(stream) = previous {
            stream.stop();
            tracing::debug!("Microphone stream released");
        }
        self.quality.send_replace(AudioQuality::Unknown);
    }

    fn start_level_monitor(&self, stream: Arc<dyn LocalAudioStream>) {
        let enabled = self.desired_enabled.clone();
        let quality = self.quality.clone();
        let period = self.level_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if !enabled.load(Ordering::Relaxed) {
                    continue;
                }
                let rating = AudioQuality::from_level(stream.level());
                quality.send_if_modified(|current| {
                    if *current != rating {
                        *current = rating;
                        true
                    } else {
                        false
                    }
                });
            }
        });

        if let Ok(mut guard) = self.monitor.lock() {
            if let Some(existing) = guard.take() {
                existing.abort();
            }
            *guard = Some(handle);
        }
    }
}

impl Drop for AudioDeviceManager {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMicrophone;

    fn manager(mic: Arc<FakeMicrophone>) -> AudioDeviceManager {
        AudioDeviceManager::new(mic, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_permission_denied_sets_error_state() {
        let mic = Arc::new(FakeMicrophone::failing(AudioError::PermissionDenied));
        let audio = manager(mic);

        let err = audio.request_access().await.unwrap_err();

        assert!(matches!(err, AudioError::PermissionDenied));
        assert_eq!(audio.state(), AudioState::Error);
        assert!(err.user_message().contains("denied"));
        assert!(audio.track().is_none());
    }

    #[test]
    fn test_error_messages_are_distinct() {
        let denied = AudioError::PermissionDenied.user_message();
        let missing = AudioError::DeviceNotFound.user_message();
        let other = AudioError::Device("busy".to_string()).user_message();
        assert_ne!(denied, missing);
        assert_ne!(missing, other);
        assert!(other.contains("busy"));
    }

    #[tokio::test]
    async fn test_mute_survives_stream_recreation() {
        let mic = Arc::new(FakeMicrophone::default());
        let audio = manager(mic.clone());

        audio.request_access().await.unwrap();
        audio.set_muted(true);
        assert_eq!(audio.state(), AudioState::Muted);

        audio.request_access().await.unwrap();

        assert_eq!(audio.state(), AudioState::Muted);
        let streams = mic.streams();
        assert_eq!(streams.len(), 2);
        assert!(streams[0].is_stopped(), "previous stream must be released");
        assert!(!streams[1].is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_level_monitor_reports_quality() {
        let mic = Arc::new(FakeMicrophone::default());
        let audio = manager(mic.clone());
        audio.request_access().await.unwrap();

        mic.streams()[0].set_level(0.5);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(audio.quality(), AudioQuality::Excellent);

        mic.streams()[0].set_level(0.02);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(audio.quality(), AudioQuality::Poor);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mic = Arc::new(FakeMicrophone::default());
        let audio = manager(mic.clone());
        audio.request_access().await.unwrap();

        audio.stop();
        audio.stop();

        assert_eq!(audio.state(), AudioState::Idle);
        assert_eq!(mic.streams()[0].stop_count(), 1);
        assert_eq!(audio.quality(), AudioQuality::Unknown);
    }
}

// Native microphone source backed by cpal

use super::level::{rms_f32, rms_i16};
use super::{AudioError, LocalAudioStream, LocalAudioTrack, MicrophoneSource};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex,
};
use tracing::{error, info};

const RMS_BOOST: f32 = 2.5;

pub struct CpalMicrophone {
    preferred_device: Option<String>,
}

impl CpalMicrophone {
    pub fn new(preferred_device: Option<String>) -> Self {
        Self {
            preferred_device: preferred_device
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
        }
    }

    pub fn list_input_devices() -> Result<Vec<String>, AudioError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| AudioError::Device(e.to_string()))?
            .map(|device| device_display_name(&device))
            .collect::<Vec<_>>();
        Ok(devices)
    }
}

#[async_trait]
impl MicrophoneSource for CpalMicrophone {
    async fn open(&self) -> Result<Arc<dyn LocalAudioStream>, AudioError> {
        let host = cpal::default_host();
        let device = pick_input_device(&host, self.preferred_device.as_deref())
            .ok_or(AudioError::DeviceNotFound)?;

        let device_name = device_display_name(&device);
        info!("Input device: {}", device_name);

        let config = device.default_input_config().map_err(|e| match e {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => AudioError::DeviceNotFound,
            other => classify_backend_error(other.to_string()),
        })?;

        let level = Arc::new(AtomicU32::new(0.0f32.to_bits()));
        let enabled = Arc::new(AtomicBool::new(true));
        let level_clone = level.clone();
        let enabled_clone = enabled.clone();
        let err_fn = |err| error!("an error occurred on stream: {}", err);

        let stream = match config.sample_format() {
            cpal::SampleFormat::I16 => device.build_input_stream(
                &config.into(),
                move |data: &[i16], _: &_| {
                    store_level(rms_i16(data), &enabled_clone, &level_clone)
                },
                err_fn,
                None,
            ),
            cpal::SampleFormat::F32 => device.build_input_stream(
                &config.into(),
                move |data: &[f32], _: &_| {
                    store_level(rms_f32(data), &enabled_clone, &level_clone)
                },
                err_fn,
                None,
            ),
            _ => return Err(AudioError::Device("Unsupported sample format".into())),
        }
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => AudioError::DeviceNotFound,
            other => classify_backend_error(other.to_string()),
        })?;

        stream
            .play()
            .map_err(|e| classify_backend_error(e.to_string()))?;

        Ok(Arc::new(CpalStream {
            stream: Mutex::new(Some(stream)),
            level,
            enabled,
            track: LocalAudioTrack {
                id: uuid::Uuid::new_v4().to_string(),
                label: device_name,
            },
        }))
    }
}

struct CpalStream {
    stream: Mutex<Option<cpal::Stream>>,
    level: Arc<AtomicU32>,
    enabled: Arc<AtomicBool>,
    track: LocalAudioTrack,
}

impl LocalAudioStream for CpalStream {
    fn track(&self) -> LocalAudioTrack {
        self.track.clone()
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.level.store(0.0f32.to_bits(), Ordering::Relaxed);
        }
    }

    fn level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed)).clamp(0.0, 1.0)
    }

    fn stop(&self) {
        if let Ok(mut guard) = self.stream.lock() {
            guard.take();
        }
        self.level.store(0.0f32.to_bits(), Ordering::Relaxed);
    }
}

fn store_level(rms: f32, enabled: &AtomicBool, level: &AtomicU32) {
    let normalized = if enabled.load(Ordering::Relaxed) {
        (rms * RMS_BOOST).clamp(0.0, 1.0)
    } else {
        0.0
    };
    level.store(normalized.to_bits(), Ordering::Relaxed);
}

fn classify_backend_error(message: String) -> AudioError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        AudioError::PermissionDenied
    } else {
        AudioError::Device(message)
    }
}

fn pick_input_device(host: &cpal::Host, preferred_name: Option<&str>) -> Option<cpal::Device> {
    if let Some(name) = preferred_name {
        if let Ok(mut devices) = host.input_devices() {
            if let Some(device) = devices.find(|d| device_display_name(d) == name) {
                return Some(device);
            }
        }
        tracing::warn!(
            "Preferred input device '{}' not found, falling back to default",
            name
        );
    }

    let default_device = host.default_input_device()?;
    let default_name = device_display_name(&default_device);
    if !looks_like_loopback(&default_name) {
        return Some(default_device);
    }

    tracing::warn!(
        "Default device '{}' looks like loopback, trying to pick a microphone input",
        default_name
    );

    if let Ok(mut devices) = host.input_devices() {
        if let Some(alternative) = devices.find(|d| !looks_like_loopback(&device_display_name(d)))
        {
            return Some(alternative);
        }
    }

    Some(default_device)
}

fn device_display_name(device: &cpal::Device) -> String {
    device
        .name()
        .or_else(|_| device.description().map(|d| d.name().to_string()))
        .unwrap_or_else(|_| "Unknown input".to_string())
}

fn looks_like_loopback(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    ["stereo mix", "what u hear", "wave out", "loopback", "monitor"]
        .iter()
        .any(|p| lower.contains(p))
}

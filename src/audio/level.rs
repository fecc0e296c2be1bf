use serde::{Deserialize, Serialize};

const EXCELLENT_THRESHOLD: f32 = 0.25;
const GOOD_THRESHOLD: f32 = 0.08;

/// Input-level rating shown next to the microphone indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioQuality {
    Excellent,
    Good,
    Poor,
    Unknown,
}

impl AudioQuality {
    pub fn from_level(level: f32) -> Self {
        if !level.is_finite() {
            return AudioQuality::Unknown;
        }
        let level = level.clamp(0.0, 1.0);
        if level >= EXCELLENT_THRESHOLD {
            AudioQuality::Excellent
        } else if level >= GOOD_THRESHOLD {
            AudioQuality::Good
        } else {
            AudioQuality::Poor
        }
    }
}

pub fn rms_i16(input: &[i16]) -> f32 {
    if input.is_empty() {
        return 0.0;
    }
    let sum: f32 = input
        .iter()
        .map(|&s| {
            let v = s as f32 / i16::MAX as f32;
            v * v
        })
        .sum();
    (sum / input.len() as f32).sqrt()
}

pub fn rms_f32(input: &[f32]) -> f32 {
    if input.is_empty() {
        return 0.0;
    }
    let sum: f32 = input.iter().map(|&s| s * s).sum();
    (sum / input.len() as f32).sqrt()
}

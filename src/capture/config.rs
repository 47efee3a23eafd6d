use serde::{Deserialize, Serialize};

use crate::analysis::DetectorConfig;
use crate::audio::DeviceConstraints;

/// Container/codec preferences, best first
pub const DEFAULT_ENCODINGS: [&str; 6] = [
    "audio/webm;codecs=opus",
    "audio/webm",
    "audio/ogg;codecs=opus",
    "audio/ogg",
    "audio/mp4",
    "audio/wav",
];

/// Settings for the threshold capture path, snapshotted into each session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub detector: DetectorConfig,
    pub device: DeviceConstraints,

    /// Analysis window size (power of two); the RMS window is half of it
    pub fft_size: usize,
    pub smoothing_time_constant: f32,

    /// Hard ceiling on one recording
    pub max_recording_duration_ms: u64,
    /// How often the pipeline hands over a chunk
    pub chunk_interval_ms: u64,
    /// Detector cadence (~60 Hz)
    pub frame_interval_ms: u64,
    /// Assembled files below this size are rejected as empty
    pub min_capture_bytes: usize,
    pub audio_bits_per_second: u32,
    /// Release the device after every stop, not only on destroy
    pub release_device_on_stop: bool,

    pub encodings: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            device: DeviceConstraints::default(),
            fft_size: 2048,
            smoothing_time_constant: 0.8,
            max_recording_duration_ms: 15_000,
            chunk_interval_ms: 250,
            frame_interval_ms: 16,
            min_capture_bytes: 1000,
            audio_bits_per_second: 128_000,
            release_device_on_stop: true,
            encodings: DEFAULT_ENCODINGS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::DeviceError;

/// Audio sample data (f32 PCM in [-1, 1], interleaved)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw audio samples (interleaved)
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since the stream opened
    pub timestamp_ms: u64,
}

impl AudioFrame {
    /// Number of sample frames (samples per channel)
    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 * 1000.0 / self.sample_rate as f64
    }
}

/// Requested device behavior. Values are ideals: a backend that cannot honor
/// one falls back to the device default, except `device_id` which is exact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConstraints {
    pub device_id: Option<String>,
    pub sample_rate: u32,
    pub channel_count: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for DeviceConstraints {
    fn default() -> Self {
        Self {
            device_id: None,
            sample_rate: 44100,
            channel_count: 1,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// An audio input device as reported by enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputDevice {
    pub id: String,
    pub label: String,
    pub is_default: bool,
}

/// Releases the hardware behind a [`DeviceStream`] (stops all tracks).
pub trait DeviceHandle: Send {
    fn release(&mut self);
}

/// An open device: the frame channel plus exclusive ownership of the device.
///
/// Dropping the stream releases the device, so every exit path that lets go of
/// it also stops capture.
pub struct DeviceStream {
    pub frames: mpsc::Receiver<AudioFrame>,
    /// Resolves once if the device fails mid-stream
    pub fault: oneshot::Receiver<String>,
    pub sample_rate: u32,
    pub channels: u16,
    pub device_label: String,
    handle: Option<Box<dyn DeviceHandle>>,
}

impl DeviceStream {
    pub fn new(
        frames: mpsc::Receiver<AudioFrame>,
        fault: oneshot::Receiver<String>,
        sample_rate: u32,
        channels: u16,
        device_label: impl Into<String>,
        handle: Box<dyn DeviceHandle>,
    ) -> Self {
        Self {
            frames,
            fault,
            sample_rate,
            channels,
            device_label: device_label.into(),
            handle: Some(handle),
        }
    }

    pub fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            debug!("Releasing audio device: {}", self.device_label);
            handle.release();
            self.frames.close();
        }
    }

    pub fn is_released(&self) -> bool {
        self.handle.is_none()
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// Audio capture backend trait
///
/// Implementations:
/// - Microphone: cpal default host
/// - File: replay a recording in real time (batch processing, demos)
#[async_trait::async_trait]
pub trait AudioBackend: Send + Sync {
    /// Whether this backend can capture at all on the current system
    fn is_available(&self) -> bool;

    /// List input devices without opening any of them
    async fn input_devices(&self) -> Result<Vec<InputDevice>, DeviceError>;

    /// Open a device and start delivering frames
    async fn open(&self, constraints: &DeviceConstraints) -> Result<DeviceStream, DeviceError>;

    /// Get backend name for logging
    fn name(&self) -> &str;
}

/// Audio source type
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// Microphone input (all platforms)
    Microphone,
    /// File input (for testing/batch processing)
    File(PathBuf),
}

/// Audio backend factory
pub struct AudioBackendFactory;

impl AudioBackendFactory {
    pub fn create(source: AudioSource) -> Arc<dyn AudioBackend> {
        match source {
            AudioSource::Microphone => Arc::new(super::microphone::MicrophoneBackend::new()),
            AudioSource::File(path) => Arc::new(super::file::FileBackend::new(path)),
        }
    }
}

/// Average interleaved channels into a mono buffer.
pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect()
}

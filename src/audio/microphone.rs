//! System microphone capture via cpal.
//!
//! A cpal stream is not `Send`, so each open device gets a dedicated thread that
//! builds the stream, forwards converted frames into a tokio channel and blocks
//! until the device handle is released.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample, StreamConfig};
use parking_lot::Mutex;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::backend::{
    AudioBackend, AudioFrame, DeviceConstraints, DeviceHandle, DeviceStream, InputDevice,
};
use crate::error::DeviceError;

/// Frames buffered between the device thread and the consumer before drops start
const FRAME_CHANNEL_CAPACITY: usize = 256;

pub struct MicrophoneBackend;

impl MicrophoneBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MicrophoneBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AudioBackend for MicrophoneBackend {
    fn is_available(&self) -> bool {
        cpal::default_host().input_devices().is_ok()
    }

    async fn input_devices(&self) -> Result<Vec<InputDevice>, DeviceError> {
        tokio::task::spawn_blocking(list_input_devices)
            .await
            .map_err(|e| DeviceError::Other(format!("device enumeration task failed: {e}")))?
    }

    async fn open(&self, constraints: &DeviceConstraints) -> Result<DeviceStream, DeviceError> {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (fault_tx, fault_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let constraints = constraints.clone();

        thread::Builder::new()
            .name("voice-capture-mic".into())
            .spawn(move || device_thread(constraints, frame_tx, fault_tx, ready_tx, stop_rx))
            .map_err(|e| DeviceError::Other(format!("failed to spawn device thread: {e}")))?;

        let opened = ready_rx
            .await
            .map_err(|_| DeviceError::Other("device thread exited during open".into()))??;

        info!(
            "Microphone opened: {} ({}Hz, {} channels)",
            opened.label, opened.sample_rate, opened.channels
        );

        Ok(DeviceStream::new(
            frame_rx,
            fault_rx,
            opened.sample_rate,
            opened.channels,
            opened.label,
            Box::new(ThreadHandle { stop_tx: Some(stop_tx) }),
        ))
    }

    fn name(&self) -> &str {
        "cpal microphone"
    }
}

struct ThreadHandle {
    stop_tx: Option<std_mpsc::Sender<()>>,
}

impl DeviceHandle for ThreadHandle {
    fn release(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            // A closed channel means the thread already exited
            let _ = tx.send(());
        }
    }
}

struct OpenedDevice {
    label: String,
    sample_rate: u32,
    channels: u16,
}

fn list_input_devices() -> Result<Vec<InputDevice>, DeviceError> {
    let host = cpal::default_host();
    let default_name = host
        .default_input_device()
        .and_then(|d| d.name().ok())
        .unwrap_or_default();

    let devices = host
        .input_devices()
        .map_err(|e| DeviceError::Other(e.to_string()))?
        .filter_map(|device| {
            let name = device.name().ok()?;
            Some(InputDevice {
                id: name.clone(),
                is_default: name == default_name,
                label: name,
            })
        })
        .collect();

    Ok(devices)
}

fn device_thread(
    constraints: DeviceConstraints,
    frame_tx: mpsc::Sender<AudioFrame>,
    fault_tx: oneshot::Sender<String>,
    ready_tx: oneshot::Sender<Result<OpenedDevice, DeviceError>>,
    stop_rx: std_mpsc::Receiver<()>,
) {
    let fault = Arc::new(Mutex::new(Some(fault_tx)));
    let (stream, opened) = match build_stream(&constraints, frame_tx, fault) {
        Ok(built) => built,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(map_play_error(e)));
        return;
    }

    let label = opened.label.clone();
    if ready_tx.send(Ok(opened)).is_err() {
        // The opener went away; nobody will ever release us
        return;
    }

    // Blocks until the handle is released or dropped
    let _ = stop_rx.recv();

    if let Err(e) = stream.pause() {
        warn!("Failed to pause microphone stream: {}", e);
    }
    drop(stream);
    debug!("Microphone thread for {} exited", label);
}

fn build_stream(
    constraints: &DeviceConstraints,
    frame_tx: mpsc::Sender<AudioFrame>,
    fault: Arc<Mutex<Option<oneshot::Sender<String>>>>,
) -> Result<(cpal::Stream, OpenedDevice), DeviceError> {
    let host = cpal::default_host();

    let device = match constraints.device_id.as_deref() {
        Some(id) => host
            .input_devices()
            .map_err(|e| DeviceError::Other(e.to_string()))?
            .find(|d| d.name().map(|n| n == id).unwrap_or(false))
            .ok_or_else(|| DeviceError::Overconstrained(format!("input device '{id}' not found")))?,
        None => host.default_input_device().ok_or(DeviceError::NotFound)?,
    };
    let label = device.name().unwrap_or_else(|_| "Unknown Device".to_string());

    if constraints.echo_cancellation || constraints.noise_suppression || constraints.auto_gain_control {
        debug!("Host audio processing (echo cancellation, noise suppression, AGC) is not applied by cpal");
    }

    let (format, config) = choose_config(&device, constraints)?;
    let sample_rate = config.sample_rate.0;
    let channels = config.channels;

    info!(
        "Audio config: {}Hz, {} channels, {:?}",
        sample_rate, channels, format
    );

    let stream = match format {
        SampleFormat::F32 => build_input::<f32, _>(&device, &config, frame_tx, fault, |s| s)?,
        SampleFormat::I16 => {
            build_input::<i16, _>(&device, &config, frame_tx, fault, |s| s as f32 / 32_768.0)?
        }
        SampleFormat::U16 => build_input::<u16, _>(&device, &config, frame_tx, fault, |s| {
            (s as f32 - 32_768.0) / 32_768.0
        })?,
        other => {
            return Err(DeviceError::Overconstrained(format!(
                "unsupported sample format {other:?}"
            )))
        }
    };

    Ok((
        stream,
        OpenedDevice {
            label,
            sample_rate,
            channels,
        },
    ))
}

/// Prefer a supported config matching the requested rate and channel count,
/// otherwise take the device default.
fn choose_config(
    device: &cpal::Device,
    constraints: &DeviceConstraints,
) -> Result<(SampleFormat, StreamConfig), DeviceError> {
    let wanted_rate = cpal::SampleRate(constraints.sample_rate);

    if let Ok(ranges) = device.supported_input_configs() {
        for range in ranges {
            let usable_format = matches!(
                range.sample_format(),
                SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16
            );
            if usable_format
                && range.channels() == constraints.channel_count
                && range.min_sample_rate() <= wanted_rate
                && wanted_rate <= range.max_sample_rate()
            {
                let supported = range.with_sample_rate(wanted_rate);
                return Ok((supported.sample_format(), supported.into()));
            }
        }
    }

    let default = device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => DeviceError::InUse,
        cpal::DefaultStreamConfigError::StreamTypeNotSupported => {
            DeviceError::Overconstrained("input stream type not supported".into())
        }
        cpal::DefaultStreamConfigError::BackendSpecific { err } => {
            classify_backend_message(&err.description)
        }
    })?;
    debug!(
        "Requested {}Hz/{}ch unavailable, using device default",
        constraints.sample_rate, constraints.channel_count
    );
    Ok((default.sample_format(), default.into()))
}

fn build_input<T, F>(
    device: &cpal::Device,
    config: &StreamConfig,
    frame_tx: mpsc::Sender<AudioFrame>,
    fault: Arc<Mutex<Option<oneshot::Sender<String>>>>,
    convert: F,
) -> Result<cpal::Stream, DeviceError>
where
    T: SizedSample,
    F: Fn(T) -> f32 + Send + 'static,
{
    let sample_rate = config.sample_rate.0;
    let channels = config.channels;
    let mut frames_sent: u64 = 0;

    let err_fn = move |err: cpal::StreamError| {
        warn!("Audio stream error: {}", err);
        if let Some(tx) = fault.lock().take() {
            let _ = tx.send(err.to_string());
        }
    };

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| convert(s)).collect();
                let timestamp_ms = frames_sent * 1000 / sample_rate.max(1) as u64;
                frames_sent += (samples.len() / channels.max(1) as usize) as u64;

                // Never block the audio callback; a full channel drops the frame
                let _ = frame_tx.try_send(AudioFrame {
                    samples,
                    sample_rate,
                    channels,
                    timestamp_ms,
                });
            },
            err_fn,
            None,
        )
        .map_err(map_build_error)
}

fn map_build_error(err: cpal::BuildStreamError) -> DeviceError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => DeviceError::InUse,
        cpal::BuildStreamError::StreamConfigNotSupported => {
            DeviceError::Overconstrained("stream configuration not supported".into())
        }
        cpal::BuildStreamError::InvalidArgument => {
            DeviceError::Overconstrained("invalid stream argument".into())
        }
        cpal::BuildStreamError::StreamIdOverflow => {
            DeviceError::Other("stream id overflow".into())
        }
        cpal::BuildStreamError::BackendSpecific { err } => {
            classify_backend_message(&err.description)
        }
    }
}

fn map_play_error(err: cpal::PlayStreamError) -> DeviceError {
    match err {
        cpal::PlayStreamError::DeviceNotAvailable => DeviceError::InUse,
        cpal::PlayStreamError::BackendSpecific { err } => classify_backend_message(&err.description),
    }
}

/// Host backends report permission and exclusivity problems only as text.
fn classify_backend_message(message: &str) -> DeviceError {
    let lower = message.to_lowercase();
    if ["permission", "denied", "not authorized", "unauthorized"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        DeviceError::PermissionDenied
    } else if ["busy", "in use", "exclusive"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        DeviceError::InUse
    } else {
        DeviceError::Other(message.to_string())
    }
}

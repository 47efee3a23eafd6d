use anyhow::{anyhow, Context, Result};
use hound::WavReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::backend::{
    AudioBackend, AudioFrame, DeviceConstraints, DeviceHandle, DeviceStream, InputDevice,
};
use crate::error::DeviceError;

/// Replay pacing; one frame per tick
const REPLAY_FRAME_MS: u64 = 20;

/// A fully decoded recording (f32, interleaved)
pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let is_wav = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("wav"))
            .unwrap_or(false);

        let (samples, sample_rate, channels) = if is_wav {
            read_wav(path)?
        } else {
            decode_with_symphonia(path)?
        };

        let duration_seconds =
            samples.len() as f64 / (sample_rate as f64 * channels.max(1) as f64);

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            sample_rate,
            channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate,
            channels,
            samples,
        })
    }
}

fn read_wav(path: &Path) -> Result<(Vec<f32>, u32, u16)> {
    let reader = WavReader::open(path).context("Failed to open WAV file")?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read audio samples")?,
        hound::SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to read audio samples")?
        }
    };

    Ok((samples, spec.sample_rate, spec.channels))
}

fn decode_with_symphonia(path: &Path) -> Result<(Vec<f32>, u32, u16)> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open audio file: {:?}", path))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .context("Unsupported audio container")?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| anyhow!("No decodable audio track"))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("Audio track has no sample rate"))?;
    let channels = codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(1);

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .context("Unsupported audio codec")?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e).context("Failed to read audio packet"),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buffer.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buffer.samples());
            }
            Err(SymphoniaError::DecodeError(e)) => {
                warn!("Skipping undecodable packet: {}", e);
            }
            Err(e) => return Err(e).context("Audio decode failed"),
        }
    }

    Ok((samples, sample_rate, channels))
}

/// Replays a decoded file as if it were a live microphone.
///
/// After the recording runs out, silence is delivered until the stream is
/// released, the way a quiet room keeps a real microphone open.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl AudioBackend for FileBackend {
    fn is_available(&self) -> bool {
        self.path.is_file()
    }

    async fn input_devices(&self) -> Result<Vec<InputDevice>, DeviceError> {
        if !self.path.is_file() {
            return Ok(Vec::new());
        }
        Ok(vec![InputDevice {
            id: self.path.display().to_string(),
            label: format!("File: {}", self.path.display()),
            is_default: true,
        }])
    }

    async fn open(&self, _constraints: &DeviceConstraints) -> Result<DeviceStream, DeviceError> {
        if !self.path.is_file() {
            return Err(DeviceError::NotFound);
        }

        let path = self.path.clone();
        let audio = tokio::task::spawn_blocking(move || AudioFile::open(path))
            .await
            .map_err(|e| DeviceError::Other(format!("file decode task failed: {e}")))?
            .map_err(|e| DeviceError::Other(format!("{e:#}")))?;

        let (frame_tx, frame_rx) = mpsc::channel(64);
        let (fault_tx, fault_rx) = oneshot::channel();
        let sample_rate = audio.sample_rate;
        let channels = audio.channels.max(1);
        let label = audio.path.clone();

        let task = tokio::spawn(replay(audio, frame_tx, fault_tx));

        Ok(DeviceStream::new(
            frame_rx,
            fault_rx,
            sample_rate,
            channels,
            label,
            Box::new(ReplayHandle(task)),
        ))
    }

    fn name(&self) -> &str {
        "file replay"
    }
}

async fn replay(
    audio: AudioFile,
    frame_tx: mpsc::Sender<AudioFrame>,
    _fault_tx: oneshot::Sender<String>,
) {
    let channels = audio.channels.max(1);
    let frame_len = (audio.sample_rate as u64 * REPLAY_FRAME_MS / 1000) as usize * channels as usize;
    let mut ticker = tokio::time::interval(Duration::from_millis(REPLAY_FRAME_MS));
    let mut offset = 0usize;
    let mut timestamp_ms = 0u64;

    loop {
        ticker.tick().await;

        let mut samples = if offset < audio.samples.len() {
            let end = (offset + frame_len).min(audio.samples.len());
            let chunk = audio.samples[offset..end].to_vec();
            offset = end;
            chunk
        } else {
            Vec::new()
        };
        samples.resize(frame_len, 0.0);

        let frame = AudioFrame {
            samples,
            sample_rate: audio.sample_rate,
            channels,
            timestamp_ms,
        };
        if frame_tx.send(frame).await.is_err() {
            break;
        }
        timestamp_ms += REPLAY_FRAME_MS;
    }
}

struct ReplayHandle(JoinHandle<()>);

impl DeviceHandle for ReplayHandle {
    fn release(&mut self) {
        self.0.abort();
    }
}

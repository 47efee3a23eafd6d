//! Output encoding negotiation and the recording pipelines that produce chunks.

use std::fmt;
use tracing::{debug, info, warn};

use super::session::AudioChunk;
use crate::audio::wav::{write_pcm16, WavHeader, WAV_MIME_TYPE};
use crate::audio::{downmix_to_mono, AudioFrame};
use crate::error::CaptureError;

/// A container MIME type with an optional codec parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Encoding {
    essence: String,
    codecs: Option<String>,
}

impl Encoding {
    pub fn parse(mime: &str) -> Self {
        let mut parts = mime.split(';');
        let essence = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        let codecs = parts.find_map(|param| {
            let (key, value) = param.split_once('=')?;
            if key.trim().eq_ignore_ascii_case("codecs") {
                Some(value.trim().trim_matches('"').to_string())
            } else {
                None
            }
        });
        Self { essence, codecs }
    }

    pub fn wav() -> Self {
        Self::parse(WAV_MIME_TYPE)
    }

    /// MIME type without parameters, e.g. `audio/webm`
    pub fn essence(&self) -> &str {
        &self.essence
    }

    pub fn codecs(&self) -> Option<&str> {
        self.codecs.as_deref()
    }

    pub fn is_wav(&self) -> bool {
        matches!(
            self.essence.as_str(),
            "audio/wav" | "audio/wave" | "audio/x-wav" | "audio/vnd.wave"
        )
    }

    pub fn extension(&self) -> &'static str {
        if self.essence.contains("webm") {
            "webm"
        } else if self.essence.contains("ogg") {
            "ogg"
        } else if self.essence.contains("mp4") {
            "m4a"
        } else {
            "wav"
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.codecs {
            Some(codecs) => write!(f, "{};codecs={}", self.essence, codecs),
            None => f.write_str(&self.essence),
        }
    }
}

/// Shape of the audio a pipeline is fed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_second: u32,
}

/// Turns live frames into a sequence of encoded chunks.
#[async_trait::async_trait]
pub trait RecordingPipeline: Send {
    fn encoding(&self) -> &Encoding;

    fn start(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    fn write(&mut self, frame: &AudioFrame) -> Result<(), CaptureError>;

    /// Everything encoded since the previous call, if any
    fn take_chunk(&mut self) -> Option<Vec<u8>>;

    /// Flush the encoder; returns the final chunk
    async fn finish(&mut self) -> Result<Option<Vec<u8>>, CaptureError>;

    /// Join the chunks of one session into a playable file.
    fn assemble(&self, chunks: &[AudioChunk]) -> Vec<u8> {
        let total = chunks.iter().map(|c| c.bytes.len()).sum();
        let mut out = Vec::with_capacity(total);
        for chunk in chunks {
            out.extend_from_slice(&chunk.bytes);
        }
        out
    }
}

pub trait PipelineFactory: Send + Sync {
    fn supports(&self, encoding: &Encoding) -> bool;

    fn create(
        &self,
        encoding: &Encoding,
        format: StreamFormat,
    ) -> Result<Box<dyn RecordingPipeline>, CaptureError>;
}

/// First preference the factory can produce; WAV when none is supported.
pub fn negotiate_encoding<S: AsRef<str>>(preferences: &[S], factory: &dyn PipelineFactory) -> Encoding {
    for preference in preferences {
        let encoding = Encoding::parse(preference.as_ref());
        if factory.supports(&encoding) {
            info!("Using encoding: {}", encoding);
            return encoding;
        }
        debug!("Encoding not supported: {}", encoding);
    }
    warn!("No preferred encoding supported, falling back to {}", WAV_MIME_TYPE);
    Encoding::wav()
}

/// Mono 16-bit PCM; chunks are raw sample data and the header is added on assembly.
pub struct WavPipeline {
    encoding: Encoding,
    sample_rate: u32,
    pending: Vec<u8>,
}

impl WavPipeline {
    pub fn new(format: StreamFormat) -> Self {
        Self {
            encoding: Encoding::wav(),
            sample_rate: format.sample_rate,
            pending: Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl RecordingPipeline for WavPipeline {
    fn encoding(&self) -> &Encoding {
        &self.encoding
    }

    fn write(&mut self, frame: &AudioFrame) -> Result<(), CaptureError> {
        let mono = downmix_to_mono(&frame.samples, frame.channels);
        write_pcm16(&mono, &mut self.pending);
        Ok(())
    }

    fn take_chunk(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    async fn finish(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        Ok(self.take_chunk())
    }

    fn assemble(&self, chunks: &[AudioChunk]) -> Vec<u8> {
        let data_size: usize = chunks.iter().map(|c| c.bytes.len()).sum();
        let header = WavHeader::mono_pcm16(self.sample_rate, data_size as u32);

        let mut out = Vec::with_capacity(header.to_bytes().len() + data_size);
        out.extend_from_slice(&header.to_bytes());
        for chunk in chunks {
            out.extend_from_slice(&chunk.bytes);
        }
        out
    }
}

/// Pipelines available without an external encoder (WAV only)
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPipelineFactory;

impl PipelineFactory for DefaultPipelineFactory {
    fn supports(&self, encoding: &Encoding) -> bool {
        encoding.is_wav()
    }

    fn create(
        &self,
        encoding: &Encoding,
        format: StreamFormat,
    ) -> Result<Box<dyn RecordingPipeline>, CaptureError> {
        if !self.supports(encoding) {
            return Err(CaptureError::Pipeline(format!("unsupported encoding {encoding}")));
        }
        Ok(Box::new(WavPipeline::new(format)))
    }
}

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use super::encoding::{Encoding, RecordingPipeline};
use crate::error::{CaptureError, EmptyReason};

/// One encoded chunk, in arrival order
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub index: usize,
    pub bytes: Vec<u8>,
}

/// A span of detected speech, relative to the session start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechSegment {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl SpeechSegment {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    pub fn is_valid(&self, min_duration_ms: u64) -> bool {
        self.duration_ms() >= min_duration_ms
    }
}

/// A finished capture, ready to hand to an uploader.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub duration_ms: u64,
    pub mime_type: String,
    pub encoding: Encoding,
    pub session_id: String,
    pub speech: Option<SpeechSegment>,
}

impl CaptureResult {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// `<prefix>_<ISO-8601 with ':' and '.' replaced by '-'>.<extension>`
pub fn capture_file_name(prefix: &str, at: DateTime<Utc>, extension: &str) -> String {
    let timestamp = at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("{prefix}_{timestamp}.{extension}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Recording,
    Finished,
}

/// Chunks of one recording attempt. Append-only, drained once by [`finish`](Self::finish).
#[derive(Debug)]
pub struct AudioSession {
    pub id: String,
    pub started_at: Instant,
    pub started_wall: DateTime<Utc>,
    pub encoding: Encoding,
    phase: SessionPhase,
    chunks: Vec<AudioChunk>,
    speech: Option<SpeechSegment>,
}

impl AudioSession {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at: Instant::now(),
            started_wall: Utc::now(),
            encoding,
            phase: SessionPhase::Recording,
            chunks: Vec::new(),
            speech: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub fn push_chunk(&mut self, bytes: Vec<u8>) {
        if self.phase != SessionPhase::Recording || bytes.is_empty() {
            return;
        }
        let index = self.chunks.len();
        self.chunks.push(AudioChunk { index, bytes });
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn set_speech(&mut self, segment: SpeechSegment) {
        self.speech = Some(segment);
    }

    /// Assemble the chunks into one file.
    pub fn finish(
        mut self,
        pipeline: &dyn RecordingPipeline,
        min_capture_bytes: usize,
    ) -> Result<CaptureResult, CaptureError> {
        self.phase = SessionPhase::Finished;
        let duration_ms = self.elapsed_ms();

        if self.chunks.is_empty() {
            warn!("Session {} produced no audio data", self.id);
            return Err(CaptureError::EmptyCapture(EmptyReason::NoData));
        }

        let chunks = std::mem::take(&mut self.chunks);
        let bytes = pipeline.assemble(&chunks);
        if bytes.len() < min_capture_bytes {
            warn!(
                "Session {} audio too small: {} bytes (minimum {})",
                self.id,
                bytes.len(),
                min_capture_bytes
            );
            return Err(CaptureError::EmptyCapture(EmptyReason::TooSmall {
                size: bytes.len(),
                minimum: min_capture_bytes,
            }));
        }

        let file_name = capture_file_name("voice_recording", Utc::now(), self.encoding.extension());
        info!(
            "Recording complete: {} ({} chunks, {} bytes, {}ms)",
            file_name,
            chunks.len(),
            bytes.len(),
            duration_ms
        );

        Ok(CaptureResult {
            file_name,
            bytes,
            duration_ms,
            mime_type: self.encoding.to_string(),
            encoding: self.encoding,
            session_id: self.id,
            speech: self.speech,
        })
    }
}

pub mod config;
pub mod encoding;
pub mod manager;
pub mod session;

pub use config::{CaptureConfig, DEFAULT_ENCODINGS};
pub use encoding::{
    negotiate_encoding, DefaultPipelineFactory, Encoding, PipelineFactory, RecordingPipeline,
    StreamFormat, WavPipeline,
};
pub use manager::CaptureManager;
pub use session::{capture_file_name, AudioChunk, AudioSession, CaptureResult, SpeechSegment};

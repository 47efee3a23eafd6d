pub mod analysis;
pub mod audio;
pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod handoff;
pub mod neural;
pub mod search;

pub use analysis::{DetectorConfig, ShortSpeechPolicy, SignalAnalyzer, ThresholdDetector};
pub use audio::{
    AudioBackend, AudioBackendFactory, AudioFile, AudioFrame, AudioSource, DeviceConstraints,
    DeviceStream, FileBackend, InputDevice, MicrophoneBackend,
};
pub use capture::{
    CaptureConfig, CaptureManager, CaptureResult, DefaultPipelineFactory, Encoding,
    PipelineFactory, RecordingPipeline,
};
pub use config::Config;
pub use error::{CaptureError, DeviceError, EmptyReason};
pub use events::{CaptureEvent, EventEmitter, StopReason, Subscription};
pub use handoff::{CaptureSink, DirectorySink, NatsSink};
pub use neural::{BuiltinLoader, NeuralConfig, NeuralRecorder, RuntimeCache, RuntimeLoader};
pub use search::{StrategyKind, VoiceSearch};

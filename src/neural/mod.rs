pub mod model;
pub mod processor;
pub mod recorder;

pub use model::{
    runtime_available, BuiltinLoader, EarshotProfile, ModelConfig, ModelKind, ModelRuntime,
    RuntimeCache, RuntimeLoader, SpeechModel, MODEL_SAMPLE_RATE,
};
pub use processor::{FrameProcessor, ProcessorEvent, ProcessorOptions};
pub use recorder::{NeuralConfig, NeuralRecorder};

pub mod facade;
pub mod strategy;

pub use facade::{is_secure_endpoint, MicrophoneStatus, PermissionStatus, SearchConfig, VoiceSearch};
pub use strategy::{CaptureStrategy, NeuralStrategy, StrategyKind, ThresholdStrategy};

pub mod analyzer;
pub mod detector;

pub use analyzer::{normalize_level, LevelMeter, SignalAnalyzer};
pub use detector::{DetectorConfig, DetectorEvent, DetectorState, ShortSpeechPolicy, ThresholdDetector};

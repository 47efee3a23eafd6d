use thiserror::Error;

/// Failure to acquire or keep an audio input device.
///
/// Every variant carries a message that can be shown to the user as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("Microphone permission denied. Please allow microphone access in your system settings.")]
    PermissionDenied,

    #[error("No microphone found. Please connect a microphone and try again.")]
    NotFound,

    #[error("Microphone is in use by another application.")]
    InUse,

    #[error("Microphone does not meet requirements ({0}). Try a different device.")]
    Overconstrained(String),

    #[error("Audio device error: {0}")]
    Other(String),
}

/// Why a capture produced no file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyReason {
    /// No chunk was ever emitted by the pipeline
    NoData,
    /// The assembled file is below the configured byte floor
    TooSmall { size: usize, minimum: usize },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Audio capture not initialized. Call initialize() first.")]
    NotInitialized,

    #[error("A capture session is already active")]
    AlreadyActive,

    #[error("Speech model failed to load: {0}")]
    ModelLoad(String),

    #[error("Recording error: {0}")]
    Pipeline(String),

    #[error("{}", empty_message(.0))]
    EmptyCapture(EmptyReason),

    #[error("Capture was torn down before it finished starting")]
    Cancelled,
}

fn empty_message(reason: &EmptyReason) -> String {
    match reason {
        EmptyReason::NoData => "No audio data captured".to_string(),
        EmptyReason::TooSmall { size, minimum } => {
            format!("Audio too short or empty ({size} bytes, minimum {minimum})")
        }
    }
}

impl CaptureError {
    /// Model failures are the only ones a caller can recover from by switching strategy.
    pub fn is_model_load(&self) -> bool {
        matches!(self, CaptureError::ModelLoad(_))
    }
}

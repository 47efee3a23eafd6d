use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::audio::AudioBackend;
use crate::capture::{CaptureConfig, CaptureManager, Encoding, PipelineFactory};
use crate::error::CaptureError;
use crate::events::{CaptureEvent, EventEmitter};
use crate::neural::{runtime_available, NeuralConfig, NeuralRecorder, RuntimeLoader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Threshold,
    #[default]
    Neural,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Threshold => f.write_str("threshold"),
            StrategyKind::Neural => f.write_str("neural"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "threshold" | "rms" => Ok(StrategyKind::Threshold),
            "neural" | "vad" | "model" => Ok(StrategyKind::Neural),
            other => Err(format!("unknown capture strategy '{other}'")),
        }
    }
}

/// One way of turning a microphone into a finished capture.
#[async_trait::async_trait]
pub trait CaptureStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn events(&self) -> &EventEmitter<CaptureEvent>;

    /// Whether everything this strategy processes audio with is present
    fn processing_available(&self) -> bool;

    async fn start(&self) -> Result<(), CaptureError>;

    fn stop(&self) -> bool;

    fn is_recording(&self) -> bool;

    fn destroy(&self);
}

/// RMS detector + recording pipeline, initializing the graph on first start.
pub struct ThresholdStrategy {
    manager: CaptureManager,
    pipelines: Arc<dyn PipelineFactory>,
}

impl ThresholdStrategy {
    pub fn new(
        config: CaptureConfig,
        backend: Arc<dyn AudioBackend>,
        pipelines: Arc<dyn PipelineFactory>,
    ) -> Self {
        Self {
            manager: CaptureManager::new(config, backend, Arc::clone(&pipelines)),
            pipelines,
        }
    }

    pub fn manager(&self) -> &CaptureManager {
        &self.manager
    }
}

#[async_trait::async_trait]
impl CaptureStrategy for ThresholdStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Threshold
    }

    fn events(&self) -> &EventEmitter<CaptureEvent> {
        self.manager.events()
    }

    fn processing_available(&self) -> bool {
        // Negotiation falls back to WAV
        self.pipelines.supports(&Encoding::wav())
            || self
                .manager
                .config()
                .encodings
                .iter()
                .any(|e| self.pipelines.supports(&Encoding::parse(e)))
    }

    async fn start(&self) -> Result<(), CaptureError> {
        // A just-stopped session may still own the device
        self.manager.settled().await;
        if !self.manager.is_initialized() {
            self.manager.initialize(None).await?;
        }
        self.manager.start()
    }

    fn stop(&self) -> bool {
        self.manager.stop()
    }

    fn is_recording(&self) -> bool {
        self.manager.is_recording()
    }

    fn destroy(&self) {
        self.manager.destroy();
    }
}

pub struct NeuralStrategy {
    recorder: NeuralRecorder,
}

impl NeuralStrategy {
    pub fn new(
        config: NeuralConfig,
        capture: &CaptureConfig,
        backend: Arc<dyn AudioBackend>,
        loader: Arc<dyn RuntimeLoader>,
    ) -> Self {
        Self {
            recorder: NeuralRecorder::new(config, capture.device.clone(), backend, loader),
        }
    }

    pub fn from_recorder(recorder: NeuralRecorder) -> Self {
        Self { recorder }
    }

    pub fn recorder(&self) -> &NeuralRecorder {
        &self.recorder
    }
}

#[async_trait::async_trait]
impl CaptureStrategy for NeuralStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Neural
    }

    fn events(&self) -> &EventEmitter<CaptureEvent> {
        self.recorder.events()
    }

    fn processing_available(&self) -> bool {
        runtime_available(self.recorder.config().model.kind)
    }

    async fn start(&self) -> Result<(), CaptureError> {
        self.recorder.start().await
    }

    fn stop(&self) -> bool {
        self.recorder.stop()
    }

    fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    fn destroy(&self) {
        self.recorder.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_kind_parsing() {
        assert_eq!("threshold".parse::<StrategyKind>(), Ok(StrategyKind::Threshold));
        assert_eq!("Neural".parse::<StrategyKind>(), Ok(StrategyKind::Neural));
        assert!("magic".parse::<StrategyKind>().is_err());
        assert_eq!(StrategyKind::Threshold.to_string(), "threshold");
    }
}

//! Entry point for voice search: capability probes, permission checks and a
//! capture strategy that falls back from the speech model to the RMS detector.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::strategy::{CaptureStrategy, NeuralStrategy, StrategyKind, ThresholdStrategy};
use crate::audio::AudioBackend;
use crate::capture::{CaptureConfig, PipelineFactory};
use crate::error::{CaptureError, DeviceError};
use crate::events::{CaptureEvent, EventEmitter, Subscription};
use crate::neural::{NeuralConfig, RuntimeLoader};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub strategy: StrategyKind,
    /// Swap to the threshold strategy when the speech model cannot load
    pub fallback_to_threshold: bool,
    /// Where finished captures are uploaded; must be https or loopback
    pub upload_endpoint: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Neural,
            fallback_to_threshold: true,
            upload_endpoint: "http://localhost:8000/api/voice-search".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MicrophoneStatus {
    pub available: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionStatus {
    pub granted: bool,
    pub error: Option<String>,
}

/// Uploads may only leave the machine encrypted.
pub fn is_secure_endpoint(endpoint: &str) -> bool {
    let Some((scheme, rest)) = endpoint.split_once("://") else {
        return false;
    };
    if scheme.eq_ignore_ascii_case("https") || scheme.eq_ignore_ascii_case("wss") {
        return true;
    }

    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = match authority.strip_prefix('[') {
        Some(v6) => v6.split(']').next().unwrap_or_default(),
        None => authority.rsplit_once(':').map(|(h, _)| h).unwrap_or(authority),
    };
    let host = host.to_ascii_lowercase();
    host == "localhost" || host.ends_with(".localhost") || host == "::1" || host.starts_with("127.")
}

struct Active {
    strategy: Arc<dyn CaptureStrategy>,
    _forward: Subscription,
}

pub struct VoiceSearch {
    config: SearchConfig,
    capture: CaptureConfig,
    backend: Arc<dyn AudioBackend>,
    pipelines: Arc<dyn PipelineFactory>,
    events: EventEmitter<CaptureEvent>,
    active: Mutex<Active>,
}

impl VoiceSearch {
    pub fn new(
        config: SearchConfig,
        capture: CaptureConfig,
        neural: NeuralConfig,
        backend: Arc<dyn AudioBackend>,
        pipelines: Arc<dyn PipelineFactory>,
        loader: Arc<dyn RuntimeLoader>,
    ) -> Self {
        let strategy: Arc<dyn CaptureStrategy> = match config.strategy {
            StrategyKind::Threshold => Arc::new(ThresholdStrategy::new(
                capture.clone(),
                Arc::clone(&backend),
                Arc::clone(&pipelines),
            )),
            StrategyKind::Neural => Arc::new(NeuralStrategy::new(
                neural,
                &capture,
                Arc::clone(&backend),
                loader,
            )),
        };
        Self::with_strategy(config, capture, backend, pipelines, strategy)
    }

    /// Use a prebuilt strategy instead of the one `config.strategy` names.
    pub fn with_strategy(
        config: SearchConfig,
        capture: CaptureConfig,
        backend: Arc<dyn AudioBackend>,
        pipelines: Arc<dyn PipelineFactory>,
        strategy: Arc<dyn CaptureStrategy>,
    ) -> Self {
        info!("Voice search using {} strategy", strategy.kind());
        let events = EventEmitter::new();
        let active = Mutex::new(Self::activate(strategy, &events));
        Self {
            config,
            capture,
            backend,
            pipelines,
            events,
            active,
        }
    }

    fn activate(strategy: Arc<dyn CaptureStrategy>, events: &EventEmitter<CaptureEvent>) -> Active {
        let target = events.clone();
        let forward = strategy.events().subscribe(move |event| target.emit(event));
        Active {
            strategy,
            _forward: forward,
        }
    }

    pub fn events(&self) -> &EventEmitter<CaptureEvent> {
        &self.events
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.active.lock().strategy.kind()
    }

    fn strategy(&self) -> Arc<dyn CaptureStrategy> {
        Arc::clone(&self.active.lock().strategy)
    }

    pub fn is_supported(&self) -> bool {
        let strategy = self.strategy();
        let processing = strategy.processing_available()
            || (strategy.kind() == StrategyKind::Neural && self.config.fallback_to_threshold);

        self.backend.is_available() && processing && is_secure_endpoint(&self.config.upload_endpoint)
    }

    /// Enumerate input devices without opening one.
    pub async fn check_microphone(&self) -> MicrophoneStatus {
        if !self.backend.is_available() {
            return MicrophoneStatus {
                available: false,
                error: Some("Audio input is not supported on this system".to_string()),
            };
        }

        match self.backend.input_devices().await {
            Ok(devices) if !devices.is_empty() => MicrophoneStatus {
                available: true,
                error: None,
            },
            Ok(_) => MicrophoneStatus {
                available: false,
                error: Some(DeviceError::NotFound.to_string()),
            },
            Err(e) => MicrophoneStatus {
                available: false,
                error: Some(e.to_string()),
            },
        }
    }

    /// Open the device once and release it straight away.
    pub async fn request_permission(&self) -> PermissionStatus {
        match self.backend.open(&self.capture.device).await {
            Ok(mut stream) => {
                stream.release();
                PermissionStatus {
                    granted: true,
                    error: None,
                }
            }
            Err(e) => PermissionStatus {
                granted: false,
                error: Some(e.to_string()),
            },
        }
    }

    /// Start a capture. Failures are reported through [`CaptureEvent::Error`].
    pub async fn start_recording(&self) -> bool {
        let strategy = self.strategy();
        if strategy.is_recording() {
            warn!("Voice search already recording");
            return false;
        }

        match strategy.start().await {
            Ok(()) => true,
            Err(e) if e.is_model_load() && self.can_fall_back(strategy.as_ref()) => {
                warn!("Speech model unavailable ({}), falling back to threshold detection", e);
                strategy.destroy();

                let fallback: Arc<dyn CaptureStrategy> = Arc::new(ThresholdStrategy::new(
                    self.capture.clone(),
                    Arc::clone(&self.backend),
                    Arc::clone(&self.pipelines),
                ));
                *self.active.lock() = Self::activate(Arc::clone(&fallback), &self.events);

                match fallback.start().await {
                    Ok(()) => true,
                    Err(e) => self.report(e),
                }
            }
            Err(e) => self.report(e),
        }
    }

    fn can_fall_back(&self, strategy: &dyn CaptureStrategy) -> bool {
        self.config.fallback_to_threshold && strategy.kind() == StrategyKind::Neural
    }

    fn report(&self, error: CaptureError) -> bool {
        if error == CaptureError::Cancelled {
            debug!("Voice search start cancelled by cleanup");
        } else {
            warn!("Voice search failed to start: {}", error);
            self.events.emit(&CaptureEvent::Error(error));
        }
        false
    }

    pub fn stop_recording(&self) -> bool {
        self.strategy().stop()
    }

    pub fn is_recording(&self) -> bool {
        self.strategy().is_recording()
    }

    /// Release every resource; safe to call when nothing was started.
    pub fn cleanup(&self) {
        let strategy = self.strategy();
        strategy.stop();
        strategy.destroy();
    }
}

impl Drop for VoiceSearch {
    fn drop(&mut self) {
        self.cleanup();
    }
}

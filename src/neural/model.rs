//! Speech-probability models and the process-wide runtime cache.
//!
//! A [`RuntimeLoader`] produces a [`ModelRuntime`] (the expensive, shareable part,
//! e.g. an ONNX model image); each recorder then creates its own stateful
//! [`SpeechModel`] from it.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::CaptureError;

/// Sample rate every speech model consumes
pub const MODEL_SAMPLE_RATE: u32 = 16_000;

pub trait SpeechModel: Send {
    /// Samples per inference frame at [`MODEL_SAMPLE_RATE`]
    fn frame_samples(&self) -> usize;

    /// Probability in 0..=1 that `frame` contains speech
    fn speech_probability(&mut self, frame: &[f32]) -> Result<f32, CaptureError>;

    fn reset(&mut self);
}

pub trait ModelRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn create_model(&self) -> Result<Box<dyn SpeechModel>, CaptureError>;
}

#[async_trait::async_trait]
pub trait RuntimeLoader: Send + Sync {
    /// Cache key; loaders with the same id share one runtime
    fn id(&self) -> String;

    async fn load(&self) -> Result<Arc<dyn ModelRuntime>, CaptureError>;
}

/// Single-flight runtime cache keyed by loader id.
///
/// Concurrent callers for the same id wait on one load. A failed load leaves the
/// slot empty so the next caller retries.
#[derive(Default)]
pub struct RuntimeCache {
    slots: Mutex<HashMap<String, Arc<OnceCell<Arc<dyn ModelRuntime>>>>>,
}

static GLOBAL_CACHE: Lazy<RuntimeCache> = Lazy::new(RuntimeCache::new);

impl RuntimeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static RuntimeCache {
        &GLOBAL_CACHE
    }

    pub async fn get_or_load(
        &self,
        loader: &dyn RuntimeLoader,
    ) -> Result<Arc<dyn ModelRuntime>, CaptureError> {
        let id = loader.id();
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(id.clone()).or_default())
        };

        if let Some(runtime) = slot.get() {
            debug!("Speech model runtime cache hit: {}", id);
            return Ok(Arc::clone(runtime));
        }

        let runtime = slot
            .get_or_try_init(|| async {
                info!("Loading speech model runtime: {}", id);
                loader.load().await
            })
            .await?;
        Ok(Arc::clone(runtime))
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.slots
            .lock()
            .get(id)
            .map(|slot| slot.initialized())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    #[default]
    Earshot,
    Silero,
}

/// WebRTC-style aggressiveness for the earshot model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarshotProfile {
    #[default]
    Quality,
    LowBitrate,
    Aggressive,
    VeryAggressive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub kind: ModelKind,
    pub earshot_profile: EarshotProfile,
    /// ONNX file for the silero model
    pub silero_model_path: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            kind: ModelKind::Earshot,
            earshot_profile: EarshotProfile::Quality,
            silero_model_path: None,
        }
    }
}

/// Whether a runtime for `kind` was compiled into this build.
pub fn runtime_available(kind: ModelKind) -> bool {
    match kind {
        ModelKind::Earshot => cfg!(feature = "vad_earshot"),
        ModelKind::Silero => cfg!(feature = "silero"),
    }
}

/// Loads whichever runtime the model configuration selects.
pub struct BuiltinLoader {
    config: ModelConfig,
}

impl BuiltinLoader {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl RuntimeLoader for BuiltinLoader {
    fn id(&self) -> String {
        match self.config.kind {
            ModelKind::Earshot => format!("earshot:{:?}", self.config.earshot_profile),
            ModelKind::Silero => format!(
                "silero:{}",
                self.config
                    .silero_model_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            ),
        }
    }

    async fn load(&self) -> Result<Arc<dyn ModelRuntime>, CaptureError> {
        match self.config.kind {
            ModelKind::Earshot => load_earshot(self.config.earshot_profile),
            ModelKind::Silero => {
                let path = self.config.silero_model_path.clone().ok_or_else(|| {
                    CaptureError::ModelLoad("no silero model path configured".into())
                })?;
                load_silero(path).await
            }
        }
    }
}

#[cfg(feature = "vad_earshot")]
fn load_earshot(profile: EarshotProfile) -> Result<Arc<dyn ModelRuntime>, CaptureError> {
    Ok(Arc::new(earshot_model::EarshotRuntime::new(profile)))
}

#[cfg(not(feature = "vad_earshot"))]
fn load_earshot(_profile: EarshotProfile) -> Result<Arc<dyn ModelRuntime>, CaptureError> {
    Err(CaptureError::ModelLoad(
        "earshot support not compiled in (enable the `vad_earshot` feature)".into(),
    ))
}

#[cfg(feature = "silero")]
async fn load_silero(path: PathBuf) -> Result<Arc<dyn ModelRuntime>, CaptureError> {
    let runtime = tokio::task::spawn_blocking(move || silero_model::SileroRuntime::load(&path))
        .await
        .map_err(|e| CaptureError::ModelLoad(format!("model load task failed: {e}")))??;
    Ok(Arc::new(runtime))
}

#[cfg(not(feature = "silero"))]
async fn load_silero(_path: PathBuf) -> Result<Arc<dyn ModelRuntime>, CaptureError> {
    Err(CaptureError::ModelLoad(
        "silero support not compiled in (enable the `silero` feature)".into(),
    ))
}

#[cfg(feature = "vad_earshot")]
mod earshot_model {
    use super::{EarshotProfile, ModelRuntime, SpeechModel};
    use crate::error::CaptureError;
    use earshot::{VoiceActivityDetector, VoiceActivityProfile};

    /// 30 ms at 16 kHz
    const EARSHOT_FRAME: usize = 480;

    pub struct EarshotRuntime {
        profile: EarshotProfile,
    }

    impl EarshotRuntime {
        pub fn new(profile: EarshotProfile) -> Self {
            Self { profile }
        }
    }

    impl ModelRuntime for EarshotRuntime {
        fn name(&self) -> &str {
            "earshot"
        }

        fn create_model(&self) -> Result<Box<dyn SpeechModel>, CaptureError> {
            let profile = match self.profile {
                EarshotProfile::Quality => VoiceActivityProfile::QUALITY,
                EarshotProfile::LowBitrate => VoiceActivityProfile::LBR,
                EarshotProfile::Aggressive => VoiceActivityProfile::AGGRESSIVE,
                EarshotProfile::VeryAggressive => VoiceActivityProfile::VERY_AGGRESSIVE,
            };
            Ok(Box::new(EarshotModel {
                detector: VoiceActivityDetector::new(profile),
                scratch: Vec::with_capacity(EARSHOT_FRAME),
            }))
        }
    }

    /// Earshot gives a binary decision; it is reported as probability 0 or 1.
    struct EarshotModel {
        detector: VoiceActivityDetector,
        scratch: Vec<i16>,
    }

    impl SpeechModel for EarshotModel {
        fn frame_samples(&self) -> usize {
            EARSHOT_FRAME
        }

        fn speech_probability(&mut self, frame: &[f32]) -> Result<f32, CaptureError> {
            self.scratch.clear();
            self.scratch
                .extend(frame.iter().map(|&s| (s.clamp(-1.0, 1.0) * 32_767.0) as i16));
            self.scratch.resize(EARSHOT_FRAME, 0);

            match self.detector.predict_16khz(&self.scratch) {
                Ok(true) => Ok(1.0),
                Ok(false) => Ok(0.0),
                Err(e) => Err(CaptureError::Pipeline(format!("earshot inference failed: {e:?}"))),
            }
        }

        fn reset(&mut self) {
            self.detector.reset();
        }
    }
}

#[cfg(feature = "silero")]
mod silero_model {
    use super::{ModelRuntime, SpeechModel, MODEL_SAMPLE_RATE};
    use crate::error::CaptureError;
    use ndarray::{Array2, Array3};
    use ort::session::Session;
    use ort::value::Value;
    use std::path::Path;

    const SILERO_FRAME: usize = 512;
    const STATE_LEN: usize = 128;

    // Tensor names declared by the silero v4 graph
    const INPUT_AUDIO: &str = "input";
    const INPUT_RATE: &str = "sr";
    const INPUT_H: &str = "h";
    const INPUT_C: &str = "c";
    const OUTPUT_PROBABILITY: &str = "output";
    const OUTPUT_H: &str = "hn";
    const OUTPUT_C: &str = "cn";

    fn model_error(e: impl std::fmt::Display) -> CaptureError {
        CaptureError::ModelLoad(e.to_string())
    }

    fn inference_error(e: impl std::fmt::Display) -> CaptureError {
        CaptureError::Pipeline(format!("silero inference failed: {e}"))
    }

    fn build_session(model: &[u8]) -> ort::Result<Session> {
        Session::builder()?.commit_from_memory(model)
    }

    /// Holds the model image; each recorder builds its own session from it.
    pub struct SileroRuntime {
        model: Vec<u8>,
    }

    impl SileroRuntime {
        pub fn load(path: &Path) -> Result<Self, CaptureError> {
            let model = std::fs::read(path)
                .map_err(|e| model_error(format!("{}: {e}", path.display())))?;
            // A bad model file fails the load
            build_session(&model).map_err(model_error)?;
            Ok(Self { model })
        }
    }

    impl ModelRuntime for SileroRuntime {
        fn name(&self) -> &str {
            "silero"
        }

        fn create_model(&self) -> Result<Box<dyn SpeechModel>, CaptureError> {
            let session = build_session(&self.model).map_err(model_error)?;
            Ok(Box::new(SileroModel {
                session,
                h: vec![0.0; STATE_LEN],
                c: vec![0.0; STATE_LEN],
            }))
        }
    }

    struct SileroModel {
        session: Session,
        h: Vec<f32>,
        c: Vec<f32>,
    }

    impl SpeechModel for SileroModel {
        fn frame_samples(&self) -> usize {
            SILERO_FRAME
        }

        fn speech_probability(&mut self, frame: &[f32]) -> Result<f32, CaptureError> {
            let mut audio = frame.to_vec();
            audio.resize(SILERO_FRAME, 0.0);

            let input = Array2::from_shape_vec((1, SILERO_FRAME), audio).map_err(inference_error)?;
            let h = Array3::from_shape_vec((2, 1, 64), self.h.clone()).map_err(inference_error)?;
            let c = Array3::from_shape_vec((2, 1, 64), self.c.clone()).map_err(inference_error)?;

            let input_val = Value::from_array(input).map_err(inference_error)?;
            let h_val = Value::from_array(h).map_err(inference_error)?;
            let c_val = Value::from_array(c).map_err(inference_error)?;
            let sr_val =
                Value::from_array(([1i64], vec![MODEL_SAMPLE_RATE as i64])).map_err(inference_error)?;

            let outputs = self
                .session
                .run(ort::inputs![
                    INPUT_AUDIO => input_val,
                    INPUT_RATE => sr_val,
                    INPUT_H => h_val,
                    INPUT_C => c_val,
                ])
                .map_err(inference_error)?;

            let (_, prob) = outputs[OUTPUT_PROBABILITY]
                .try_extract_tensor::<f32>()
                .map_err(inference_error)?;
            let probability = prob.first().copied().unwrap_or(0.0);
            let (_, h_out) = outputs[OUTPUT_H].try_extract_tensor::<f32>().map_err(inference_error)?;
            let (_, c_out) = outputs[OUTPUT_C].try_extract_tensor::<f32>().map_err(inference_error)?;
            self.h = h_out.to_vec();
            self.c = c_out.to_vec();

            Ok(probability)
        }

        fn reset(&mut self) {
            self.h.fill(0.0);
            self.c.fill(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ConstModel;

    impl SpeechModel for ConstModel {
        fn frame_samples(&self) -> usize {
            512
        }
        fn speech_probability(&mut self, _: &[f32]) -> Result<f32, CaptureError> {
            Ok(0.5)
        }
        fn reset(&mut self) {}
    }

    struct ConstRuntime;

    impl ModelRuntime for ConstRuntime {
        fn name(&self) -> &str {
            "const"
        }
        fn create_model(&self) -> Result<Box<dyn SpeechModel>, CaptureError> {
            Ok(Box::new(ConstModel))
        }
    }

    struct CountingLoader {
        loads: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait::async_trait]
    impl RuntimeLoader for CountingLoader {
        fn id(&self) -> String {
            "counting".into()
        }

        async fn load(&self) -> Result<Arc<dyn ModelRuntime>, CaptureError> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail_first && n == 0 {
                return Err(CaptureError::ModelLoad("network".into()));
            }
            Ok(Arc::new(ConstRuntime))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_loads_share_one_flight() {
        let cache = RuntimeCache::new();
        let loader = CountingLoader {
            loads: AtomicUsize::new(0),
            fail_first: false,
        };

        let (a, b) = tokio::join!(cache.get_or_load(&loader), cache.get_or_load(&loader));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert!(cache.is_loaded("counting"));

        cache.get_or_load(&loader).await.unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_load_is_not_cached() {
        let cache = RuntimeCache::new();
        let loader = CountingLoader {
            loads: AtomicUsize::new(0),
            fail_first: true,
        };

        let err = cache.get_or_load(&loader).await.err().unwrap();
        assert!(err.is_model_load());
        assert!(!cache.is_loaded("counting"));

        let runtime = cache.get_or_load(&loader).await.unwrap();
        assert_eq!(runtime.name(), "const");
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_silero_path_fails_to_load() {
        let loader = BuiltinLoader::new(ModelConfig {
            kind: ModelKind::Silero,
            ..ModelConfig::default()
        });
        let err = loader.load().await.err().unwrap();
        assert!(err.is_model_load());
    }

    /// Needs a silero v4 model file in `SILERO_MODEL_PATH`; skipped otherwise.
    #[cfg(feature = "silero")]
    #[tokio::test]
    async fn test_silero_tensor_names_match_model() {
        let Some(path) = std::env::var_os("SILERO_MODEL_PATH") else {
            eprintln!("SILERO_MODEL_PATH not set, skipping");
            return;
        };
        let runtime = BuiltinLoader::new(ModelConfig {
            kind: ModelKind::Silero,
            silero_model_path: Some(PathBuf::from(path)),
            ..ModelConfig::default()
        })
        .load()
        .await
        .unwrap();

        let mut model = runtime.create_model().unwrap();
        assert_eq!(model.frame_samples(), 512);
        // Two frames so the returned state is fed back in by name
        for _ in 0..2 {
            let probability = model.speech_probability(&vec![0.0; 512]).unwrap();
            assert!((0.0..=1.0).contains(&probability));
            assert!(probability < 0.5);
        }
    }

    #[cfg(feature = "vad_earshot")]
    #[tokio::test]
    async fn test_earshot_silence_is_not_speech() {
        let runtime = BuiltinLoader::new(ModelConfig::default()).load().await.unwrap();
        let mut model = runtime.create_model().unwrap();
        assert_eq!(model.frame_samples(), 480);
        let probability = model.speech_probability(&vec![0.0; 480]).unwrap();
        assert_eq!(probability, 0.0);
    }
}

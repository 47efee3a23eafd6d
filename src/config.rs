use anyhow::Result;
use serde::Deserialize;

use crate::capture::CaptureConfig;
use crate::neural::NeuralConfig;
use crate::search::SearchConfig;

/// Prefix for environment overrides, e.g. `VOICE_CAPTURE__CAPTURE__FFT_SIZE=1024`
pub const ENV_PREFIX: &str = "VOICE_CAPTURE";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub capture: CaptureConfig,
    pub neural: NeuralConfig,
    pub search: SearchConfig,
    pub handoff: HandoffConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    /// Default tracing filter when RUST_LOG is unset
    pub log_filter: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "voice-capture".to_string(),
            log_filter: "voice_capture=info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Directory finished captures are written to
    pub output_dir: String,
    /// Publish captures to NATS when set
    pub nats_url: Option<String>,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            output_dir: "./captures".to_string(),
            nats_url: None,
        }
    }
}

impl Config {
    /// Load `path` (optional) and apply environment overrides on top.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::StrategyKind;
    use std::io::Write;

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load("does/not/exist/voice-capture").unwrap();
        assert_eq!(config.service.name, "voice-capture");
        assert_eq!(config.capture.detector.silence_duration_ms, 2000);
        assert_eq!(config.neural.redemption_ms, 1400);
        assert!(config.handoff.nats_url.is_none());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[capture]
max_recording_duration_ms = 5000

[capture.detector]
vad_threshold = 0.02
short_speech = "discard"

[search]
strategy = "threshold"

[handoff]
nats_url = "nats://localhost:4222"
"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.capture.max_recording_duration_ms, 5000);
        assert_eq!(config.capture.detector.vad_threshold, 0.02);
        assert_eq!(config.capture.chunk_interval_ms, 250);
        assert_eq!(config.search.strategy, StrategyKind::Threshold);
        assert_eq!(config.handoff.nats_url.as_deref(), Some("nats://localhost:4222"));
    }
}

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// What to do with a speech segment shorter than `min_speech_duration_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShortSpeechPolicy {
    /// End the capture anyway and log a warning
    #[default]
    Finalize,
    /// Report a misfire and keep listening
    Discard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// RMS above this value counts as speech
    pub vad_threshold: f32,
    pub silence_duration_ms: u64,
    pub min_speech_duration_ms: u64,
    pub short_speech: ShortSpeechPolicy,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            vad_threshold: 0.008,
            silence_duration_ms: 2000,
            min_speech_duration_ms: 300,
            short_speech: ShortSpeechPolicy::Finalize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    Idle,
    Speaking,
    TrailingSilence,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorEvent {
    SpeechStart { at_ms: u64 },
    /// Duration runs from speech onset to the start of the final silence
    SpeechEnd { duration_ms: u64 },
    SilenceTimeout,
    Misfire,
}

/// Loudness-threshold voice activity detector.
///
/// Fed one RMS reading per frame tick. `Ended` is sticky until [`reset`](Self::reset).
pub struct ThresholdDetector {
    config: DetectorConfig,
    state: DetectorState,
    speech_start_ms: Option<u64>,
    silence_since_ms: Option<u64>,
}

impl ThresholdDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            state: DetectorState::Idle,
            speech_start_ms: None,
            silence_since_ms: None,
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn is_speaking(&self) -> bool {
        matches!(
            self.state,
            DetectorState::Speaking | DetectorState::TrailingSilence
        )
    }

    pub fn observe(&mut self, rms: f32, now_ms: u64) -> Vec<DetectorEvent> {
        let loud = rms > self.config.vad_threshold;

        match self.state {
            DetectorState::Ended => Vec::new(),
            DetectorState::Idle => {
                if !loud {
                    return Vec::new();
                }
                debug!("Speech detected at {}ms", now_ms);
                self.state = DetectorState::Speaking;
                self.speech_start_ms = Some(now_ms);
                self.silence_since_ms = None;
                vec![DetectorEvent::SpeechStart { at_ms: now_ms }]
            }
            DetectorState::Speaking => {
                if !loud {
                    self.state = DetectorState::TrailingSilence;
                    self.silence_since_ms = Some(now_ms);
                }
                Vec::new()
            }
            DetectorState::TrailingSilence => {
                if loud {
                    self.state = DetectorState::Speaking;
                    self.silence_since_ms = None;
                    return Vec::new();
                }

                let silence_since = self.silence_since_ms.unwrap_or(now_ms);
                if now_ms.saturating_sub(silence_since) < self.config.silence_duration_ms {
                    return Vec::new();
                }
                self.finish(silence_since)
            }
        }
    }

    fn finish(&mut self, silence_since: u64) -> Vec<DetectorEvent> {
        let start = self.speech_start_ms.unwrap_or(silence_since);
        let duration_ms = silence_since.saturating_sub(start);
        let too_short = duration_ms < self.config.min_speech_duration_ms;

        if too_short && self.config.short_speech == ShortSpeechPolicy::Discard {
            debug!(
                "Discarding {}ms of speech (minimum {}ms)",
                duration_ms, self.config.min_speech_duration_ms
            );
            self.state = DetectorState::Idle;
            self.speech_start_ms = None;
            self.silence_since_ms = None;
            return vec![DetectorEvent::Misfire];
        }

        if too_short {
            warn!(
                "Speech too short ({}ms < {}ms), finalizing anyway",
                duration_ms, self.config.min_speech_duration_ms
            );
        }

        self.state = DetectorState::Ended;
        vec![
            DetectorEvent::SpeechEnd { duration_ms },
            DetectorEvent::SilenceTimeout,
        ]
    }

    pub fn reset(&mut self) {
        self.state = DetectorState::Idle;
        self.speech_start_ms = None;
        self.silence_since_ms = None;
    }
}

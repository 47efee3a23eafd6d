use std::collections::VecDeque;
use tracing::debug;

/// Segmentation thresholds, in model frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessorOptions {
    pub positive_speech_threshold: f32,
    pub negative_speech_threshold: f32,
    /// Consecutive sub-negative frames that end a segment
    pub redemption_frames: usize,
    /// Frames kept before speech onset
    pub pre_speech_pad_frames: usize,
    /// Speech frames a segment needs to count as speech
    pub min_speech_frames: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorEvent {
    SpeechStart,
    SpeechEnd(Vec<f32>),
    Misfire,
}

struct BufferedFrame {
    samples: Vec<f32>,
    is_speech: bool,
}

/// Turns per-frame speech probabilities into speech segments.
///
/// Speech starts at the first frame at or above the positive threshold. It ends
/// once `redemption_frames` frames in a row fall below the negative threshold;
/// frames in between the two thresholds neither extend nor end it.
pub struct FrameProcessor {
    options: ProcessorOptions,
    buffer: VecDeque<BufferedFrame>,
    speaking: bool,
    redemption_counter: usize,
}

impl FrameProcessor {
    pub fn new(options: ProcessorOptions) -> Self {
        Self {
            options,
            buffer: VecDeque::new(),
            speaking: false,
            redemption_counter: 0,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn process(&mut self, frame: &[f32], probability: f32) -> Option<ProcessorEvent> {
        let positive = probability >= self.options.positive_speech_threshold;
        self.buffer.push_back(BufferedFrame {
            samples: frame.to_vec(),
            is_speech: positive,
        });

        let mut event = None;

        if positive {
            self.redemption_counter = 0;
            if !self.speaking {
                self.speaking = true;
                event = Some(ProcessorEvent::SpeechStart);
            }
        }

        if probability < self.options.negative_speech_threshold && self.speaking {
            self.redemption_counter += 1;
            if self.redemption_counter >= self.options.redemption_frames {
                self.redemption_counter = 0;
                self.speaking = false;
                event = Some(self.close_segment());
            }
        }

        if !self.speaking {
            while self.buffer.len() > self.options.pre_speech_pad_frames {
                self.buffer.pop_front();
            }
        }

        event
    }

    /// End an in-progress segment early (pause/stop). Returns nothing when idle.
    pub fn flush(&mut self) -> Option<ProcessorEvent> {
        if !self.speaking {
            return None;
        }
        self.speaking = false;
        self.redemption_counter = 0;
        Some(self.close_segment())
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.speaking = false;
        self.redemption_counter = 0;
    }

    fn close_segment(&mut self) -> ProcessorEvent {
        let frames: Vec<BufferedFrame> = self.buffer.drain(..).collect();
        let speech_frames = frames.iter().filter(|f| f.is_speech).count();

        if speech_frames < self.options.min_speech_frames {
            debug!(
                "Misfire: {} speech frames (minimum {})",
                speech_frames, self.options.min_speech_frames
            );
            return ProcessorEvent::Misfire;
        }

        let samples = frames.into_iter().flat_map(|f| f.samples).collect();
        ProcessorEvent::SpeechEnd(samples)
    }
}

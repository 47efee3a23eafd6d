use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::audio::{downmix_to_mono, AudioFrame};

const MIN_FFT_SIZE: usize = 32;
const MAX_FFT_SIZE: usize = 32768;

/// Gain applied to RMS before it is shown as a level
const LEVEL_GAIN: f32 = 15.0;

/// Smallest level change worth reporting
const LEVEL_EPSILON: f32 = 0.01;

/// Floor for dB conversion of silent bins
const MIN_DECIBELS: f32 = -100.0;

/// Live loudness analysis over the most recent window of the stream.
///
/// The time-domain window holds `fft_size / 2` samples (the bin count), and RMS
/// is computed over exactly that window. The spectrum uses the full `fft_size`.
pub struct SignalAnalyzer {
    fft_size: usize,
    smoothing: f32,
    history: VecDeque<f32>,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
}

impl SignalAnalyzer {
    pub fn new(fft_size: usize, smoothing_time_constant: f32) -> Self {
        let fft_size = fft_size
            .clamp(MIN_FFT_SIZE, MAX_FFT_SIZE)
            .next_power_of_two()
            .min(MAX_FFT_SIZE);

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);

        Self {
            fft_size,
            smoothing: smoothing_time_constant.clamp(0.0, 1.0),
            history: VecDeque::with_capacity(fft_size),
            fft,
            window: blackman(fft_size),
            smoothed: vec![0.0; fft_size / 2],
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    pub fn push(&mut self, frame: &AudioFrame) {
        let mono = downmix_to_mono(&frame.samples, frame.channels);
        self.push_samples(&mono);
    }

    pub fn push_samples(&mut self, samples: &[f32]) {
        for &sample in samples {
            if self.history.len() == self.fft_size {
                self.history.pop_front();
            }
            self.history.push_back(sample);
        }
    }

    /// RMS of the current window; 0.0 before any audio arrived.
    pub fn sample(&self) -> f32 {
        let take = self.bin_count().min(self.history.len());
        if take == 0 {
            return 0.0;
        }
        let sum: f32 = self
            .history
            .iter()
            .skip(self.history.len() - take)
            .map(|s| s * s)
            .sum();
        (sum / take as f32).sqrt()
    }

    /// Smoothed magnitude spectrum in dB, one value per bin.
    pub fn frequency_data(&mut self) -> Vec<f32> {
        let pad = self.fft_size - self.history.len();
        let mut buffer: Vec<Complex<f32>> = std::iter::repeat(0.0)
            .take(pad)
            .chain(self.history.iter().copied())
            .zip(self.window.iter())
            .map(|(s, &w)| Complex::new(s * w, 0.0))
            .collect();

        self.fft.process(&mut buffer);

        let scale = 1.0 / self.fft_size as f32;
        let tau = self.smoothing;
        self.smoothed
            .iter_mut()
            .zip(buffer.iter())
            .map(|(previous, bin)| {
                let magnitude = bin.norm() * scale;
                *previous = tau * *previous + (1.0 - tau) * magnitude;
                if *previous > 0.0 {
                    (20.0 * previous.log10()).max(MIN_DECIBELS)
                } else {
                    MIN_DECIBELS
                }
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.smoothed.iter_mut().for_each(|v| *v = 0.0);
    }
}

fn blackman(n: usize) -> Vec<f32> {
    let alpha = 0.16f32;
    let a0 = (1.0 - alpha) / 2.0;
    let a1 = 0.5;
    let a2 = alpha / 2.0;
    (0..n)
        .map(|i| {
            let x = i as f32 / n as f32;
            a0 - a1 * (2.0 * std::f32::consts::PI * x).cos()
                + a2 * (4.0 * std::f32::consts::PI * x).cos()
        })
        .collect()
}

/// Map RMS to a 0..=1 display level.
pub fn normalize_level(rms: f32) -> f32 {
    (rms * LEVEL_GAIN).min(1.0)
}

/// Reports display levels only when they move noticeably.
#[derive(Debug, Default)]
pub struct LevelMeter {
    /// Last reported level; starts silent
    last: f32,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, rms: f32) -> Option<f32> {
        let level = normalize_level(rms);
        if (level - self.last).abs() <= LEVEL_EPSILON {
            return None;
        }
        self.last = level;
        Some(level)
    }

    pub fn reset(&mut self) {
        self.last = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(samples: Vec<f32>) -> AudioFrame {
        AudioFrame {
            samples,
            sample_rate: 44100,
            channels: 1,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_empty_window_is_silent() {
        let analyzer = SignalAnalyzer::new(2048, 0.8);
        assert_eq!(analyzer.sample(), 0.0);
        assert_eq!(analyzer.bin_count(), 1024);
    }

    #[test]
    fn test_rms_of_constant_signal() {
        let mut analyzer = SignalAnalyzer::new(2048, 0.8);
        analyzer.push(&frame(vec![0.5; 4096]));
        assert!((analyzer.sample() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_rms_uses_most_recent_window() {
        let mut analyzer = SignalAnalyzer::new(64, 0.0);
        analyzer.push_samples(&[1.0; 64]);
        analyzer.push_samples(&[0.0; 32]);
        assert_eq!(analyzer.sample(), 0.0);
    }

    #[test]
    fn test_fft_size_is_clamped_to_power_of_two() {
        assert_eq!(SignalAnalyzer::new(1000, 0.8).fft_size(), 1024);
        assert_eq!(SignalAnalyzer::new(4, 0.8).fft_size(), 32);
        assert_eq!(SignalAnalyzer::new(1 << 20, 0.8).fft_size(), 32768);
    }

    #[test]
    fn test_frequency_peak_at_tone_bin() {
        let mut analyzer = SignalAnalyzer::new(256, 0.0);
        // 16 cycles across the window lands exactly in bin 16
        let tone: Vec<f32> = (0..256)
            .map(|i| (2.0 * std::f32::consts::PI * 16.0 * i as f32 / 256.0).sin())
            .collect();
        analyzer.push_samples(&tone);

        let spectrum = analyzer.frequency_data();
        assert_eq!(spectrum.len(), 128);
        let peak = spectrum
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 16);
    }

    #[test]
    fn test_level_normalization() {
        assert!((normalize_level(0.02) - 0.3).abs() < 1e-6);
        assert_eq!(normalize_level(0.5), 1.0);
    }

    #[test]
    fn test_level_meter_hysteresis() {
        let mut meter = LevelMeter::new();
        assert_eq!(meter.update(0.0005), None);
        assert!(meter.update(0.01).is_some());
        assert_eq!(meter.update(0.0105), None);
    }

    #[test]
    fn test_level_meter_starts_silent() {
        let mut meter = LevelMeter::new();
        assert_eq!(meter.update(0.0), None);
        assert_eq!(meter.update(0.0006), None);
        assert_eq!(meter.update(0.02), Some(normalize_level(0.02)));

        meter.reset();
        assert_eq!(meter.update(0.0), None);
    }
}

use rubato::{FftFixedInOut, Resampler};
use tracing::info;

use crate::error::CaptureError;

/// Block size handed to the FFT resampler
const RESAMPLER_CHUNK: usize = 1024;

/// Streaming mono resampler; input arrives in arbitrary frame sizes.
pub struct StreamResampler {
    inner: Option<FftFixedInOut<f32>>,
    pending: Vec<f32>,
    source_rate: u32,
    target_rate: u32,
}

impl StreamResampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Result<Self, CaptureError> {
        let inner = if source_rate == target_rate {
            None
        } else {
            info!("Resampling from {}Hz to {}Hz", source_rate, target_rate);
            Some(
                FftFixedInOut::<f32>::new(
                    source_rate as usize,
                    target_rate as usize,
                    RESAMPLER_CHUNK,
                    1,
                )
                .map_err(|e| CaptureError::Pipeline(format!("Failed to create resampler: {e}")))?,
            )
        };

        Ok(Self {
            inner,
            pending: Vec::new(),
            source_rate,
            target_rate,
        })
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Feed mono samples, returning whatever full blocks could be converted.
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>, CaptureError> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.pending.extend_from_slice(samples);
        let mut output = Vec::new();

        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let block: Vec<f32> = self.pending.drain(..needed).collect();
            let result = resampler
                .process(&[block], None)
                .map_err(|e| CaptureError::Pipeline(format!("Resampling failed: {e}")))?;
            if let Some(channel) = result.into_iter().next() {
                output.extend(channel);
            }
        }

        Ok(output)
    }

    /// Flush the tail by zero-padding the last partial block.
    pub fn flush(&mut self) -> Result<Vec<f32>, CaptureError> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let needed = resampler.input_frames_next();
        let real = self.pending.len();
        let mut block = std::mem::take(&mut self.pending);
        block.resize(needed, 0.0);

        let result = resampler
            .process(&[block], None)
            .map_err(|e| CaptureError::Pipeline(format!("Resampling failed: {e}")))?;
        let mut tail = result.into_iter().next().unwrap_or_default();

        let keep = (real as u64 * self.target_rate as u64 / self.source_rate as u64) as usize;
        tail.truncate(keep);
        Ok(tail)
    }
}

//! Canonical 44-byte RIFF/WAVE encoding for mono 16-bit PCM.

use crate::error::CaptureError;

pub const WAV_HEADER_LEN: usize = 44;
pub const WAV_MIME_TYPE: &str = "audio/wav";

const PCM_FORMAT: u16 = 1;
const BITS_PER_SAMPLE: u16 = 16;

/// Fields of a parsed canonical WAV header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    pub riff_size: u32,
    pub audio_format: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub byte_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
    pub data_size: u32,
}

impl WavHeader {
    pub fn mono_pcm16(sample_rate: u32, data_size: u32) -> Self {
        let channels = 1u16;
        let block_align = channels * (BITS_PER_SAMPLE / 8);
        Self {
            riff_size: WAV_HEADER_LEN as u32 - 8 + data_size,
            audio_format: PCM_FORMAT,
            channels,
            sample_rate,
            byte_rate: sample_rate * block_align as u32,
            block_align,
            bits_per_sample: BITS_PER_SAMPLE,
            data_size,
        }
    }

    pub fn to_bytes(&self) -> [u8; WAV_HEADER_LEN] {
        let mut out = [0u8; WAV_HEADER_LEN];
        out[0..4].copy_from_slice(b"RIFF");
        out[4..8].copy_from_slice(&self.riff_size.to_le_bytes());
        out[8..12].copy_from_slice(b"WAVE");
        out[12..16].copy_from_slice(b"fmt ");
        out[16..20].copy_from_slice(&16u32.to_le_bytes());
        out[20..22].copy_from_slice(&self.audio_format.to_le_bytes());
        out[22..24].copy_from_slice(&self.channels.to_le_bytes());
        out[24..28].copy_from_slice(&self.sample_rate.to_le_bytes());
        out[28..32].copy_from_slice(&self.byte_rate.to_le_bytes());
        out[32..34].copy_from_slice(&self.block_align.to_le_bytes());
        out[34..36].copy_from_slice(&self.bits_per_sample.to_le_bytes());
        out[36..40].copy_from_slice(b"data");
        out[40..44].copy_from_slice(&self.data_size.to_le_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, CaptureError> {
        if bytes.len() < WAV_HEADER_LEN {
            return Err(CaptureError::Pipeline(format!(
                "WAV header truncated: {} bytes",
                bytes.len()
            )));
        }
        if &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
            return Err(CaptureError::Pipeline("missing RIFF/WAVE magic".into()));
        }
        if &bytes[12..16] != b"fmt " || &bytes[36..40] != b"data" {
            return Err(CaptureError::Pipeline("not a canonical 44-byte WAV header".into()));
        }

        let u16_at = |offset: usize| u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
        let u32_at = |offset: usize| {
            u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };

        Ok(Self {
            riff_size: u32_at(4),
            audio_format: u16_at(20),
            channels: u16_at(22),
            sample_rate: u32_at(24),
            byte_rate: u32_at(28),
            block_align: u16_at(32),
            bits_per_sample: u16_at(34),
            data_size: u32_at(40),
        })
    }
}

/// Convert one float sample to signed 16-bit, clamping to [-1, 1] first.
pub fn float_to_pcm16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    if clamped < 0.0 {
        (clamped * 32768.0) as i16
    } else {
        (clamped * 32767.0) as i16
    }
}

/// Append samples as little-endian PCM16.
pub fn write_pcm16(samples: &[f32], out: &mut Vec<u8>) {
    out.reserve(samples.len() * 2);
    for &sample in samples {
        out.extend_from_slice(&float_to_pcm16(sample).to_le_bytes());
    }
}

/// Encode mono float samples as a self-contained WAV file.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_size = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(WAV_HEADER_LEN + data_size as usize);
    out.extend_from_slice(&WavHeader::mono_pcm16(sample_rate, data_size).to_bytes());
    write_pcm16(samples, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_round_trip() {
        let samples = vec![0.25f32; 1600];
        let wav = encode_wav(&samples, 16000);
        let header = WavHeader::parse(&wav).unwrap();

        assert_eq!(wav.len(), WAV_HEADER_LEN + 3200);
        assert_eq!(header.data_size, 3200);
        assert_eq!(header.riff_size as usize, wav.len() - 8);
        assert_eq!(header.sample_rate, 16000);
        assert_eq!(header.channels, 1);
        assert_eq!(header.bits_per_sample, 16);
        assert_eq!(header.audio_format, 1);
        assert_eq!(header.byte_rate, 32000);
        assert_eq!(header.block_align, 2);
    }

    #[test]
    fn test_clamping_at_boundaries() {
        assert_eq!(float_to_pcm16(1.5), 32767);
        assert_eq!(float_to_pcm16(-1.5), -32768);
        assert_eq!(float_to_pcm16(1.0), 32767);
        assert_eq!(float_to_pcm16(-1.0), -32768);
        assert_eq!(float_to_pcm16(0.0), 0);

        let wav = encode_wav(&[1.5, -1.5], 16000);
        assert_eq!(&wav[44..46], &32767i16.to_le_bytes());
        assert_eq!(&wav[46..48], &(-32768i16).to_le_bytes());
    }

    #[test]
    fn test_hound_reads_encoded_file() {
        let samples: Vec<f32> = (0..800).map(|i| ((i as f32) * 0.05).sin() * 0.5).collect();
        let wav = encode_wav(&samples, 16000);

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16000);
        assert_eq!(spec.bits_per_sample, 16);

        let decoded: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded.len(), samples.len());
        assert_eq!(decoded[10], float_to_pcm16(samples[10]));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(WavHeader::parse(b"RIFF").is_err());
        assert!(WavHeader::parse(&[0u8; 44]).is_err());
    }
}

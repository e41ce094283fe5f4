use crate::error::{CitySonicError, Result};
use rubato::{FftFixedIn, Resampler};

/// Offline sample-rate converter used when clips are attached to the world.
///
/// Not used on the real-time path; streams whose rate differs from the world rate are
/// rate-corrected by their playback cursor instead.
pub struct AudioResampler {
    source_sample_rate: u32,
    target_sample_rate: u32,
    channels: u16,
    chunk_size: usize,
}

impl AudioResampler {
    pub fn new(
        source_sample_rate: u32,
        target_sample_rate: u32,
        channels: u16,
        chunk_size: Option<usize>,
    ) -> Result<Self> {
        if source_sample_rate == 0 || target_sample_rate == 0 {
            return Err(CitySonicError::AudioFormat(
                "Sample rates must be greater than 0".to_string(),
            ));
        }

        if channels == 0 {
            return Err(CitySonicError::AudioFormat(
                "Channel count must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            source_sample_rate,
            target_sample_rate,
            channels,
            chunk_size: chunk_size.unwrap_or(1024).max(1),
        })
    }

    /// Resample planar channels in lockstep. All input channels must have equal length.
    pub fn resample_planar(&self, channels: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        if channels.len() != self.channels as usize {
            return Err(CitySonicError::AudioFormat(format!(
                "expected {} channels, got {}",
                self.channels,
                channels.len()
            )));
        }
        if self.source_sample_rate == self.target_sample_rate {
            return Ok(channels.to_vec());
        }

        let frames = channels.first().map_or(0, Vec::len);
        let expected = (frames as f64 * self.resample_ratio()).round() as usize;

        let mut resampler = FftFixedIn::<f32>::new(
            self.source_sample_rate as usize,
            self.target_sample_rate as usize,
            self.chunk_size,
            2,
            channels.len(),
        )
        .map_err(|e| CitySonicError::AudioLoading(format!("Failed to create resampler: {}", e)))?;

        let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(expected); channels.len()];
        let mut chunk: Vec<Vec<f32>> = vec![vec![0.0; self.chunk_size]; channels.len()];
        let mut offset = 0;

        while offset < frames {
            let take = (frames - offset).min(self.chunk_size);
            for (dst, src) in chunk.iter_mut().zip(channels) {
                dst[..take].copy_from_slice(&src[offset..offset + take]);
                dst[take..].fill(0.0);
            }

            let waves_out = resampler
                .process(&chunk, None)
                .map_err(|e| CitySonicError::AudioLoading(format!("Resampling error: {}", e)))?;
            for (dst, src) in output.iter_mut().zip(waves_out) {
                dst.extend_from_slice(&src);
            }
            offset += take;
        }

        // The final chunk is zero padded; drop the padding's contribution.
        for channel in &mut output {
            channel.truncate(expected);
        }
        Ok(output)
    }

    pub fn resample_interleaved(&self, interleaved: &[f32]) -> Result<Vec<f32>> {
        if self.source_sample_rate == self.target_sample_rate {
            return Ok(interleaved.to_vec());
        }

        let channels = self.channels as usize;
        let planar: Vec<Vec<f32>> = (0..channels)
            .map(|ch| {
                interleaved
                    .chunks_exact(channels)
                    .map(|frame| frame[ch])
                    .collect()
            })
            .collect();

        let resampled = self.resample_planar(&planar)?;
        let frames = resampled.first().map_or(0, Vec::len);
        let mut out = Vec::with_capacity(frames * channels);
        for i in 0..frames {
            out.extend(resampled.iter().map(|channel| channel[i]));
        }
        Ok(out)
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    pub fn source_sample_rate(&self) -> u32 {
        self.source_sample_rate
    }

    pub fn resample_ratio(&self) -> f64 {
        self.target_sample_rate as f64 / self.source_sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resampler_creation() {
        let resampler = AudioResampler::new(44100, 48000, 2, None).unwrap();
        assert_eq!(resampler.source_sample_rate(), 44100);
        assert_eq!(resampler.target_sample_rate(), 48000);
    }

    #[test]
    fn test_same_rate_is_passthrough() {
        let resampler = AudioResampler::new(48000, 48000, 1, None).unwrap();
        let samples = vec![0.1, 0.2, 0.3, 0.4];
        assert_eq!(resampler.resample_interleaved(&samples).unwrap(), samples);
    }

    #[test]
    fn test_upsample_length_follows_ratio() {
        let resampler = AudioResampler::new(24000, 48000, 2, Some(512)).unwrap();
        let input = vec![0.0f32; 2 * 3000];
        let output = resampler.resample_interleaved(&input).unwrap();
        assert_eq!(output.len(), 2 * 6000);
    }

    #[test]
    fn test_channel_count_mismatch() {
        let resampler = AudioResampler::new(44100, 48000, 2, None).unwrap();
        assert!(resampler.resample_planar(&[vec![0.0; 10]]).is_err());
    }

    #[test]
    fn test_invalid_sample_rates() {
        assert!(AudioResampler::new(0, 48000, 2, None).is_err());
        assert!(AudioResampler::new(44100, 0, 2, None).is_err());
        assert!(AudioResampler::new(44100, 48000, 0, None).is_err());
    }
}

//! In-memory audio clips.
//!
//! A [`CitySonicAudioData`] is cheap to clone: sources hold a clone while they play
//! it, so the sample memory is owned by whoever loaded the clip and merely borrowed
//! by the engine.

mod loader;
mod resampler;

use crate::error::{CitySonicError, Result};
pub use loader::{Downmix, LoadOptions, load_audio_bytes, load_audio_file};
pub use resampler::AudioResampler;
#[cfg(test)]
pub(crate) use loader::tests::wav_bytes;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CitySonicAudioData {
    inner: Arc<AudioDataInner>,
}

#[derive(Debug)]
struct AudioDataInner {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
    total_frames: usize,
}

impl CitySonicAudioData {
    /// Wrap interleaved samples.
    ///
    /// # Errors
    ///
    /// Returns `AudioFormat` if the rate or channel count is zero, or if the sample count
    /// is not a whole number of frames.
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Result<Self> {
        if sample_rate == 0 || channels == 0 {
            return Err(CitySonicError::AudioFormat(format!(
                "invalid clip format: {} Hz, {} channels",
                sample_rate, channels
            )));
        }
        if samples.len() % channels as usize != 0 {
            return Err(CitySonicError::AudioFormat(format!(
                "{} samples do not divide into {} channels",
                samples.len(),
                channels
            )));
        }
        Ok(Self::new(samples, sample_rate, channels))
    }

    pub(crate) fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        let total_frames = samples.len() / channels.max(1) as usize;
        Self {
            inner: Arc::new(AudioDataInner {
                samples,
                sample_rate,
                channels,
                total_frames,
            }),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.inner.channels
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.inner.total_frames as f64 / self.inner.sample_rate as f64)
    }

    /// Interleaved samples.
    pub fn samples(&self) -> &[f32] {
        &self.inner.samples
    }

    pub fn total_frames(&self) -> usize {
        self.inner.total_frames
    }

    pub fn is_empty(&self) -> bool {
        self.inner.samples.is_empty()
    }

    /// Whether two handles share the same sample memory.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Get samples for a specific channel (0-indexed)
    pub fn channel_samples(&self, channel: usize) -> Result<Vec<f32>> {
        let channels = self.inner.channels as usize;
        if channel >= channels {
            return Err(CitySonicError::AudioFormat(format!(
                "Channel {} out of range (max: {})",
                channel,
                channels - 1
            )));
        }
        Ok(self
            .inner
            .samples
            .chunks_exact(channels)
            .map(|frame| frame[channel])
            .collect())
    }

    /// Downmix all channels to one by averaging
    pub fn to_mono(&self) -> Self {
        if self.inner.channels == 1 {
            return self.clone();
        }
        let channels = self.inner.channels as usize;
        let mono: Vec<f32> = self
            .inner
            .samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();
        Self::new(mono, self.inner.sample_rate, 1)
    }

    /// Resample to a different sample rate using rubato
    pub fn resample(&self, target_sample_rate: u32) -> Result<Self> {
        if target_sample_rate == self.inner.sample_rate {
            return Ok(self.clone());
        }

        let resampler = AudioResampler::new(
            self.inner.sample_rate,
            target_sample_rate,
            self.inner.channels,
            None,
        )?;
        let resampled = resampler.resample_interleaved(&self.inner.samples)?;
        Ok(Self::new(resampled, target_sample_rate, self.inner.channels))
    }

    /// Mono clip at `sample_rate`, the layout sources render from.
    pub fn prepared_for(&self, sample_rate: u32) -> Result<Self> {
        self.to_mono().resample(sample_rate)
    }
}

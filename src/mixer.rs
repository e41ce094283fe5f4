// Mixer module - sums spatialized voices into the master bus, then limits and meters it.
// Accumulation runs over fixed-width lane blocks so the compiler can vectorize it; the
// numeric contract is the same as a scalar loop up to summation order.

use crate::config::MixerDesc;
use crate::error::Result;
use crate::playback::GainRamp;
use crate::spatial::Listener;

/// Samples processed per inner block.
pub const LANES: usize = 8;

/// One already-spatialized contribution to the mix.
#[derive(Debug, Clone, Copy)]
pub struct Voice<'a> {
    pub left: &'a [f32],
    pub right: &'a [f32],
    /// Volume x attenuation x occlusion x fade, ramped across the block.
    pub gain: GainRamp,
}

/// Peak levels with hold-and-decay, for display.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PeakLevels {
    pub left: f32,
    pub right: f32,
}

/// Master stereo bus.
///
/// A block is built in three steps: [`begin_block`](Self::begin_block) clears the
/// accumulators, [`accumulate`](Self::accumulate) adds each voice, and
/// [`finish_block`](Self::finish_block) applies the master volume, the hard limiter
/// and the meters. Anything that should sit before the limiter (reverb) can work on
/// [`bus_mut`](Self::bus_mut) between the last two steps.
#[derive(Debug)]
pub struct Mixer {
    saturation_limit: f32,
    peak_decay: f32,
    peaks: PeakLevels,
    left: Vec<f32>,
    right: Vec<f32>,
    frames: usize,
    limited_samples: u64,
}

impl Mixer {
    pub fn new(desc: &MixerDesc, max_block_frames: usize) -> Result<Self> {
        let mut left = Vec::new();
        let mut right = Vec::new();
        left.try_reserve_exact(max_block_frames)?;
        right.try_reserve_exact(max_block_frames)?;
        left.resize(max_block_frames, 0.0);
        right.resize(max_block_frames, 0.0);
        Ok(Self {
            saturation_limit: desc.saturation_limit,
            peak_decay: desc.peak_decay,
            peaks: PeakLevels::default(),
            left,
            right,
            frames: 0,
            limited_samples: 0,
        })
    }

    pub fn saturation_limit(&self) -> f32 {
        self.saturation_limit
    }

    pub fn peak_levels(&self) -> PeakLevels {
        self.peaks
    }

    /// Samples clamped by the limiter since creation.
    pub fn limited_samples(&self) -> u64 {
        self.limited_samples
    }

    /// Clear the accumulators for a block of `frames` (capped at the allocated size).
    pub fn begin_block(&mut self, frames: usize) {
        self.frames = frames.min(self.left.len());
        self.left[..self.frames].fill(0.0);
        self.right[..self.frames].fill(0.0);
    }

    /// Frames in the current block.
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn accumulate(&mut self, voice: &Voice<'_>) {
        let n = self.frames;
        let left = &voice.left[..n.min(voice.left.len())];
        let right = &voice.right[..n.min(voice.right.len())];
        if voice.gain.is_constant() {
            if voice.gain.start == 0.0 {
                return;
            }
            add_scaled(&mut self.left[..left.len()], left, voice.gain.start);
            add_scaled(&mut self.right[..right.len()], right, voice.gain.start);
        } else {
            add_ramped(&mut self.left[..left.len()], left, voice.gain, n);
            add_ramped(&mut self.right[..right.len()], right, voice.gain, n);
        }
    }

    /// Mutable view of the unlimited bus, for effects that run before the limiter.
    pub fn bus_mut(&mut self) -> (&mut [f32], &mut [f32]) {
        (&mut self.left[..self.frames], &mut self.right[..self.frames])
    }

    /// Apply master volume, clamp to the saturation limit and update the meters.
    pub fn finish_block(&mut self, master_volume: f32) {
        let n = self.frames;
        let limit = self.saturation_limit;
        let mut limited = 0u64;
        let mut block_peak = [0.0f32; 2];

        for (channel, bus) in [&mut self.left[..n], &mut self.right[..n]].into_iter().enumerate() {
            for block in bus.chunks_mut(LANES) {
                for sample in block {
                    let scaled = *sample * master_volume;
                    let clamped = scaled.clamp(-limit, limit);
                    limited += (clamped != scaled) as u64;
                    block_peak[channel] = block_peak[channel].max(clamped.abs());
                    *sample = clamped;
                }
            }
        }

        self.limited_samples += limited;
        self.peaks.left = (self.peaks.left * self.peak_decay).max(block_peak[0]);
        self.peaks.right = (self.peaks.right * self.peak_decay).max(block_peak[1]);
    }

    /// The finished block.
    pub fn output(&self) -> (&[f32], &[f32]) {
        (&self.left[..self.frames], &self.right[..self.frames])
    }

    /// One-shot mix of `voices` into `out_left`/`out_right`.
    ///
    /// The block length is the shorter of the two output slices.
    pub fn mix(
        &mut self,
        voices: &[Voice<'_>],
        listener: &Listener,
        out_left: &mut [f32],
        out_right: &mut [f32],
    ) {
        let frames = out_left.len().min(out_right.len());
        self.begin_block(frames);
        for voice in voices {
            self.accumulate(voice);
        }
        self.finish_block(listener.master_volume);
        let (left, right) = self.output();
        out_left[..left.len()].copy_from_slice(left);
        out_right[..right.len()].copy_from_slice(right);
    }
}

fn add_scaled(acc: &mut [f32], src: &[f32], gain: f32) {
    let mut acc_blocks = acc.chunks_exact_mut(LANES);
    let mut src_blocks = src.chunks_exact(LANES);
    for (a, s) in (&mut acc_blocks).zip(&mut src_blocks) {
        for i in 0..LANES {
            a[i] += s[i] * gain;
        }
    }
    for (a, s) in acc_blocks
        .into_remainder()
        .iter_mut()
        .zip(src_blocks.remainder())
    {
        *a += s * gain;
    }
}

fn add_ramped(acc: &mut [f32], src: &[f32], ramp: GainRamp, frames: usize) {
    for (i, (a, s)) in acc.iter_mut().zip(src).enumerate() {
        *a += s * ramp.at(i, frames);
    }
}

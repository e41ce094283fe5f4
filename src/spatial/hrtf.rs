//! Procedurally generated HRTF table.
//!
//! The table covers a 5° grid: 72 azimuth steps (0..360, 0 = straight ahead,
//! 90 = right) by 37 elevation steps (-90..=90). Each cell holds a 128-tap FIR
//! pair modelling interaural time difference, head shadow on the far ear, and a
//! weak elevation-dependent pinna reflection.

use crate::error::Result;
use std::f32::consts::PI;

pub const HRTF_TAPS: usize = 128;
pub const AZIMUTH_STEPS: usize = 72;
pub const ELEVATION_STEPS: usize = 37;
pub const ANGLE_STEP_DEGREES: f32 = 5.0;

/// Maximum interaural delay, in seconds.
const MAX_ITD_SECONDS: f32 = 0.0006;
/// Far-ear level reduction at full lateral incidence.
const HEAD_SHADOW: f32 = 0.3;

/// Left/right FIR coefficient pair for one grid cell.
#[derive(Debug, Clone, PartialEq)]
pub struct HrtfFilter {
    pub left: [f32; HRTF_TAPS],
    pub right: [f32; HRTF_TAPS],
}

impl HrtfFilter {
    pub fn silent() -> Self {
        Self {
            left: [0.0; HRTF_TAPS],
            right: [0.0; HRTF_TAPS],
        }
    }

    /// Single-tap filter applying plain channel gains.
    pub fn gains(left: f32, right: f32) -> Self {
        let mut filter = Self::silent();
        filter.left[0] = left;
        filter.right[0] = right;
        filter
    }

    /// Write `from * (1 - t) + to * t` into `self`. `t` is clamped to [0, 1], so every
    /// coefficient stays between the two inputs.
    pub fn blend_from(&mut self, from: &HrtfFilter, to: &HrtfFilter, t: f32) {
        let t = t.clamp(0.0, 1.0);
        let s = 1.0 - t;
        for ((dst, &a), &b) in self.left.iter_mut().zip(&from.left).zip(&to.left) {
            *dst = a * s + b * t;
        }
        for ((dst, &a), &b) in self.right.iter_mut().zip(&from.right).zip(&to.right) {
            *dst = a * s + b * t;
        }
    }
}

/// Immutable grid of [`HrtfFilter`]s, shared by every source.
#[derive(Debug)]
pub struct HrtfTable {
    filters: Vec<HrtfFilter>,
    sample_rate: u32,
}

impl HrtfTable {
    /// Generate the whole grid for `sample_rate`.
    ///
    /// # Errors
    ///
    /// `AllocationFailure` if the table cannot be reserved.
    pub fn procedural(sample_rate: u32) -> Result<Self> {
        let mut filters = Vec::new();
        filters.try_reserve_exact(AZIMUTH_STEPS * ELEVATION_STEPS)?;

        for az in 0..AZIMUTH_STEPS {
            for el in 0..ELEVATION_STEPS {
                let (azimuth, elevation) = Self::cell_angles(az * ELEVATION_STEPS + el);
                filters.push(synthesize(azimuth, elevation, sample_rate));
            }
        }

        log::info!(
            "Generated procedural HRTF ({} cells, {} taps, {} Hz)",
            filters.len(),
            HRTF_TAPS,
            sample_rate
        );
        Ok(Self {
            filters,
            sample_rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Nearest grid cell for an azimuth in degrees (any range) and an elevation in
    /// degrees (clamped to -90..=90).
    pub fn cell_for(azimuth: f32, elevation: f32) -> usize {
        let az = (azimuth.rem_euclid(360.0) / ANGLE_STEP_DEGREES).round() as usize % AZIMUTH_STEPS;
        let el = ((elevation.clamp(-90.0, 90.0) + 90.0) / ANGLE_STEP_DEGREES).round() as usize;
        az * ELEVATION_STEPS + el.min(ELEVATION_STEPS - 1)
    }

    /// Centre angles `(azimuth, elevation)` of a cell, in degrees.
    pub fn cell_angles(cell: usize) -> (f32, f32) {
        let az = cell / ELEVATION_STEPS;
        let el = cell % ELEVATION_STEPS;
        (
            az as f32 * ANGLE_STEP_DEGREES,
            el as f32 * ANGLE_STEP_DEGREES - 90.0,
        )
    }

    pub fn filter(&self, cell: usize) -> &HrtfFilter {
        &self.filters[cell % self.filters.len()]
    }
}

fn synthesize(azimuth: f32, elevation: f32, sample_rate: u32) -> HrtfFilter {
    let az = azimuth * PI / 180.0;
    let el = elevation * PI / 180.0;
    // Positive = source on the right.
    let lateral = az.sin() * el.cos();

    let itd = (lateral.abs() * MAX_ITD_SECONDS * sample_rate as f32).round() as usize;
    let itd = itd.min(HRTF_TAPS - 4);
    let far_gain = 1.0 - lateral.abs() * HEAD_SHADOW;

    // Pinna reflection arrives later for sources below the horizon.
    let pinna_delay = 2 + ((90.0 - elevation) / 30.0).round() as usize;
    let pinna_gain = 0.1 * el.cos();

    let mut near = [0.0; HRTF_TAPS];
    let mut far = [0.0; HRTF_TAPS];

    near[0] = 1.0;
    near[pinna_delay] += pinna_gain;

    // Head shadow smears the far-ear impulse over a few taps (crude low-pass).
    let shadow = lateral.abs();
    let weights = [1.0 - 0.4 * shadow, 0.3 * shadow, 0.1 * shadow];
    for (k, w) in weights.iter().enumerate() {
        far[itd + k] += far_gain * w;
    }
    far[(itd + pinna_delay).min(HRTF_TAPS - 1)] += pinna_gain * far_gain;

    if lateral >= 0.0 {
        HrtfFilter {
            left: far,
            right: near,
        }
    } else {
        HrtfFilter {
            left: near,
            right: far,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peak_index(taps: &[f32]) -> usize {
        taps.iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
            .0
    }

    #[test]
    fn test_table_dimensions() {
        let table = HrtfTable::procedural(48000).unwrap();
        assert_eq!(table.len(), 72 * 37);
    }

    #[test]
    fn test_cell_lookup_rounds_to_nearest() {
        assert_eq!(HrtfTable::cell_for(0.0, 0.0), 18);
        assert_eq!(HrtfTable::cell_for(91.0, 0.0), HrtfTable::cell_for(90.0, 0.0));
        assert_eq!(HrtfTable::cell_for(358.0, 0.0), HrtfTable::cell_for(0.0, 0.0));
        assert_eq!(HrtfTable::cell_for(-90.0, 0.0), HrtfTable::cell_for(270.0, 0.0));
        assert_eq!(HrtfTable::cell_for(0.0, 120.0), HrtfTable::cell_for(0.0, 90.0));
        let (az, el) = HrtfTable::cell_angles(HrtfTable::cell_for(45.0, -30.0));
        assert_eq!((az, el), (45.0, -30.0));
    }

    #[test]
    fn test_right_source_delays_left_ear() {
        let table = HrtfTable::procedural(48000).unwrap();
        let filter = table.filter(HrtfTable::cell_for(90.0, 0.0));
        assert_eq!(peak_index(&filter.right), 0);
        assert!(peak_index(&filter.left) > 20);
        let left_energy: f32 = filter.left.iter().map(|c| c * c).sum();
        let right_energy: f32 = filter.right.iter().map(|c| c * c).sum();
        assert!(right_energy > left_energy);
    }

    #[test]
    fn test_frontal_source_is_symmetric() {
        let table = HrtfTable::procedural(48000).unwrap();
        let filter = table.filter(HrtfTable::cell_for(0.0, 0.0));
        for (l, r) in filter.left.iter().zip(&filter.right) {
            assert!((l - r).abs() < 1e-6);
        }
    }

    #[test]
    fn test_blend_is_convex() {
        let a = HrtfFilter::gains(1.0, 0.0);
        let b = HrtfFilter::gains(0.0, 1.0);
        let mut out = HrtfFilter::silent();
        for step in 0..=10 {
            let t = step as f32 / 10.0;
            out.blend_from(&a, &b, t);
            assert!((0.0..=1.0).contains(&out.left[0]));
            assert!((out.left[0] + out.right[0] - 1.0).abs() < 1e-6);
        }
        out.blend_from(&a, &b, 1.0);
        assert_eq!(out, b);
    }
}

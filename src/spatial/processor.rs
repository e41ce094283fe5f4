use crate::config::{CitySonicWorldDesc, DistanceModel, DopplerRange, HrtfMode};
use crate::error::Result;
use crate::math::{Basis, Vec3};
use crate::spatial::hrtf::{HRTF_TAPS, HrtfFilter, HrtfTable};
use crate::spatial::listener::Listener;
use std::sync::Arc;

/// Per-block spatial parameters of one source, as seen by the listener.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialParams {
    /// Metres, clamped to the distance model's range.
    pub distance: f32,
    /// Degrees in [0, 360); 0 = ahead, 90 = right.
    pub azimuth: f32,
    /// Degrees in [-90, 90]; positive = above.
    pub elevation: f32,
    pub attenuation: f32,
    /// Pitch multiplier from relative radial velocity.
    pub doppler: f32,
    /// 1 = unobstructed.
    pub occlusion: f32,
}

impl Default for SpatialParams {
    fn default() -> Self {
        Self {
            distance: 0.0,
            azimuth: 0.0,
            elevation: 0.0,
            attenuation: 1.0,
            doppler: 1.0,
            occlusion: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterTarget {
    Cell(usize),
    Pan,
}

/// Spatialization state carried by each source between blocks.
#[derive(Debug)]
pub struct SourceSpatialState {
    target: Option<FilterTarget>,
    interpolation: f32,
    /// Snapshot of `current` taken when the target last changed.
    from: Box<HrtfFilter>,
    current: Box<HrtfFilter>,
    /// Coefficients past this index are zero in both ears.
    active_taps: usize,
    /// Input history, written twice so the newest `HRTF_TAPS` samples are always
    /// contiguous: `history[i] == history[i + HRTF_TAPS]`.
    history: Box<[f32]>,
    write: usize,
    params: SpatialParams,
}

impl SourceSpatialState {
    pub(crate) fn new() -> Result<Self> {
        let mut history = Vec::new();
        history.try_reserve_exact(2 * HRTF_TAPS)?;
        history.resize(2 * HRTF_TAPS, 0.0);
        Ok(Self {
            target: None,
            interpolation: 1.0,
            from: Box::new(HrtfFilter::silent()),
            current: Box::new(HrtfFilter::silent()),
            active_taps: 1,
            history: history.into_boxed_slice(),
            write: 0,
            params: SpatialParams::default(),
        })
    }

    pub(crate) fn reset(&mut self) {
        self.target = None;
        self.interpolation = 1.0;
        *self.current = HrtfFilter::silent();
        self.active_taps = 1;
        self.history.fill(0.0);
        self.write = 0;
        self.params = SpatialParams::default();
    }

    pub fn params(&self) -> &SpatialParams {
        &self.params
    }

    /// Progress of the current filter transition, in [0, 1].
    pub fn interpolation(&self) -> f32 {
        self.interpolation
    }

    /// Filter currently used for convolution.
    pub fn current_filter(&self) -> &HrtfFilter {
        &self.current
    }

    /// Push `dry` through the delay line and write the convolved left/right output.
    fn convolve(&mut self, dry: &[f32], out_left: &mut [f32], out_right: &mut [f32]) {
        let taps = self.active_taps.clamp(1, HRTF_TAPS);
        let left = &self.current.left[..taps];
        let right = &self.current.right[..taps];

        for ((&x, l), r) in dry.iter().zip(out_left.iter_mut()).zip(out_right.iter_mut()) {
            self.write = (self.write + 1) % HRTF_TAPS;
            self.history[self.write] = x;
            self.history[self.write + HRTF_TAPS] = x;

            let newest = self.write + HRTF_TAPS;
            let window = &self.history[newest + 1 - taps..=newest];
            let (mut acc_l, mut acc_r) = (0.0f32, 0.0f32);
            for ((&s, &hl), &hr) in window.iter().rev().zip(left).zip(right) {
                acc_l += s * hl;
                acc_r += s * hr;
            }
            *l = acc_l;
            *r = acc_r;
        }
    }
}

/// Inverse-distance gain: 1 at or below `min_distance`, `min/d` in between, 0 at or
/// beyond `max_distance`.
pub fn distance_attenuation(distance: f32, model: &DistanceModel) -> f32 {
    if distance >= model.max_distance {
        0.0
    } else {
        model.min_distance / distance.max(model.min_distance)
    }
}

/// Pitch multiplier for a source at `relative_position` moving with `relative_velocity`
/// (both relative to the listener). Approaching sources pitch up.
pub fn doppler_pitch(
    relative_position: Vec3,
    relative_velocity: Vec3,
    speed_of_sound: f32,
    doppler_factor: f32,
    range: &DopplerRange,
) -> f32 {
    if doppler_factor == 0.0 || speed_of_sound <= 0.0 {
        return 1.0;
    }
    let Some(direction) = relative_position.try_normalize() else {
        return 1.0;
    };
    let radial = relative_velocity.dot(direction);
    ((speed_of_sound - radial * doppler_factor) / speed_of_sound)
        .clamp(range.min_pitch, range.max_pitch)
}

/// Azimuth and elevation, in degrees, of `relative` in the listener's frame.
pub fn listener_angles(relative: Vec3, basis: &Basis) -> (f32, f32) {
    let length = relative.length();
    if length <= f32::EPSILON {
        return (0.0, 0.0);
    }
    let x = relative.dot(basis.right);
    let y = relative.dot(basis.up);
    let z = relative.dot(basis.forward);

    let azimuth = x.atan2(z).to_degrees().rem_euclid(360.0);
    let elevation = (y / length).clamp(-1.0, 1.0).asin().to_degrees();
    (azimuth, elevation)
}

/// Linear stereo gains for a pan position in [-1, 1]. Centre is unity in both ears.
pub fn pan_gains(pan: f32) -> (f32, f32) {
    let pan = pan.clamp(-1.0, 1.0);
    ((1.0 - pan).min(1.0), (1.0 + pan).min(1.0))
}

/// Turns source positions into per-ear signals.
///
/// Uses the shared HRTF table when one is available and enabled, otherwise falls back
/// to linear stereo panning. Both paths go through the same filter-interpolation ramp
/// so switching between them does not click.
pub struct SpatialProcessor {
    hrtf: Option<Arc<HrtfTable>>,
    hrtf_enabled: bool,
    distance: DistanceModel,
    doppler: DopplerRange,
    ramp_step: f32,
    pan_filter: HrtfFilter,
}

impl SpatialProcessor {
    /// Build from the world descriptor.
    ///
    /// A table that fails to generate is logged and the processor runs in panning mode.
    pub fn new(desc: &CitySonicWorldDesc) -> Self {
        let hrtf = match desc.hrtf_mode {
            HrtfMode::Procedural => match HrtfTable::procedural(desc.sample_rate) {
                Ok(table) => Some(Arc::new(table)),
                Err(e) => {
                    log::warn!("HRTF unavailable ({}), falling back to stereo panning", e);
                    None
                }
            },
            HrtfMode::Disabled => {
                log::info!("HRTF disabled, using stereo panning");
                None
            }
        };
        Self::with_table(hrtf, desc)
    }

    pub fn with_table(hrtf: Option<Arc<HrtfTable>>, desc: &CitySonicWorldDesc) -> Self {
        Self {
            hrtf,
            hrtf_enabled: true,
            distance: desc.distance,
            doppler: desc.doppler,
            ramp_step: desc.hrtf_ramp_step,
            pan_filter: HrtfFilter::silent(),
        }
    }

    pub fn is_hrtf_available(&self) -> bool {
        self.hrtf.is_some()
    }

    pub fn is_hrtf_active(&self) -> bool {
        self.hrtf_enabled && self.hrtf.is_some()
    }

    /// Toggle HRTF rendering at runtime (quality tiers).
    pub fn set_hrtf_enabled(&mut self, enabled: bool) {
        if self.hrtf_enabled != enabled {
            log::debug!("HRTF rendering {}", if enabled { "enabled" } else { "disabled" });
        }
        self.hrtf_enabled = enabled;
    }

    pub fn set_doppler_range(&mut self, range: DopplerRange) {
        self.doppler = range;
    }

    pub fn distance_model(&self) -> &DistanceModel {
        &self.distance
    }

    /// Compute this block's spatial parameters for a source and advance its filter
    /// interpolation. `occlusion` comes from the occlusion query.
    pub fn update_source(
        &mut self,
        state: &mut SourceSpatialState,
        position: Vec3,
        velocity: Vec3,
        listener: &Listener,
        occlusion: f32,
    ) -> SpatialParams {
        let scale = listener.distance_factor;
        let relative = (position - listener.position) * scale;
        let relative_velocity = (velocity - listener.velocity) * scale;

        let distance = relative
            .length()
            .clamp(self.distance.min_distance, self.distance.max_distance);
        let (azimuth, elevation) = listener_angles(relative, &listener.basis);
        let params = SpatialParams {
            distance,
            azimuth,
            elevation,
            attenuation: distance_attenuation(distance, &self.distance),
            doppler: doppler_pitch(
                relative,
                relative_velocity,
                listener.speed_of_sound,
                listener.doppler_factor,
                &self.doppler,
            ),
            occlusion: occlusion.clamp(0.0, 1.0),
        };
        state.params = params;

        let target = match (&self.hrtf, self.hrtf_enabled) {
            (Some(_), true) => FilterTarget::Cell(HrtfTable::cell_for(azimuth, elevation)),
            _ => {
                let lateral = azimuth.to_radians().sin() * elevation.to_radians().cos();
                let (l, r) = pan_gains(lateral);
                self.pan_filter = HrtfFilter::gains(l, r);
                FilterTarget::Pan
            }
        };
        self.step_interpolation(state, target);
        params
    }

    fn step_interpolation(&self, state: &mut SourceSpatialState, target: FilterTarget) {
        match state.target {
            None => state.interpolation = 1.0,
            Some(previous) if previous != target => {
                state.from.clone_from(&state.current);
                state.interpolation = 0.0;
            }
            Some(_) => {}
        }
        state.target = Some(target);

        if state.interpolation < 1.0 {
            let next = state.interpolation + self.ramp_step;
            // Absorb accumulated rounding so the ramp takes exactly ceil(1 / step) blocks.
            state.interpolation = if next >= 1.0 - 1e-4 { 1.0 } else { next };
        }

        let to = match (target, &self.hrtf) {
            (FilterTarget::Cell(cell), Some(table)) => table.filter(cell),
            _ => &self.pan_filter,
        };
        let t = state.interpolation;
        if t >= 1.0 {
            state.current.as_mut().clone_from(to);
        } else {
            state.current.blend_from(&state.from, to, t);
        }
        state.active_taps = last_nonzero(&state.current);
    }

    /// Convolve one block of dry mono input into unit-gain left/right output.
    ///
    /// Gains (volume, attenuation, occlusion, fades) are applied later by the mixer.
    pub fn render_source(
        &self,
        state: &mut SourceSpatialState,
        dry: &[f32],
        out_left: &mut [f32],
        out_right: &mut [f32],
    ) {
        state.convolve(dry, out_left, out_right);
    }
}

fn last_nonzero(filter: &HrtfFilter) -> usize {
    let last = |taps: &[f32]| taps.iter().rposition(|&c| c != 0.0).map_or(0, |i| i + 1);
    last(&filter.left).max(last(&filter.right)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn processor() -> SpatialProcessor {
        SpatialProcessor::new(&CitySonicWorldDesc::default())
    }

    #[test]
    fn test_source_on_the_right() {
        let mut processor = processor();
        let mut state = SourceSpatialState::new().unwrap();
        let listener = Listener::default();
        let params = processor.update_source(
            &mut state,
            Vec3::new(10.0, 0.0, 0.0),
            Vec3::ZERO,
            &listener,
            1.0,
        );
        assert_abs_diff_eq!(params.azimuth, 90.0, epsilon = 1e-3);
        assert_abs_diff_eq!(params.elevation, 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(params.distance, 10.0, epsilon = 1e-4);
        assert!(params.attenuation < distance_attenuation(1.0, processor.distance_model()));
    }

    #[test]
    fn test_azimuth_convention() {
        let basis = Basis::default();
        let (ahead, _) = listener_angles(Vec3::new(0.0, 0.0, -5.0), &basis);
        let (behind, _) = listener_angles(Vec3::new(0.0, 0.0, 5.0), &basis);
        let (left, _) = listener_angles(Vec3::new(-5.0, 0.0, 0.0), &basis);
        let (_, above) = listener_angles(Vec3::new(0.0, 5.0, 0.0), &basis);
        assert_abs_diff_eq!(ahead, 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(behind, 180.0, epsilon = 1e-3);
        assert_abs_diff_eq!(left, 270.0, epsilon = 1e-3);
        assert_abs_diff_eq!(above, 90.0, epsilon = 1e-3);
    }

    #[test]
    fn test_azimuth_follows_listener_orientation() {
        let mut listener = Listener::default();
        listener
            .set_orientation(Vec3::ZERO, Vec3::X, Vec3::Y)
            .unwrap();
        let (azimuth, _) = listener_angles(Vec3::new(10.0, 0.0, 0.0), &listener.basis);
        assert_abs_diff_eq!(azimuth, 0.0, epsilon = 1e-3);
    }

    #[test]
    fn test_distance_attenuation_is_monotonic() {
        let model = DistanceModel::default();
        assert_eq!(distance_attenuation(0.1, &model), 1.0);
        assert_eq!(distance_attenuation(1.0, &model), 1.0);
        assert_eq!(distance_attenuation(1000.0, &model), 0.0);
        assert_eq!(distance_attenuation(5000.0, &model), 0.0);
        let mut previous = f32::MAX;
        let mut d = model.min_distance;
        while d < model.max_distance + 10.0 {
            let a = distance_attenuation(d, &model);
            assert!(a <= previous);
            previous = a;
            d += 7.5;
        }
    }

    #[test]
    fn test_doppler_sign_and_clamp() {
        let range = DopplerRange::default();
        let position = Vec3::new(100.0, 0.0, 0.0);
        let approaching = doppler_pitch(position, Vec3::new(-30.0, 0.0, 0.0), 343.3, 1.0, &range);
        let receding = doppler_pitch(position, Vec3::new(30.0, 0.0, 0.0), 343.3, 1.0, &range);
        assert!(approaching > 1.0);
        assert!(receding < 1.0);
        let supersonic = doppler_pitch(position, Vec3::new(-5000.0, 0.0, 0.0), 343.3, 1.0, &range);
        assert_eq!(supersonic, 2.0);
        assert_eq!(
            doppler_pitch(position, Vec3::new(-30.0, 0.0, 0.0), 343.3, 0.0, &range),
            1.0
        );
    }

    #[test]
    fn test_hrtf_interpolation_converges_and_stays_convex() {
        let mut processor = processor();
        let mut state = SourceSpatialState::new().unwrap();
        let listener = Listener::default();

        processor.update_source(&mut state, Vec3::new(-10.0, 0.0, 0.0), Vec3::ZERO, &listener, 1.0);
        assert_eq!(state.interpolation(), 1.0);
        let old = state.current_filter().clone();

        let new = HrtfTable::procedural(48000)
            .unwrap()
            .filter(HrtfTable::cell_for(90.0, 0.0))
            .clone();
        let mut blocks = 0;
        loop {
            processor.update_source(&mut state, Vec3::new(10.0, 0.0, 0.0), Vec3::ZERO, &listener, 1.0);
            blocks += 1;
            let current = state.current_filter();
            for i in 0..HRTF_TAPS {
                let lo = old.left[i].min(new.left[i]) - 1e-6;
                let hi = old.left[i].max(new.left[i]) + 1e-6;
                assert!((lo..=hi).contains(&current.left[i]));
            }
            if state.interpolation() >= 1.0 {
                assert_eq!(*current, new);
                break;
            }
            assert!(blocks < 100);
        }
        assert_eq!(blocks, 20);
    }

    #[test]
    fn test_panning_fallback_without_hrtf() {
        let desc = CitySonicWorldDesc::default().hrtf_mode(HrtfMode::Disabled);
        let mut processor = SpatialProcessor::new(&desc);
        assert!(!processor.is_hrtf_available());

        let mut state = SourceSpatialState::new().unwrap();
        processor.update_source(&mut state, Vec3::new(10.0, 0.0, 0.0), Vec3::ZERO, &Listener::default(), 1.0);
        let dry = vec![1.0; 8];
        let mut l = vec![0.0; 8];
        let mut r = vec![0.0; 8];
        processor.render_source(&mut state, &dry, &mut l, &mut r);
        assert!(l.iter().all(|&s| s.abs() < 1e-5));
        assert!(r.iter().all(|&s| (s - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_convolution_applies_interaural_delay() {
        let mut processor = processor();
        let mut state = SourceSpatialState::new().unwrap();
        processor.update_source(&mut state, Vec3::new(10.0, 0.0, 0.0), Vec3::ZERO, &Listener::default(), 1.0);

        let mut dry = vec![0.0; 64];
        dry[0] = 1.0;
        let mut l = vec![0.0; 64];
        let mut r = vec![0.0; 64];
        processor.render_source(&mut state, &dry, &mut l, &mut r);

        let filter = state.current_filter();
        for i in 0..64 {
            assert_abs_diff_eq!(l[i], filter.left[i], epsilon = 1e-6);
            assert_abs_diff_eq!(r[i], filter.right[i], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_convolution_is_continuous_across_blocks() {
        let mut processor = processor();
        let listener = Listener::default();
        let position = Vec3::new(3.0, 1.0, -4.0);
        let input: Vec<f32> = (0..256).map(|i| ((i * 7) % 13) as f32 / 13.0 - 0.5).collect();

        let mut whole = SourceSpatialState::new().unwrap();
        processor.update_source(&mut whole, position, Vec3::ZERO, &listener, 1.0);
        let (mut wl, mut wr) = (vec![0.0; 256], vec![0.0; 256]);
        processor.render_source(&mut whole, &input, &mut wl, &mut wr);

        let mut split = SourceSpatialState::new().unwrap();
        processor.update_source(&mut split, position, Vec3::ZERO, &listener, 1.0);
        let (mut sl, mut sr) = (vec![0.0; 256], vec![0.0; 256]);
        let (a, b) = sl.split_at_mut(100);
        let (c, d) = sr.split_at_mut(100);
        processor.render_source(&mut split, &input[..100], a, c);
        processor.render_source(&mut split, &input[100..], b, d);

        for i in 0..256 {
            assert_abs_diff_eq!(wl[i], sl[i], epsilon = 1e-6);
            assert_abs_diff_eq!(wr[i], sr[i], epsilon = 1e-6);
        }
    }
}

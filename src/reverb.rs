//! Zone-aware multi-tap reverb.
//!
//! Zones are spheres registered in priority order. Zone 0 is the catch-all: it is
//! returned for any position no other zone contains, whatever its radius. The
//! engine owns one stereo delay line shared by every zone, so moving between
//! zones keeps the existing tail instead of cutting it.

use crate::config::ReverbDesc;
use crate::error::{CitySonicError, Result};
use crate::math::Vec3;

pub const REVERB_TAPS: usize = 8;

/// Relative tap spacing. Mutually incommensurate so echoes do not pile up.
const TAP_SPREAD: [f32; REVERB_TAPS] = [1.0, 1.37, 1.71, 2.09, 2.53, 2.97, 3.41, 3.89];
/// Delay of the first tap for `room_size == 1`, in seconds.
const BASE_TAP_SECONDS: f32 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ZoneId(pub(crate) usize);

impl ZoneId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReverbZoneType {
    Outdoor,
    IndoorSmall,
    IndoorLarge,
    Tunnel,
    Underground,
    Stadium,
}

/// Acoustic character of a zone type: `(room_size, damping, wet, dry, decay_time, pre_delay)`.
fn preset(zone_type: ReverbZoneType) -> (f32, f32, f32, f32, f32, f32) {
    match zone_type {
        ReverbZoneType::Outdoor => (0.7, 0.5, 0.2, 0.8, 0.8, 0.02),
        ReverbZoneType::IndoorSmall => (0.2, 0.6, 0.25, 0.8, 0.5, 0.005),
        ReverbZoneType::IndoorLarge => (0.6, 0.4, 0.35, 0.7, 1.8, 0.015),
        ReverbZoneType::Tunnel => (0.9, 0.2, 0.45, 0.6, 2.5, 0.01),
        ReverbZoneType::Underground => (0.8, 0.3, 0.4, 0.65, 2.0, 0.012),
        ReverbZoneType::Stadium => (1.0, 0.35, 0.3, 0.75, 3.0, 0.04),
    }
}

/// One delay tap: read `delay` samples behind the write head, scaled by `gain`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReverbTap {
    pub delay: usize,
    pub gain: f32,
}

/// Static acoustic description of a region of the city.
#[derive(Debug, Clone, PartialEq)]
pub struct ReverbZone {
    pub zone_type: ReverbZoneType,
    pub center: Vec3,
    pub radius: f32,
    pub room_size: f32,
    /// 0 = bright, 1 = fully damped tail.
    pub damping: f32,
    pub wet_gain: f32,
    pub dry_gain: f32,
    /// Seconds for the tail to fall by 60 dB.
    pub decay_time: f32,
    /// Seconds before the first reflection.
    pub pre_delay: f32,
    pub feedback: f32,
    pub taps: [ReverbTap; REVERB_TAPS],
}

impl ReverbZone {
    /// A zone with the preset character of `zone_type`, taps laid out for `sample_rate`.
    pub fn new(zone_type: ReverbZoneType, center: Vec3, radius: f32, sample_rate: u32) -> Self {
        let (room_size, damping, wet_gain, dry_gain, decay_time, pre_delay) = preset(zone_type);
        let mut zone = Self {
            zone_type,
            center,
            radius,
            room_size,
            damping,
            wet_gain,
            dry_gain,
            decay_time,
            pre_delay,
            feedback: 0.0,
            taps: [ReverbTap::default(); REVERB_TAPS],
        };
        zone.layout_taps(sample_rate);
        zone
    }

    /// Zone used when nothing else is registered: the outdoor preset everywhere.
    pub fn global(sample_rate: u32) -> Self {
        Self::new(ReverbZoneType::Outdoor, Vec3::ZERO, f32::INFINITY, sample_rate)
    }

    /// Recompute tap delays, tap gains and feedback from `room_size`, `pre_delay` and
    /// `decay_time`. Call after editing those fields.
    pub fn layout_taps(&mut self, sample_rate: u32) {
        let rate = sample_rate as f32;
        let decay = self.decay_time.max(1e-3);
        let mut longest = 0.0f32;
        for (tap, spread) in self.taps.iter_mut().zip(TAP_SPREAD) {
            let seconds = self.pre_delay + BASE_TAP_SECONDS * self.room_size.max(0.01) * spread;
            tap.delay = ((seconds * rate).round() as usize).max(1);
            // -60 dB after `decay_time`.
            tap.gain = 10f32.powf(-3.0 * seconds / decay) / REVERB_TAPS as f32;
            longest = longest.max(seconds);
        }
        self.feedback = 10f32.powf(-3.0 * longest / decay);
    }

    pub fn contains(&self, position: Vec3) -> bool {
        position.distance_squared(self.center) <= self.radius * self.radius
    }

    /// Check that every tap fits a delay line of `max_delay` samples and that the
    /// gains are usable.
    pub fn validate(&self, max_delay: usize) -> Result<()> {
        for (i, tap) in self.taps.iter().enumerate() {
            if tap.delay == 0 || tap.delay > max_delay {
                return Err(CitySonicError::Configuration(format!(
                    "reverb tap {} delay {} outside 1..={} samples",
                    i, tap.delay, max_delay
                )));
            }
            if !tap.gain.is_finite() {
                return Err(CitySonicError::Configuration(format!(
                    "reverb tap {} gain {} is not finite",
                    i, tap.gain
                )));
            }
        }
        let gains = [self.wet_gain, self.dry_gain, self.feedback, self.damping];
        if gains.iter().any(|g| !g.is_finite() || *g < 0.0) {
            return Err(CitySonicError::Configuration(format!(
                "reverb gains must be finite and non-negative (wet {}, dry {}, feedback {}, damping {})",
                self.wet_gain, self.dry_gain, self.feedback, self.damping
            )));
        }
        if self.radius.is_nan() || self.radius < 0.0 {
            return Err(CitySonicError::Configuration(format!(
                "reverb zone radius {} is negative",
                self.radius
            )));
        }
        Ok(())
    }
}

/// Multi-tap delay network with zone lookup.
#[derive(Debug)]
pub struct ReverbEngine {
    zones: Vec<ReverbZone>,
    max_zones: usize,
    max_feedback: f32,
    delay_left: Vec<f32>,
    delay_right: Vec<f32>,
    write: usize,
    damp_left: f32,
    damp_right: f32,
    enabled: bool,
}

impl ReverbEngine {
    /// Allocate the shared delay line.
    ///
    /// # Errors
    ///
    /// `AllocationFailure` if the delay line cannot be reserved.
    pub fn new(desc: &ReverbDesc, sample_rate: u32) -> Result<Self> {
        let length = ((desc.max_delay_seconds * sample_rate as f32) as usize).max(1);
        let mut delay_left = Vec::new();
        let mut delay_right = Vec::new();
        delay_left.try_reserve_exact(length)?;
        delay_right.try_reserve_exact(length)?;
        delay_left.resize(length, 0.0);
        delay_right.resize(length, 0.0);

        let mut zones = Vec::new();
        zones.try_reserve_exact(desc.max_zones)?;

        log::debug!(
            "Reverb delay line ready ({} samples, {} zones max)",
            length,
            desc.max_zones
        );
        Ok(Self {
            zones,
            max_zones: desc.max_zones,
            max_feedback: desc.max_feedback,
            delay_left,
            delay_right,
            write: 0,
            damp_left: 0.0,
            damp_right: 0.0,
            enabled: true,
        })
    }

    /// Register a zone as given; its taps are not recomputed. The first zone added
    /// becomes the catch-all.
    ///
    /// # Errors
    ///
    /// `Exhausted` once `max_zones` zones exist, `Configuration` if a tap is longer
    /// than the delay line or a gain is unusable.
    pub fn add_zone(&mut self, zone: ReverbZone) -> Result<ZoneId> {
        zone.validate(self.max_delay_frames())?;
        if self.zones.len() >= self.max_zones {
            return Err(CitySonicError::Exhausted {
                pool: "reverb zone",
                capacity: self.max_zones,
            });
        }
        let id = ZoneId(self.zones.len());
        log::debug!(
            "Added {:?} reverb zone {} at {:?} (r = {})",
            zone.zone_type,
            id.0,
            zone.center,
            zone.radius
        );
        self.zones.push(zone);
        Ok(id)
    }

    pub fn clear_zones(&mut self) {
        self.zones.clear();
    }

    pub fn zone(&self, id: ZoneId) -> Option<&ReverbZone> {
        self.zones.get(id.0)
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    /// Longest tap delay the shared delay line can hold.
    pub fn max_delay_frames(&self) -> usize {
        self.delay_left.len()
    }

    /// Retune the catch-all zone and lay its taps out again. Values are clamped to
    /// [0, 1].
    ///
    /// # Errors
    ///
    /// `NotReady` if no zone is registered, `Configuration` if the new taps do not fit
    /// the delay line. The zone is left unchanged on error.
    pub fn set_global_params(
        &mut self,
        room_size: f32,
        damping: f32,
        wet_gain: f32,
        dry_gain: f32,
        sample_rate: u32,
    ) -> Result<()> {
        let max_delay = self.max_delay_frames();
        let global = self
            .zones
            .first_mut()
            .ok_or_else(|| CitySonicError::NotReady("no global reverb zone".into()))?;
        let mut tuned = global.clone();
        tuned.room_size = room_size.clamp(0.0, 1.0);
        tuned.damping = damping.clamp(0.0, 1.0);
        tuned.wet_gain = wet_gain.clamp(0.0, 1.0);
        tuned.dry_gain = dry_gain.clamp(0.0, 1.0);
        tuned.layout_taps(sample_rate);
        tuned.validate(max_delay)?;
        log::debug!(
            "Global reverb: room {} damping {} wet {} dry {}",
            tuned.room_size,
            tuned.damping,
            tuned.wet_gain,
            tuned.dry_gain
        );
        *global = tuned;
        Ok(())
    }

    /// First zone after zone 0 whose sphere contains `position`, else zone 0.
    pub fn find_zone(&self, position: Vec3) -> Option<ZoneId> {
        self.zones
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, zone)| zone.contains(position))
            .map(|(i, _)| ZoneId(i))
            .or_else(|| (!self.zones.is_empty()).then_some(ZoneId(0)))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Disabling clears the delay line so re-enabling does not replay a stale tail.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled && !enabled {
            self.delay_left.fill(0.0);
            self.delay_right.fill(0.0);
            self.damp_left = 0.0;
            self.damp_right = 0.0;
        }
        if self.enabled != enabled {
            log::debug!("Reverb {}", if enabled { "enabled" } else { "disabled" });
        }
        self.enabled = enabled;
    }

    /// Run `input_*` through `zone` into `output_*`. The frame count is the shortest
    /// of the four slices.
    pub fn process(
        &mut self,
        input_left: &[f32],
        input_right: &[f32],
        zone: Option<ZoneId>,
        output_left: &mut [f32],
        output_right: &mut [f32],
    ) {
        let frames = input_left
            .len()
            .min(input_right.len())
            .min(output_left.len())
            .min(output_right.len());
        output_left[..frames].copy_from_slice(&input_left[..frames]);
        output_right[..frames].copy_from_slice(&input_right[..frames]);
        self.process_in_place(&mut output_left[..frames], &mut output_right[..frames], zone);
    }

    /// Replace the dry signal in `left`/`right` with the zone's wet/dry mix.
    ///
    /// Passes the signal through untouched when disabled or when `zone` is `None` or
    /// unknown.
    pub fn process_in_place(&mut self, left: &mut [f32], right: &mut [f32], zone: Option<ZoneId>) {
        if !self.enabled {
            return;
        }
        let Some(zone) = zone.and_then(|id| self.zones.get(id.0)) else {
            return;
        };

        let length = self.delay_left.len();
        let feedback = zone.feedback.min(self.max_feedback);
        let damping = zone.damping.clamp(0.0, 1.0);
        let taps = zone.taps;
        let (wet_gain, dry_gain) = (zone.wet_gain, zone.dry_gain);

        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let (mut wet_l, mut wet_r) = (0.0f32, 0.0f32);
            for tap in &taps {
                let read = (self.write + length - tap.delay.clamp(1, length)) % length;
                wet_l += self.delay_left[read] * tap.gain;
                wet_r += self.delay_right[read] * tap.gain;
            }

            // One-pole low-pass on the tail.
            self.damp_left += (1.0 - damping) * (wet_l - self.damp_left);
            self.damp_right += (1.0 - damping) * (wet_r - self.damp_right);

            self.delay_left[self.write] = *l + self.damp_left * feedback;
            self.delay_right[self.write] = *r + self.damp_right * feedback;
            self.write = (self.write + 1) % length;

            *l = *l * dry_gain + self.damp_left * wet_gain;
            *r = *r * dry_gain + self.damp_right * wet_gain;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 48000;

    fn engine() -> ReverbEngine {
        ReverbEngine::new(&ReverbDesc::default(), RATE).unwrap()
    }

    #[test]
    fn test_find_zone_prefers_specific_zones_over_catch_all() {
        let mut reverb = engine();
        assert_eq!(reverb.find_zone(Vec3::ZERO), None);

        let global = reverb.add_zone(ReverbZone::global(RATE)).unwrap();
        let tunnel = reverb
            .add_zone(ReverbZone::new(
                ReverbZoneType::Tunnel,
                Vec3::new(100.0, 0.0, 0.0),
                20.0,
                RATE,
            ))
            .unwrap();
        let hall = reverb
            .add_zone(ReverbZone::new(
                ReverbZoneType::IndoorLarge,
                Vec3::new(110.0, 0.0, 0.0),
                20.0,
                RATE,
            ))
            .unwrap();

        assert_eq!(reverb.find_zone(Vec3::new(100.0, 0.0, 0.0)), Some(tunnel));
        // Inside both spheres: registration order wins.
        assert_eq!(reverb.find_zone(Vec3::new(105.0, 0.0, 0.0)), Some(tunnel));
        assert_eq!(reverb.find_zone(Vec3::new(125.0, 0.0, 0.0)), Some(hall));
        assert_eq!(reverb.find_zone(Vec3::new(-500.0, 0.0, 0.0)), Some(global));
    }

    #[test]
    fn test_zone_limit() {
        let desc = ReverbDesc {
            max_zones: 2,
            ..ReverbDesc::default()
        };
        let mut reverb = ReverbEngine::new(&desc, RATE).unwrap();
        reverb.add_zone(ReverbZone::global(RATE)).unwrap();
        reverb.add_zone(ReverbZone::global(RATE)).unwrap();
        assert!(matches!(
            reverb.add_zone(ReverbZone::global(RATE)),
            Err(CitySonicError::Exhausted { capacity: 2, .. })
        ));
        reverb.clear_zones();
        assert_eq!(reverb.zone_count(), 0);
    }

    #[test]
    fn test_no_zone_passes_signal_through() {
        let mut reverb = engine();
        let input = vec![0.5; 64];
        let (mut l, mut r) = (vec![0.0; 64], vec![0.0; 64]);
        reverb.process(&input, &input, None, &mut l, &mut r);
        assert_eq!(l, input);
        assert_eq!(r, input);
    }

    #[test]
    fn test_impulse_echoes_at_first_tap() {
        let mut reverb = engine();
        let zone = ReverbZone::new(ReverbZoneType::IndoorSmall, Vec3::ZERO, 10.0, RATE);
        let first = zone.taps[0];
        let (wet, dry) = (zone.wet_gain, zone.dry_gain);
        let id = reverb.add_zone(zone).unwrap();

        let n = first.delay + 16;
        let mut left = vec![0.0; n];
        let mut right = vec![0.0; n];
        left[0] = 1.0;
        right[0] = 1.0;
        reverb.process_in_place(&mut left, &mut right, Some(id));

        assert!((left[0] - dry).abs() < 1e-6);
        assert!(left[1..first.delay].iter().all(|s| s.abs() < 1e-9));
        assert!(left[first.delay] > 0.0);
        assert!(left[first.delay] <= first.gain * wet + 1e-6);
        assert_eq!(left, right);
    }

    #[test]
    fn test_tail_decays_and_feedback_is_bounded() {
        let desc = ReverbDesc {
            max_feedback: 0.5,
            ..ReverbDesc::default()
        };
        let mut reverb = ReverbEngine::new(&desc, RATE).unwrap();
        let id = reverb
            .add_zone(ReverbZone::new(ReverbZoneType::Stadium, Vec3::ZERO, 10.0, RATE))
            .unwrap();

        let mut left = vec![0.0; RATE as usize];
        let mut right = vec![0.0; RATE as usize];
        left[0] = 1.0;
        reverb.process_in_place(&mut left, &mut right, Some(id));
        assert!(left.iter().all(|s| s.abs() <= 1.0));

        let mut tail_l = vec![0.0; RATE as usize * 4];
        let mut tail_r = vec![0.0; RATE as usize * 4];
        reverb.process_in_place(&mut tail_l, &mut tail_r, Some(id));
        let late: f32 = tail_l[tail_l.len() - 1024..].iter().map(|s| s.abs()).sum();
        assert!(late < 1e-3);
    }

    #[test]
    fn test_disabled_engine_is_transparent() {
        let mut reverb = engine();
        let id = reverb.add_zone(ReverbZone::global(RATE)).unwrap();
        reverb.set_enabled(false);
        let mut left = vec![0.3; 32];
        let mut right = vec![-0.3; 32];
        reverb.process_in_place(&mut left, &mut right, Some(id));
        assert!(left.iter().all(|&s| s == 0.3));
        assert!(right.iter().all(|&s| s == -0.3));
    }

    #[test]
    fn test_custom_taps_are_kept() {
        let mut reverb = engine();
        let mut zone = ReverbZone::new(ReverbZoneType::IndoorSmall, Vec3::ZERO, 10.0, RATE);
        zone.taps = [ReverbTap {
            delay: 100,
            gain: 0.1,
        }; REVERB_TAPS];
        zone.taps[7] = ReverbTap {
            delay: 4000,
            gain: 0.05,
        };
        zone.feedback = 0.3;
        let id = reverb.add_zone(zone.clone()).unwrap();
        assert_eq!(reverb.zone(id), Some(&zone));
    }

    #[test]
    fn test_tap_longer_than_delay_line_is_rejected() {
        let desc = ReverbDesc {
            max_delay_seconds: 0.5,
            ..ReverbDesc::default()
        };
        let mut reverb = ReverbEngine::new(&desc, RATE).unwrap();
        let mut zone = ReverbZone::new(ReverbZoneType::Tunnel, Vec3::ZERO, 10.0, RATE);
        zone.taps[3].delay = RATE as usize;
        assert!(matches!(
            reverb.add_zone(zone.clone()),
            Err(CitySonicError::Configuration(_))
        ));
        zone.taps[3].delay = 0;
        assert!(matches!(
            reverb.add_zone(zone),
            Err(CitySonicError::Configuration(_))
        ));
        assert_eq!(reverb.zone_count(), 0);
    }

    #[test]
    fn test_retune_global_zone() {
        let mut reverb = engine();
        assert!(matches!(
            reverb.set_global_params(0.5, 0.5, 0.5, 0.5, RATE),
            Err(CitySonicError::NotReady(_))
        ));
        let global = reverb.add_zone(ReverbZone::global(RATE)).unwrap();
        let before = reverb.zone(global).unwrap().taps[7].delay;

        reverb.set_global_params(0.2, 1.5, 0.4, 0.6, RATE).unwrap();
        let zone = reverb.zone(global).unwrap();
        assert!(zone.taps[7].delay < before);
        assert_eq!(zone.damping, 1.0);
        assert_eq!(zone.wet_gain, 0.4);
        assert_eq!(zone.dry_gain, 0.6);
    }

    #[test]
    fn test_presets_scale_with_room_size() {
        let small = ReverbZone::new(ReverbZoneType::IndoorSmall, Vec3::ZERO, 1.0, RATE);
        let stadium = ReverbZone::new(ReverbZoneType::Stadium, Vec3::ZERO, 1.0, RATE);
        assert!(stadium.taps[7].delay > small.taps[7].delay);
        for zone in [&small, &stadium] {
            assert!(zone.taps.windows(2).all(|w| w[0].delay < w[1].delay));
            assert!(zone.feedback < 1.0);
        }
    }
}

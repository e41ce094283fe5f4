//! Playback control and state management.
//!
//! This module provides the per-source building blocks the renderer drives every block:
//! - [`PlayState`]: lifecycle state of a source
//! - [`FadeEnvelope`]: linear gain ramp used for fade-in/fade-out
//! - [`GainRamp`]: the start/end gain a single block is scaled by
//! - [`PlaybackCursor`]: fractional read position with loop bounds and pitch
//!
//! Most users will drive these through [`CitySonicWorld`](crate::CitySonicWorld)
//! methods like `play()`, `fade_out()`, and `stop()`, rather than using them directly.

/// Lifecycle state of an audio source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayState {
    /// Not rendering. A free slot is always stopped.
    #[default]
    Stopped,
    Playing,
    /// Retains the cursor; resumes where it left off.
    Paused,
    /// Playing while the fade envelope ramps up.
    FadingIn,
    /// Playing while the fade envelope ramps down; stops once it reaches zero.
    FadingOut,
}

impl PlayState {
    /// Whether the source contributes samples this block.
    pub fn is_audible(&self) -> bool {
        matches!(self, Self::Playing | Self::FadingIn | Self::FadingOut)
    }
}

/// Start and end gain for one block; samples in between are linearly interpolated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainRamp {
    pub start: f32,
    pub end: f32,
}

impl GainRamp {
    pub const UNITY: Self = Self {
        start: 1.0,
        end: 1.0,
    };

    pub fn constant(gain: f32) -> Self {
        Self {
            start: gain,
            end: gain,
        }
    }

    pub fn is_constant(&self) -> bool {
        self.start == self.end
    }

    pub fn scaled(self, gain: f32) -> Self {
        Self {
            start: self.start * gain,
            end: self.end * gain,
        }
    }

    /// Gain at frame `i` of an `n`-frame block.
    #[inline]
    pub fn at(&self, i: usize, n: usize) -> f32 {
        if n == 0 {
            return self.start;
        }
        self.start + (self.end - self.start) * (i as f32 / n as f32)
    }
}

/// Linear fade from `start` to `target` over `duration` frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FadeEnvelope {
    start: f32,
    target: f32,
    duration: u64,
    elapsed: u64,
}

impl FadeEnvelope {
    /// A settled envelope sitting at `level`.
    pub fn settled(level: f32) -> Self {
        Self {
            start: level,
            target: level,
            duration: 0,
            elapsed: 0,
        }
    }

    /// Start a new ramp from the current level toward `target`.
    pub fn retarget(&mut self, target: f32, duration: u64) {
        self.start = self.level();
        self.target = target;
        self.duration = duration;
        self.elapsed = 0;
    }

    pub fn level(&self) -> f32 {
        if self.elapsed >= self.duration {
            self.target
        } else {
            let t = self.elapsed as f32 / self.duration as f32;
            self.start + (self.target - self.start) * t
        }
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn is_complete(&self) -> bool {
        self.elapsed >= self.duration
    }

    /// Advance by `frames` and return the ramp covering that span.
    pub fn advance(&mut self, frames: usize) -> GainRamp {
        let start = self.level();
        self.elapsed = (self.elapsed + frames as u64).min(self.duration);
        GainRamp {
            start,
            end: self.level(),
        }
    }
}

impl Default for FadeEnvelope {
    fn default() -> Self {
        Self::settled(1.0)
    }
}

/// Result of pulling one block through a [`PlaybackCursor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CursorOutcome {
    /// Frames that carried clip data. The rest of the block is silence.
    pub frames: usize,
    /// Times the cursor wrapped back to the loop start during the block.
    pub loops: u32,
    /// The clip ran out and looping is disabled.
    pub ended: bool,
}

/// Fractional read position into a mono clip.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackCursor {
    position: f64,
    loop_start: usize,
    loop_end: Option<usize>,
    looping: bool,
}

impl Default for PlaybackCursor {
    fn default() -> Self {
        Self {
            position: 0.0,
            loop_start: 0,
            loop_end: None,
            looping: false,
        }
    }
}

impl PlaybackCursor {
    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn rewind(&mut self) {
        self.position = 0.0;
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    /// Restrict looping to `[start, end)`. `None` loops to the end of the clip.
    pub fn set_loop_region(&mut self, start: usize, end: Option<usize>) {
        self.loop_start = start;
        self.loop_end = end;
    }

    pub fn loop_region(&self) -> (usize, Option<usize>) {
        (self.loop_start, self.loop_end)
    }

    /// Read `out.len()` frames from `clip`, stepping `rate` source frames per output frame.
    ///
    /// Uses linear interpolation between neighbouring frames. When looping, the cursor
    /// wraps from the loop end to the loop start. Without looping the loop region is
    /// ignored: playback runs to the end of the clip, the remainder of `out` is zeroed
    /// and `ended` is set.
    pub fn read_block(&mut self, clip: &[f32], rate: f32, out: &mut [f32]) -> CursorOutcome {
        let mut outcome = CursorOutcome::default();
        let len = clip.len();
        let end = match self.loop_end {
            Some(e) if self.looping => e.min(len),
            _ => len,
        };
        let start = self.loop_start.min(end.saturating_sub(1));
        let step = rate.max(0.0) as f64;

        if end == 0 {
            out.fill(0.0);
            outcome.ended = true;
            return outcome;
        }

        for sample in out.iter_mut() {
            if self.position >= end as f64 {
                if self.looping && end > start {
                    let span = (end - start) as f64;
                    self.position = start as f64 + (self.position - end as f64) % span;
                    outcome.loops += 1;
                } else {
                    outcome.ended = true;
                    break;
                }
            }

            let idx = self.position as usize;
            let frac = (self.position - idx as f64) as f32;
            let a = clip[idx];
            let b = if idx + 1 < end {
                clip[idx + 1]
            } else if self.looping {
                clip[start]
            } else {
                a
            };
            *sample = a + (b - a) * frac;
            outcome.frames += 1;
            self.position += step;
        }

        if !outcome.ended && !self.looping && self.position >= end as f64 {
            outcome.ended = true;
        }
        out[outcome.frames..].fill(0.0);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_fade_envelope_linear() {
        let mut env = FadeEnvelope::settled(0.0);
        env.retarget(1.0, 100);
        let ramp = env.advance(50);
        assert_abs_diff_eq!(ramp.start, 0.0);
        assert_abs_diff_eq!(ramp.end, 0.5);
        let ramp = env.advance(80);
        assert_abs_diff_eq!(ramp.end, 1.0);
        assert!(env.is_complete());
    }

    #[test]
    fn test_fade_retarget_starts_from_current_level() {
        let mut env = FadeEnvelope::settled(0.0);
        env.retarget(1.0, 10);
        env.advance(5);
        env.retarget(0.0, 10);
        assert_abs_diff_eq!(env.level(), 0.5);
    }

    #[test]
    fn test_gain_ramp_interpolates() {
        let ramp = GainRamp {
            start: 0.0,
            end: 1.0,
        };
        assert_abs_diff_eq!(ramp.at(0, 4), 0.0);
        assert_abs_diff_eq!(ramp.at(2, 4), 0.5);
        assert!(GainRamp::UNITY.is_constant());
    }

    #[test]
    fn test_cursor_unit_rate_copies_clip() {
        let clip: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let mut cursor = PlaybackCursor::default();
        let mut out = vec![0.0; 4];
        let outcome = cursor.read_block(&clip, 1.0, &mut out);
        assert_eq!(out, vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(outcome.frames, 4);
        assert!(!outcome.ended);
    }

    #[test]
    fn test_cursor_end_without_loop_pads_silence() {
        let clip = vec![1.0; 5];
        let mut cursor = PlaybackCursor::default();
        let mut out = vec![9.0; 8];
        let outcome = cursor.read_block(&clip, 1.0, &mut out);
        assert_eq!(outcome.frames, 5);
        assert!(outcome.ended);
        assert!(out[5..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_cursor_loops_within_region() {
        let clip: Vec<f32> = (0..6).map(|i| i as f32).collect();
        let mut cursor = PlaybackCursor::default();
        cursor.set_looping(true);
        cursor.set_loop_region(2, Some(4));
        let mut out = vec![0.0; 8];
        let outcome = cursor.read_block(&clip, 1.0, &mut out);
        assert_eq!(out, vec![0.0, 1.0, 2.0, 3.0, 2.0, 3.0, 2.0, 3.0]);
        assert_eq!(outcome.loops, 2);
        assert!(!outcome.ended);
    }

    #[test]
    fn test_cursor_ignores_loop_end_when_not_looping() {
        let clip: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let mut cursor = PlaybackCursor::default();
        cursor.set_loop_region(0, Some(4));
        cursor.set_looping(false);

        let mut out = vec![0.0; 4];
        let outcome = cursor.read_block(&clip, 1.0, &mut out);
        assert_eq!(outcome.frames, 4);
        assert!(!outcome.ended);

        let outcome = cursor.read_block(&clip, 1.0, &mut out);
        assert_eq!(out, vec![4.0, 5.0, 6.0, 7.0]);
        assert_eq!(outcome.frames, 4);
        assert!(outcome.ended);
    }

    #[test]
    fn test_cursor_double_rate_skips_frames() {
        let clip: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let mut cursor = PlaybackCursor::default();
        let mut out = vec![0.0; 4];
        cursor.read_block(&clip, 2.0, &mut out);
        assert_eq!(out, vec![0.0, 2.0, 4.0, 6.0]);
        assert_abs_diff_eq!(cursor.position(), 8.0);
    }

    #[test]
    fn test_play_state_audibility() {
        assert!(PlayState::Playing.is_audible());
        assert!(PlayState::FadingOut.is_audible());
        assert!(!PlayState::Paused.is_audible());
        assert!(!PlayState::Stopped.is_audible());
    }
}

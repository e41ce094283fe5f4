use crate::error::{CitySonicError, Result};
use crate::governor::QualityTier;
use std::time::Duration;

/// How spatial sources are rendered to stereo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HrtfMode {
    /// Generate the HRTF table procedurally at init (head shadow + interaural delay).
    Procedural,
    /// Skip the table entirely and use linear stereo panning.
    Disabled,
}

/// Where stream refills run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamIoMode {
    /// A dedicated loader thread services refill requests.
    Threaded,
    /// Refills are serviced only when the caller invokes `CitySonicWorld::pump_stream_io`.
    /// Useful for deterministic tests and for hosts that own their own I/O scheduling.
    Manual,
}

/// Inverse-distance attenuation range, in metres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceModel {
    pub min_distance: f32,
    pub max_distance: f32,
}

impl Default for DistanceModel {
    fn default() -> Self {
        Self {
            min_distance: 1.0,
            max_distance: 1000.0,
        }
    }
}

/// Clamp range for the Doppler pitch multiplier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DopplerRange {
    pub min_pitch: f32,
    pub max_pitch: f32,
}

impl Default for DopplerRange {
    fn default() -> Self {
        Self {
            min_pitch: 0.5,
            max_pitch: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixerDesc {
    /// Hard limiter ceiling applied to every output sample.
    pub saturation_limit: f32,
    /// Per-block multiplier applied to the peak meters before the new block's peak is folded in.
    pub peak_decay: f32,
}

impl Default for MixerDesc {
    fn default() -> Self {
        Self {
            saturation_limit: 0.95,
            peak_decay: 0.95,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReverbDesc {
    /// Length of the shared delay line, in seconds.
    pub max_delay_seconds: f32,
    /// Upper bound applied to zone feedback to keep the network stable.
    pub max_feedback: f32,
    pub max_zones: usize,
}

impl Default for ReverbDesc {
    fn default() -> Self {
        Self {
            max_delay_seconds: 4.0,
            max_feedback: 0.9,
            max_zones: 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamingDesc {
    pub max_streams: usize,
    /// Chunks per stream (3 = triple buffering).
    pub buffer_count: usize,
    /// Frames per chunk.
    pub chunk_frames: usize,
    /// A refill of the next chunk is requested once the playing chunk has fewer unread frames than this.
    pub low_water_frames: usize,
    pub io_mode: StreamIoMode,
}

impl Default for StreamingDesc {
    fn default() -> Self {
        Self {
            max_streams: 16,
            buffer_count: 3,
            chunk_frames: 16384,
            low_water_frames: 8192,
            io_mode: StreamIoMode::Threaded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GovernorDesc {
    /// Smoothed CPU usage above which the tier is lowered.
    pub upper_threshold: f32,
    /// Smoothed CPU usage below which the tier is raised.
    pub lower_threshold: f32,
    /// EMA smoothing factor in (0, 1]; larger reacts faster.
    pub smoothing: f32,
    pub initial_tier: QualityTier,
    pub max_tier: QualityTier,
    /// Blocks to wait after a tier change before another change is allowed.
    pub cooldown_blocks: u32,
}

impl Default for GovernorDesc {
    fn default() -> Self {
        Self {
            upper_threshold: 0.75,
            lower_threshold: 0.5,
            smoothing: 0.1,
            initial_tier: QualityTier::High,
            max_tier: QualityTier::Ultra,
            cooldown_blocks: 32,
        }
    }
}

/// Configuration descriptor for a CitySonic world
#[derive(Debug, Clone)]
pub struct CitySonicWorldDesc {
    /// Rendering sample rate, in Hz
    pub sample_rate: u32,
    /// Frames rendered per mixing pass
    pub block_size: usize,
    /// Output channels presented to the device (the mix itself is stereo)
    pub channels: u16,
    /// Requested ring capacity in frames (rounded up to a power of two)
    pub ring_capacity_frames: usize,
    /// Maximum number of concurrently allocated sources
    pub max_sources: usize,
    pub hrtf_mode: HrtfMode,
    pub distance: DistanceModel,
    pub doppler: DopplerRange,
    /// Interpolation factor advance per block when a source changes HRTF cell
    pub hrtf_ramp_step: f32,
    pub mixer: MixerDesc,
    pub reverb: ReverbDesc,
    pub streaming: StreamingDesc,
    pub governor: GovernorDesc,
}

impl Default for CitySonicWorldDesc {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            block_size: 512,
            channels: 2,
            ring_capacity_frames: 512 * 64,
            max_sources: 256,
            hrtf_mode: HrtfMode::Procedural,
            distance: DistanceModel::default(),
            doppler: DopplerRange::default(),
            hrtf_ramp_step: 0.05,
            mixer: MixerDesc::default(),
            reverb: ReverbDesc::default(),
            streaming: StreamingDesc::default(),
            governor: GovernorDesc::default(),
        }
    }
}

impl CitySonicWorldDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    pub fn ring_capacity_frames(mut self, frames: usize) -> Self {
        self.ring_capacity_frames = frames;
        self
    }

    pub fn max_sources(mut self, max: usize) -> Self {
        self.max_sources = max;
        self
    }

    pub fn hrtf_mode(mut self, mode: HrtfMode) -> Self {
        self.hrtf_mode = mode;
        self
    }

    pub fn distance_range(mut self, min_distance: f32, max_distance: f32) -> Self {
        self.distance = DistanceModel {
            min_distance,
            max_distance,
        };
        self
    }

    pub fn doppler_range(mut self, min_pitch: f32, max_pitch: f32) -> Self {
        self.doppler = DopplerRange {
            min_pitch,
            max_pitch,
        };
        self
    }

    pub fn stream_io_mode(mut self, mode: StreamIoMode) -> Self {
        self.streaming.io_mode = mode;
        self
    }

    pub fn streaming(mut self, streaming: StreamingDesc) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn governor(mut self, governor: GovernorDesc) -> Self {
        self.governor = governor;
        self
    }

    /// Wall-clock time available to render one block.
    pub fn block_budget(&self) -> Duration {
        Duration::from_secs_f64(self.block_size as f64 / self.sample_rate.max(1) as f64)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        fn fail<T>(msg: impl Into<String>) -> Result<T> {
            Err(CitySonicError::Configuration(msg.into()))
        }

        if self.sample_rate == 0 {
            return fail("sample_rate must be greater than 0");
        }
        if self.block_size == 0 {
            return fail("block_size must be greater than 0");
        }
        if self.channels == 0 {
            return fail("channels must be greater than 0");
        }
        if self.ring_capacity_frames <= self.block_size {
            return fail(format!(
                "ring_capacity_frames ({}) must exceed block_size ({})",
                self.ring_capacity_frames, self.block_size
            ));
        }
        if self.max_sources == 0 {
            return fail("max_sources must be greater than 0");
        }
        if !(self.distance.min_distance > 0.0
            && self.distance.max_distance > self.distance.min_distance)
        {
            return fail(format!(
                "distance range {}..{} is invalid",
                self.distance.min_distance, self.distance.max_distance
            ));
        }
        if !(self.doppler.min_pitch > 0.0 && self.doppler.max_pitch >= self.doppler.min_pitch) {
            return fail(format!(
                "doppler range {}..{} is invalid",
                self.doppler.min_pitch, self.doppler.max_pitch
            ));
        }
        if !(self.hrtf_ramp_step > 0.0 && self.hrtf_ramp_step <= 1.0) {
            return fail("hrtf_ramp_step must be in (0, 1]");
        }
        if !(self.mixer.saturation_limit > 0.0) {
            return fail("saturation_limit must be positive");
        }
        if !(0.0..=1.0).contains(&self.mixer.peak_decay) {
            return fail("peak_decay must be in [0, 1]");
        }
        if !(self.reverb.max_delay_seconds > 0.0) || self.reverb.max_zones == 0 {
            return fail("reverb delay line and zone capacity must be non-zero");
        }
        if !(0.0..1.0).contains(&self.reverb.max_feedback) {
            return fail("reverb max_feedback must be in [0, 1)");
        }
        let s = &self.streaming;
        if s.max_streams == 0 {
            return fail("max_streams must be greater than 0");
        }
        if s.buffer_count < 2 {
            return fail("streaming needs at least two buffers per stream");
        }
        if s.chunk_frames == 0 || s.low_water_frames > s.chunk_frames {
            return fail("chunk_frames must be non-zero and no smaller than low_water_frames");
        }
        let g = &self.governor;
        if !(0.0 < g.lower_threshold && g.lower_threshold < g.upper_threshold) {
            return fail("governor thresholds must satisfy 0 < lower < upper");
        }
        if !(g.smoothing > 0.0 && g.smoothing <= 1.0) {
            return fail("governor smoothing must be in (0, 1]");
        }
        if g.initial_tier > g.max_tier {
            return fail("governor initial_tier exceeds max_tier");
        }
        Ok(())
    }
}

//! CPU budget tracking and quality tiers.
//!
//! The governor smooths per-block render time into a CPU-usage estimate and steps a
//! discrete [`QualityTier`] down when the estimate stays above the upper threshold,
//! and back up when it stays below the lower one. Applying a tier is the renderer's
//! job; the parts that cross into the device layer go through [`FormatNegotiator`].

use crate::config::GovernorDesc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QualityTier {
    Low,
    Medium,
    High,
    Ultra,
}

/// Settings bundled by a quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierSettings {
    pub sample_rate: u32,
    /// Sources rendered per block; further audible sources are virtualized.
    pub max_sources: usize,
    pub hrtf: bool,
    pub reverb: bool,
    pub buffer_frames: usize,
}

impl QualityTier {
    pub const ALL: [QualityTier; 4] = [Self::Low, Self::Medium, Self::High, Self::Ultra];

    pub fn settings(self) -> TierSettings {
        match self {
            Self::Low => TierSettings {
                sample_rate: 22050,
                max_sources: 32,
                hrtf: false,
                reverb: false,
                buffer_frames: 1024,
            },
            Self::Medium => TierSettings {
                sample_rate: 44100,
                max_sources: 96,
                hrtf: false,
                reverb: true,
                buffer_frames: 512,
            },
            Self::High => TierSettings {
                sample_rate: 48000,
                max_sources: 192,
                hrtf: true,
                reverb: true,
                buffer_frames: 512,
            },
            Self::Ultra => TierSettings {
                sample_rate: 48000,
                max_sources: 256,
                hrtf: true,
                reverb: true,
                buffer_frames: 256,
            },
        }
    }

    pub fn lower(self) -> Option<Self> {
        match self {
            Self::Low => None,
            Self::Medium => Some(Self::Low),
            Self::High => Some(Self::Medium),
            Self::Ultra => Some(Self::High),
        }
    }

    pub fn higher(self) -> Option<Self> {
        match self {
            Self::Low => Some(Self::Medium),
            Self::Medium => Some(Self::High),
            Self::High => Some(Self::Ultra),
            Self::Ultra => None,
        }
    }

    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Low,
            1 => Self::Medium,
            2 => Self::High,
            _ => Self::Ultra,
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Ultra => "ultra",
        };
        f.write_str(name)
    }
}

/// Device-side half of a tier change.
///
/// Called from the mixing task when the tier changes. Implementations must not block;
/// they typically record the request and let the device layer pick it up.
pub trait FormatNegotiator: Send + Sync {
    fn request_format(&self, sample_rate: u32, buffer_frames: usize);
}

/// Tier controller driven by block timings.
#[derive(Debug)]
pub struct PerformanceGovernor {
    desc: GovernorDesc,
    tier: QualityTier,
    smoothed: f32,
    primed: bool,
    peak: f32,
    overloads: u64,
    cooldown: u32,
}

impl PerformanceGovernor {
    pub fn new(desc: &GovernorDesc) -> Self {
        let tier = desc.initial_tier.min(desc.max_tier);
        Self {
            desc: *desc,
            tier,
            smoothed: 0.0,
            primed: false,
            peak: 0.0,
            overloads: 0,
            cooldown: 0,
        }
    }

    pub fn tier(&self) -> QualityTier {
        self.tier
    }

    /// Smoothed CPU usage (render time / real-time budget).
    pub fn smoothed_usage(&self) -> f32 {
        self.smoothed
    }

    /// Highest single-block usage observed.
    pub fn peak_usage(&self) -> f32 {
        self.peak
    }

    /// Blocks that took longer than their real-time budget.
    pub fn overloads(&self) -> u64 {
        self.overloads
    }

    /// Fold one block's render time into the estimate. Returns the new tier when it
    /// changes.
    pub fn observe(&mut self, elapsed: Duration, budget: Duration) -> Option<QualityTier> {
        if budget.is_zero() {
            return None;
        }
        let usage = elapsed.as_secs_f32() / budget.as_secs_f32();
        self.peak = self.peak.max(usage);
        if usage > 1.0 {
            self.overloads += 1;
        }
        if self.primed {
            self.smoothed += self.desc.smoothing * (usage - self.smoothed);
        } else {
            // Seed with the first block so start-up does not read as idle.
            self.smoothed = usage;
            self.primed = true;
        }

        if self.cooldown > 0 {
            self.cooldown -= 1;
            return None;
        }

        let next = if self.smoothed > self.desc.upper_threshold {
            self.tier.lower()
        } else if self.smoothed < self.desc.lower_threshold {
            self.tier.higher().filter(|t| *t <= self.desc.max_tier)
        } else {
            None
        }?;

        let old = self.tier;
        self.tier = next;
        self.cooldown = self.desc.cooldown_blocks;
        if next < old {
            log::warn!(
                "Audio CPU usage {:.0}% over budget threshold, quality {} -> {}",
                self.smoothed * 100.0,
                old,
                next
            );
        } else {
            log::info!(
                "Audio CPU usage {:.0}%, raising quality {} -> {}",
                self.smoothed * 100.0,
                old,
                next
            );
        }
        Some(next)
    }
}

/// Counters shared between the mixing task and game code.
#[derive(Debug)]
pub struct PerformanceCounters {
    frames_processed: AtomicU64,
    blocks_rendered: AtomicU64,
    cpu_overloads: AtomicU64,
    peak_cpu: AtomicU32,
    active_sources: AtomicUsize,
    quality_tier: AtomicU8,
}

impl PerformanceCounters {
    pub fn new(tier: QualityTier) -> Self {
        Self {
            frames_processed: AtomicU64::new(0),
            blocks_rendered: AtomicU64::new(0),
            cpu_overloads: AtomicU64::new(0),
            peak_cpu: AtomicU32::new(0f32.to_bits()),
            active_sources: AtomicUsize::new(0),
            quality_tier: AtomicU8::new(tier.to_u8()),
        }
    }

    pub(crate) fn record_block(
        &self,
        frames: usize,
        active_sources: usize,
        governor: &PerformanceGovernor,
    ) {
        self.frames_processed
            .fetch_add(frames as u64, Ordering::Relaxed);
        self.blocks_rendered.fetch_add(1, Ordering::Relaxed);
        self.cpu_overloads
            .store(governor.overloads(), Ordering::Relaxed);
        self.peak_cpu
            .store(governor.peak_usage().to_bits(), Ordering::Relaxed);
        self.active_sources.store(active_sources, Ordering::Relaxed);
        self.quality_tier
            .store(governor.tier().to_u8(), Ordering::Relaxed);
    }

    pub fn active_sources(&self) -> usize {
        self.active_sources.load(Ordering::Relaxed)
    }

    pub fn quality_tier(&self) -> QualityTier {
        QualityTier::from_u8(self.quality_tier.load(Ordering::Relaxed))
    }

    /// Snapshot combined with the ring's underrun count.
    pub fn snapshot(&self, underruns: u64) -> PerformanceStats {
        PerformanceStats {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            underruns,
            peak_cpu: f32::from_bits(self.peak_cpu.load(Ordering::Relaxed)),
            cpu_overloads: self.cpu_overloads.load(Ordering::Relaxed),
            blocks_rendered: self.blocks_rendered.load(Ordering::Relaxed),
            active_sources: self.active_sources(),
            quality_tier: self.quality_tier(),
        }
    }
}

/// Point-in-time performance summary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceStats {
    pub frames_processed: u64,
    /// Short reads by the device callback.
    pub underruns: u64,
    /// Highest block render time as a fraction of the block's real-time duration.
    pub peak_cpu: f32,
    pub cpu_overloads: u64,
    pub blocks_rendered: u64,
    pub active_sources: usize,
    pub quality_tier: QualityTier,
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUDGET: Duration = Duration::from_millis(10);

    fn governor(cooldown_blocks: u32) -> PerformanceGovernor {
        PerformanceGovernor::new(&GovernorDesc {
            smoothing: 0.5,
            cooldown_blocks,
            ..GovernorDesc::default()
        })
    }

    #[test]
    fn test_tier_ordering() {
        assert!(QualityTier::Low < QualityTier::Medium);
        assert!(QualityTier::High < QualityTier::Ultra);
        assert_eq!(QualityTier::Low.lower(), None);
        assert_eq!(QualityTier::Ultra.higher(), None);
        for tier in QualityTier::ALL {
            assert_eq!(QualityTier::from_u8(tier.to_u8()), tier);
        }
        assert!(!QualityTier::Low.settings().hrtf);
        assert!(QualityTier::Ultra.settings().max_sources > QualityTier::Low.settings().max_sources);
    }

    #[test]
    fn test_overload_lowers_tier() {
        let mut gov = governor(0);
        assert_eq!(gov.tier(), QualityTier::High);
        let mut changes = Vec::new();
        for _ in 0..10 {
            if let Some(tier) = gov.observe(Duration::from_millis(12), BUDGET) {
                changes.push(tier);
            }
        }
        assert_eq!(changes.first(), Some(&QualityTier::Medium));
        assert_eq!(gov.tier(), QualityTier::Low);
        assert_eq!(gov.overloads(), 10);
        assert!((gov.peak_usage() - 1.2).abs() < 1e-4);
    }

    #[test]
    fn test_idle_raises_tier_up_to_ceiling() {
        let mut gov = PerformanceGovernor::new(&GovernorDesc {
            smoothing: 1.0,
            cooldown_blocks: 0,
            initial_tier: QualityTier::Low,
            max_tier: QualityTier::High,
            ..GovernorDesc::default()
        });
        for _ in 0..10 {
            gov.observe(Duration::from_millis(1), BUDGET);
        }
        assert_eq!(gov.tier(), QualityTier::High);
    }

    #[test]
    fn test_hysteresis_band_holds_tier() {
        let mut gov = governor(0);
        for _ in 0..50 {
            assert_eq!(gov.observe(Duration::from_micros(6_200), BUDGET), None);
        }
        assert_eq!(gov.tier(), QualityTier::High);
    }

    #[test]
    fn test_cooldown_spaces_out_changes() {
        let mut gov = governor(5);
        let mut change_blocks = Vec::new();
        for block in 0..20 {
            if gov.observe(Duration::from_millis(20), BUDGET).is_some() {
                change_blocks.push(block);
            }
        }
        assert_eq!(change_blocks.len(), 2);
        assert!(change_blocks[1] - change_blocks[0] > 5);
    }

    #[test]
    fn test_counters_snapshot() {
        let gov = governor(0);
        let counters = PerformanceCounters::new(gov.tier());
        counters.record_block(512, 7, &gov);
        counters.record_block(512, 3, &gov);
        let stats = counters.snapshot(4);
        assert_eq!(stats.frames_processed, 1024);
        assert_eq!(stats.blocks_rendered, 2);
        assert_eq!(stats.active_sources, 3);
        assert_eq!(stats.underruns, 4);
        assert_eq!(stats.quality_tier, QualityTier::High);
    }
}

//! Event types for CitySonic

use crate::governor::QualityTier;
use crate::registry::SourceId;
use crate::streaming::{StreamId, StreamState};

#[derive(Debug, Clone, PartialEq)]
pub enum CitySonicEvent {
    /// A non-looping source reached the end of its clip and was released.
    SourceCompleted {
        source_id: SourceId,
    },
    SourceLooped {
        source_id: SourceId,
        loop_count: u32,
    },
    /// A fade-out finished and the source stopped.
    SourceFadedOut {
        source_id: SourceId,
    },
    StreamStateChanged {
        stream_id: StreamId,
        old_state: StreamState,
        new_state: StreamState,
    },
    StreamFinished {
        stream_id: StreamId,
    },
    StreamLooped {
        stream_id: StreamId,
    },
    /// A playing stream ran out of buffered audio and rendered silence.
    StreamStarved {
        stream_id: StreamId,
        missing_frames: usize,
    },
    StreamIoError {
        stream_id: StreamId,
        error: String,
    },
    CrossfadeCompleted {
        from: StreamId,
        to: StreamId,
    },
    QualityTierChanged {
        old_tier: QualityTier,
        new_tier: QualityTier,
    },
    EngineStarted,
    EngineStopped,
    EngineError {
        error: String,
    },
}

impl CitySonicEvent {
    pub fn source_id(&self) -> Option<SourceId> {
        match self {
            Self::SourceCompleted { source_id }
            | Self::SourceLooped { source_id, .. }
            | Self::SourceFadedOut { source_id } => Some(*source_id),
            _ => None,
        }
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Self::StreamStateChanged { stream_id, .. }
            | Self::StreamFinished { stream_id }
            | Self::StreamLooped { stream_id }
            | Self::StreamStarved { stream_id, .. }
            | Self::StreamIoError { stream_id, .. } => Some(*stream_id),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::StreamStarved { .. } | Self::StreamIoError { .. } | Self::EngineError { .. }
        )
    }

    pub fn is_source_event(&self) -> bool {
        self.source_id().is_some()
    }
}

/// Timing of one rendered block, for profiling displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderTimingEvent {
    pub block_index: u64,
    pub frames: usize,
    pub streaming_time_us: u64,
    pub spatial_time_us: u64,
    pub mixing_time_us: u64,
    pub reverb_time_us: u64,
    pub total_time_us: u64,
    /// Real-time duration of the block at the world sample rate.
    pub budget_us: u64,
}

impl RenderTimingEvent {
    /// Fraction of the block's real-time budget spent rendering it.
    pub fn utilization(&self) -> f32 {
        if self.budget_us == 0 {
            0.0
        } else {
            self.total_time_us as f32 / self.budget_us as f32
        }
    }
}

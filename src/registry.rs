//! Fixed-capacity pool of audio sources.

use crate::audio_data::CitySonicAudioData;
use crate::error::{CitySonicError, Result};
use crate::math::Vec3;
use crate::playback::{FadeEnvelope, PlayState, PlaybackCursor};
use crate::slots::{SlotHandle, SlotPool};
use crate::spatial::SourceSpatialState;

/// Lightweight, type-safe handle for audio sources.
///
/// Returned by `create_source`. A handle stays valid until its source is released;
/// after that every call made with it reports `InvalidHandle`, even if the slot has
/// since been reused for another sound.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceId(pub(crate) SlotHandle);

impl SourceId {
    pub fn index(&self) -> usize {
        self.0.index()
    }

    pub fn generation(&self) -> u32 {
        self.0.generation()
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SourceId({})", self.0)
    }
}

/// What a source represents in the game world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceType {
    /// Background beds (city hum, weather). Rendered around the listener, panned by `pan`.
    Ambient,
    Entity,
    Vehicle,
    Building,
    Environment,
    /// Interface sounds. Rendered without spatialization, panned by `pan`.
    Ui,
}

impl SourceType {
    pub fn is_spatial(&self) -> bool {
        !matches!(self, Self::Ambient | Self::Ui)
    }
}

/// One playable sound instance.
#[derive(Debug)]
pub struct AudioSource {
    pub(crate) source_type: SourceType,
    pub(crate) state: PlayState,
    pub(crate) position: Vec3,
    pub(crate) velocity: Vec3,
    pub(crate) volume: f32,
    pub(crate) pitch: f32,
    /// -1 = hard left, 1 = hard right. Only used by non-spatial sources.
    pub(crate) pan: f32,
    pub(crate) clip: Option<CitySonicAudioData>,
    pub(crate) cursor: PlaybackCursor,
    pub(crate) fade: FadeEnvelope,
    pub(crate) spatial: SourceSpatialState,
    /// Set by the renderer when the source was skipped to honour the active-source cap.
    pub(crate) virtualized: bool,
}

impl AudioSource {
    fn new() -> Result<Self> {
        Ok(Self {
            source_type: SourceType::Ambient,
            state: PlayState::Stopped,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            volume: 1.0,
            pitch: 1.0,
            pan: 0.0,
            clip: None,
            cursor: PlaybackCursor::default(),
            fade: FadeEnvelope::default(),
            spatial: SourceSpatialState::new()?,
            virtualized: false,
        })
    }

    /// Return to the pristine state, keeping the delay-line allocation.
    fn reset(&mut self, source_type: SourceType) {
        self.source_type = source_type;
        self.state = PlayState::Stopped;
        self.position = Vec3::ZERO;
        self.velocity = Vec3::ZERO;
        self.volume = 1.0;
        self.pitch = 1.0;
        self.pan = 0.0;
        self.clip = None;
        self.cursor = PlaybackCursor::default();
        self.fade = FadeEnvelope::default();
        self.spatial.reset();
        self.virtualized = false;
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn state(&self) -> PlayState {
        self.state
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn velocity(&self) -> Vec3 {
        self.velocity
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn pitch(&self) -> f32 {
        self.pitch
    }

    pub fn pan(&self) -> f32 {
        self.pan
    }

    pub fn looping(&self) -> bool {
        self.cursor.looping()
    }

    pub fn has_clip(&self) -> bool {
        self.clip.is_some()
    }

    pub fn spatial_state(&self) -> &SourceSpatialState {
        &self.spatial
    }

    pub fn is_virtualized(&self) -> bool {
        self.virtualized
    }
}

/// Generational arena of [`AudioSource`] records.
///
/// Structural changes (create/destroy) happen under the world's registry lock, which
/// the mixing task also holds for the duration of a block, so a slot can never be
/// recycled while a block is reading it.
#[derive(Debug)]
pub struct SourceRegistry {
    pool: SlotPool<AudioSource>,
    active_limit: usize,
}

impl SourceRegistry {
    pub fn new(capacity: usize) -> Result<Self> {
        let pool = SlotPool::with_capacity(capacity, AudioSource::new)?;
        log::debug!("Source registry ready ({} slots)", capacity);
        Ok(Self {
            pool,
            active_limit: capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Allocated sources, whatever their play state.
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Allocate a stopped source of the given type.
    ///
    /// # Errors
    ///
    /// Returns `Exhausted` when every slot is in use.
    pub fn create(&mut self, source_type: SourceType) -> Result<SourceId> {
        let capacity = self.pool.capacity();
        let (handle, source) = self.pool.allocate().ok_or(CitySonicError::Exhausted {
            pool: "source",
            capacity,
        })?;
        source.reset(source_type);
        log::debug!("Created {:?} source {}", source_type, handle);
        Ok(SourceId(handle))
    }

    /// Stop the source, drop its clip reference and return the slot to the pool.
    pub fn destroy(&mut self, id: SourceId) -> Result<()> {
        let source = self
            .pool
            .release(id.0)
            .ok_or_else(|| CitySonicError::InvalidHandle(id.to_string()))?;
        source.state = PlayState::Stopped;
        source.clip = None;
        log::debug!("Released {}", id);
        Ok(())
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.pool.contains(id.0)
    }

    pub fn get(&self, id: SourceId) -> Result<&AudioSource> {
        self.pool
            .get(id.0)
            .ok_or_else(|| CitySonicError::InvalidHandle(id.to_string()))
    }

    pub fn get_mut(&mut self, id: SourceId) -> Result<&mut AudioSource> {
        self.pool
            .get_mut(id.0)
            .ok_or_else(|| CitySonicError::InvalidHandle(id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (SourceId, &AudioSource)> {
        self.pool.iter().map(|(h, s)| (SourceId(h), s))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SourceId, &mut AudioSource)> {
        self.pool.iter_mut().map(|(h, s)| (SourceId(h), s))
    }

    /// Sources currently contributing audio.
    pub fn audible_count(&self) -> usize {
        self.iter().filter(|(_, s)| s.state.is_audible()).count()
    }

    /// Cap on how many sources are rendered per block. Extra audible sources keep
    /// advancing but are not mixed.
    pub fn set_active_limit(&mut self, limit: usize) {
        self.active_limit = limit.clamp(1, self.pool.capacity());
    }

    pub fn active_limit(&self) -> usize {
        self.active_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_until_exhausted() {
        let mut registry = SourceRegistry::new(2).unwrap();
        registry.create(SourceType::Vehicle).unwrap();
        registry.create(SourceType::Ui).unwrap();
        let err = registry.create(SourceType::Ambient).unwrap_err();
        assert!(matches!(
            err,
            CitySonicError::Exhausted {
                pool: "source",
                capacity: 2
            }
        ));
    }

    #[test]
    fn test_new_source_is_stopped_and_typed() {
        let mut registry = SourceRegistry::new(4).unwrap();
        let id = registry.create(SourceType::Building).unwrap();
        let source = registry.get(id).unwrap();
        assert_eq!(source.state(), PlayState::Stopped);
        assert_eq!(source.source_type(), SourceType::Building);
        assert!(!source.has_clip());
    }

    #[test]
    fn test_destroy_clears_clip_and_invalidates_handle() {
        let mut registry = SourceRegistry::new(1).unwrap();
        let id = registry.create(SourceType::Entity).unwrap();
        let clip = CitySonicAudioData::from_samples(vec![0.0; 16], 48000, 1).unwrap();
        {
            let source = registry.get_mut(id).unwrap();
            source.clip = Some(clip.clone());
            source.state = PlayState::Playing;
        }
        registry.destroy(id).unwrap();
        assert!(registry.get(id).is_err());
        assert!(matches!(
            registry.destroy(id),
            Err(CitySonicError::InvalidHandle(_))
        ));

        let reused = registry.create(SourceType::Entity).unwrap();
        assert_eq!(reused.index(), id.index());
        let source = registry.get(reused).unwrap();
        assert!(!source.has_clip());
        assert_eq!(source.state(), PlayState::Stopped);
    }

    #[test]
    fn test_active_limit_clamped() {
        let mut registry = SourceRegistry::new(8).unwrap();
        registry.set_active_limit(100);
        assert_eq!(registry.active_limit(), 8);
        registry.set_active_limit(0);
        assert_eq!(registry.active_limit(), 1);
    }

    #[test]
    fn test_ui_sources_are_not_spatial() {
        assert!(!SourceType::Ui.is_spatial());
        assert!(!SourceType::Ambient.is_spatial());
        assert!(SourceType::Vehicle.is_spatial());
    }
}

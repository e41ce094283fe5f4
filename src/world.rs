use crate::audio_data::{CitySonicAudioData, Downmix, LoadOptions, load_audio_file};
use crate::config::{CitySonicWorldDesc, StreamIoMode};
use crate::error::{CitySonicError, Result, lock};
use crate::events::{CitySonicEvent, RenderTimingEvent};
use crate::governor::{PerformanceStats, QualityTier};
use crate::math::{Pose, Vec3};
use crate::mixer::PeakLevels;
use crate::playback::{FadeEnvelope, PlayState};
use crate::registry::{AudioSource, SourceId, SourceRegistry, SourceType};
use crate::renderer::{AudioRenderer, SharedState};
use crate::reverb::{ReverbZone, ZoneId};
use crate::ring::{FrameConsumer, RingMonitor};
use crate::scene::OcclusionQuery;
use crate::spatial::Listener;
use crate::streaming::{
    LoaderThread, StreamFormat, StreamId, StreamLoader, StreamReader, StreamState,
    StreamingLayer,
};
use crossbeam_channel::{Receiver, Sender};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};

/// Main world object that manages 3D audio sources, streams and the listener.
///
/// `CitySonicWorld` is the central API for CitySonic. It is owned by the game thread
/// and replaces any notion of a global audio system: everything the engine knows
/// lives here and is torn down when the world is dropped.
///
/// # Architecture
///
/// - **Game thread**: owns the `CitySonicWorld`, creates and moves sources, drives
///   streams, polls events
/// - **Mixing task**: renders blocks into the output ring. Either a
///   [`CitySonicEngine`](crate::CitySonicEngine) thread, or the caller through
///   [`render_block`](Self::render_block)
/// - **Device callback**: drains the ring. Never touches the world
/// - **Stream I/O thread**: refills stream chunks off the real-time path (or
///   [`pump_stream_io`](Self::pump_stream_io) in [`StreamIoMode::Manual`])
///
/// Every world call takes at most one short lock, so it can only ever wait for the
/// part of a block that touches the same state.
pub struct CitySonicWorld {
    desc: CitySonicWorldDesc,
    shared: Arc<SharedState>,
    renderer: Option<AudioRenderer>,
    output: Option<FrameConsumer>,
    ring: RingMonitor,
    loader: Option<StreamLoader>,
    _loader_thread: Option<LoaderThread>,
    event_sender: Sender<CitySonicEvent>,
    event_receiver: Receiver<CitySonicEvent>,
    timing_receiver: Receiver<RenderTimingEvent>,
    hrtf_available: bool,
}

impl CitySonicWorld {
    /// Create a world and allocate every buffer it will ever use.
    ///
    /// The global outdoor reverb zone is registered as zone 0.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if `desc` fails validation and `AllocationFailure` if
    /// any init-time buffer cannot be reserved. Nothing is left running on failure.
    pub fn new(desc: CitySonicWorldDesc) -> Result<Self> {
        desc.validate()?;
        let parts = AudioRenderer::build(&desc)?;
        let ring = parts.output.monitor();

        let (loader, loader_thread) = match desc.streaming.io_mode {
            StreamIoMode::Threaded => (None, Some(parts.loader.spawn()?)),
            StreamIoMode::Manual => (Some(parts.loader), None),
        };

        if !parts.hrtf_available {
            log::warn!("HRTF unavailable, spatial sources use stereo panning");
        }
        log::info!(
            "CitySonic world created: {} Hz, block {}, {} sources, {} streams",
            desc.sample_rate,
            desc.block_size,
            desc.max_sources,
            desc.streaming.max_streams
        );

        Ok(Self {
            desc,
            shared: parts.shared,
            renderer: Some(parts.renderer),
            output: Some(parts.output),
            ring,
            loader,
            _loader_thread: loader_thread,
            event_sender: parts.event_sender,
            event_receiver: parts.events,
            timing_receiver: parts.timing,
            hrtf_available: parts.hrtf_available,
        })
    }

    /// Tear the world down. Equivalent to dropping it, with a log line.
    pub fn shutdown(self) {
        log::info!(
            "CitySonic world shut down after {} frames",
            self.get_performance_stats().frames_processed
        );
    }

    /// Returns the sample rate of the audio world.
    pub fn sample_rate(&self) -> u32 {
        self.desc.sample_rate
    }

    pub fn desc(&self) -> &CitySonicWorldDesc {
        &self.desc
    }

    fn registry(&self) -> Result<MutexGuard<'_, SourceRegistry>> {
        lock(&self.shared.registry, "source registry")
    }

    fn streaming(&self) -> Result<MutexGuard<'_, StreamingLayer>> {
        lock(&self.shared.streaming, "streaming layer")
    }

    fn listener(&self) -> Result<MutexGuard<'_, Listener>> {
        lock(&self.shared.listener, "listener")
    }

    /// Run `f` on a live source. Stale handles are logged and reported as
    /// `InvalidHandle`.
    fn with_source<R>(&self, id: SourceId, f: impl FnOnce(&mut AudioSource) -> R) -> Result<R> {
        let mut registry = self.registry()?;
        let source = registry
            .get_mut(id)
            .inspect_err(|e| log::warn!("Ignoring call on stale source: {}", e))?;
        Ok(f(source))
    }

    fn with_stream<R>(
        &self,
        id: StreamId,
        f: impl FnOnce(&mut StreamingLayer) -> Result<R>,
    ) -> Result<R> {
        let mut streaming = self.streaming()?;
        f(&mut streaming).inspect_err(|e| {
            if matches!(e, CitySonicError::InvalidHandle(_)) {
                log::warn!("Ignoring call on stale stream {}", id);
            }
        })
    }

    // ---------------------------------------------------------------- sources

    /// Allocates a stopped source of the given type.
    ///
    /// # Errors
    ///
    /// Returns `Exhausted` when every source slot is in use. The caller may retry
    /// later or drop the sound.
    pub fn create_source(&self, source_type: SourceType) -> Result<SourceId> {
        self.registry()?.create(source_type)
    }

    /// Stops a source and returns its slot to the pool. The handle becomes stale.
    pub fn release_source(&self, id: SourceId) -> Result<()> {
        self.registry()?
            .destroy(id)
            .inspect_err(|e| log::warn!("Ignoring release of stale source: {}", e))
    }

    /// Converts a clip to the layout sources render from: mono at the world rate.
    ///
    /// Clips passed to the `play_*` helpers are prepared on every call; preparing a
    /// frequently used clip once up front avoids repeated resampling.
    pub fn prepare_clip(&self, clip: &CitySonicAudioData) -> Result<CitySonicAudioData> {
        clip.prepared_for(self.desc.sample_rate)
    }

    /// Attaches a clip to a source and rewinds it.
    ///
    /// # Arguments
    ///
    /// * `id` - Source to attach to
    /// * `clip` - Any format; converted with [`prepare_clip`](Self::prepare_clip)
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` for stale ids, or a resampling error.
    pub fn set_source_clip(&self, id: SourceId, clip: &CitySonicAudioData) -> Result<()> {
        let prepared = self.prepare_clip(clip)?;
        self.with_source(id, |source| {
            source.clip = Some(prepared);
            source.cursor.rewind();
        })
    }

    /// Decodes an audio file and attaches it to a source.
    ///
    /// # Errors
    ///
    /// Returns `Io` or `AudioLoading` when the file cannot be read or decoded. The
    /// source keeps its previous clip in that case.
    pub fn load_source_file(&self, id: SourceId, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if !self.registry()?.contains(id) {
            log::warn!("Ignoring load into stale source {}", id);
            return Err(CitySonicError::InvalidHandle(id.to_string()));
        }
        let options = LoadOptions::new()
            .target_sample_rate(self.desc.sample_rate)
            .downmix(Downmix::Average);
        let clip = load_audio_file(path, &options)
            .inspect_err(|e| log::error!("Failed to load {}: {}", path.display(), e))?;
        log::debug!(
            "Loaded {} into {} ({:.2}s)",
            path.display(),
            id,
            clip.duration().as_secs_f32()
        );
        self.set_source_clip(id, &clip)
    }

    /// Stops a source and drops its clip. The source itself stays allocated.
    pub fn unload_source(&self, id: SourceId) -> Result<()> {
        self.with_source(id, |source| {
            source.state = PlayState::Stopped;
            source.clip = None;
            source.cursor.rewind();
            source.fade = FadeEnvelope::default();
        })
    }

    pub fn set_source_position(&self, id: SourceId, position: Vec3) -> Result<()> {
        self.with_source(id, |source| source.position = position)
    }

    pub fn set_source_velocity(&self, id: SourceId, velocity: Vec3) -> Result<()> {
        self.with_source(id, |source| source.velocity = velocity)
    }

    /// Per-frame update for moving entities.
    pub fn update_entity_position(&self, id: SourceId, position: Vec3, velocity: Vec3) -> Result<()> {
        self.with_source(id, |source| {
            source.position = position;
            source.velocity = velocity;
        })
    }

    /// Starts playing a source.
    ///
    /// A stopped source starts from its cursor (the start after [`stop`](Self::stop));
    /// a paused source resumes; a fading-out source returns to full volume.
    ///
    /// # Errors
    ///
    /// Returns `NotReady` if the source has no clip attached, `InvalidHandle` for
    /// stale ids.
    pub fn play(&self, id: SourceId) -> Result<()> {
        self.with_source(id, |source| {
            match source.state {
                PlayState::Playing | PlayState::FadingIn => return Ok(()),
                PlayState::Paused => {
                    source.state = resumed_state(&source.fade);
                    return Ok(());
                }
                PlayState::FadingOut | PlayState::Stopped => {}
            }
            if source.clip.is_none() {
                return Err(CitySonicError::NotReady(format!("{} has no clip", id)));
            }
            source.fade = FadeEnvelope::settled(1.0);
            source.state = PlayState::Playing;
            Ok(())
        })?
    }

    /// Stops a source and rewinds it.
    ///
    /// The source stays allocated and keeps its clip so it can be played again with
    /// [`play`](Self::play). Only a free slot is guaranteed to hold no sample buffer:
    /// call [`release_source`](Self::release_source) or
    /// [`unload_source`](Self::unload_source) to drop the clip.
    pub fn stop(&self, id: SourceId) -> Result<()> {
        self.with_source(id, stop_source)
    }

    /// Stops every source.
    pub fn stop_all(&self) -> Result<()> {
        let mut registry = self.registry()?;
        for (_, source) in registry.iter_mut() {
            stop_source(source);
        }
        Ok(())
    }

    /// Pauses a playing source, keeping its position and any fade in progress.
    pub fn pause(&self, id: SourceId) -> Result<()> {
        self.with_source(id, |source| {
            if source.state.is_audible() {
                source.state = PlayState::Paused;
            }
        })
    }

    pub fn resume(&self, id: SourceId) -> Result<()> {
        self.with_source(id, |source| {
            if source.state == PlayState::Paused {
                source.state = resumed_state(&source.fade);
            }
        })
    }

    /// Sets the source volume. Negative values are clamped to 0.
    pub fn set_volume(&self, id: SourceId, volume: f32) -> Result<()> {
        self.with_source(id, |source| source.volume = volume.max(0.0))
    }

    /// Sets the playback rate multiplier. Doppler is applied on top.
    pub fn set_pitch(&self, id: SourceId, pitch: f32) -> Result<()> {
        self.with_source(id, |source| source.pitch = pitch.max(0.0))
    }

    pub fn set_looping(&self, id: SourceId, looping: bool) -> Result<()> {
        self.with_source(id, |source| source.cursor.set_looping(looping))
    }

    /// Sets the stereo position of a non-spatial (UI or ambient) source, -1 to 1.
    pub fn set_pan(&self, id: SourceId, pan: f32) -> Result<()> {
        self.with_source(id, |source| source.pan = pan.clamp(-1.0, 1.0))
    }

    /// Restricts looping to `[start, end)` frames of the clip; `None` loops to the end.
    pub fn set_loop_region(&self, id: SourceId, start: usize, end: Option<usize>) -> Result<()> {
        self.with_source(id, |source| source.cursor.set_loop_region(start, end))
    }

    /// Starts (or continues) playback while ramping the volume up to full.
    ///
    /// # Arguments
    ///
    /// * `id` - Source to fade in
    /// * `duration_frames` - Length of the ramp in output frames
    ///
    /// # Errors
    ///
    /// Returns `NotReady` if the source has no clip attached.
    pub fn fade_in(&self, id: SourceId, duration_frames: u64) -> Result<()> {
        self.with_source(id, |source| {
            if source.clip.is_none() {
                return Err(CitySonicError::NotReady(format!("{} has no clip", id)));
            }
            if source.state == PlayState::Stopped {
                source.fade = FadeEnvelope::settled(0.0);
            }
            source.fade.retarget(1.0, duration_frames);
            source.state = PlayState::FadingIn;
            Ok(())
        })?
    }

    /// Ramps the volume down to silence, then stops and rewinds the source.
    ///
    /// [`CitySonicEvent::SourceFadedOut`] is emitted when the ramp completes. A paused
    /// source is stopped immediately.
    pub fn fade_out(&self, id: SourceId, duration_frames: u64) -> Result<()> {
        self.with_source(id, |source| match source.state {
            PlayState::Stopped => {}
            PlayState::Paused => stop_source(source),
            _ => {
                source.fade.retarget(0.0, duration_frames);
                source.state = PlayState::FadingOut;
            }
        })
    }

    fn start_source(
        &self,
        source_type: SourceType,
        clip: &CitySonicAudioData,
        volume: f32,
        setup: impl FnOnce(&mut AudioSource),
    ) -> Result<SourceId> {
        let prepared = self.prepare_clip(clip)?;
        let mut registry = self.registry()?;
        let id = registry.create(source_type)?;
        let source = registry.get_mut(id)?;
        source.clip = Some(prepared);
        source.volume = volume.max(0.0);
        setup(source);
        source.state = PlayState::Playing;
        Ok(id)
    }

    /// Plays a positioned one-shot. The source releases itself when the clip ends.
    pub fn play_sound_at_position(
        &self,
        clip: &CitySonicAudioData,
        position: Vec3,
        volume: f32,
    ) -> Result<SourceId> {
        self.start_source(SourceType::Entity, clip, volume, |source| {
            source.position = position
        })
    }

    /// Plays a non-positional interface sound. The source releases itself when the
    /// clip ends.
    pub fn play_ui_sound(&self, clip: &CitySonicAudioData, volume: f32) -> Result<SourceId> {
        self.start_source(SourceType::Ui, clip, volume, |_| {})
    }

    /// Starts a looping ambient bed around the listener. Keep the id to stop it.
    pub fn start_ambient_loop(&self, clip: &CitySonicAudioData, volume: f32) -> Result<SourceId> {
        self.start_source(SourceType::Ambient, clip, volume, |source| {
            source.cursor.set_looping(true)
        })
    }

    /// State of a source, or `InvalidHandle`.
    pub fn source_state(&self, id: SourceId) -> Result<PlayState> {
        Ok(self.registry()?.get(id)?.state())
    }

    /// Latest spatial parameters computed for a source (distance, angles, gains).
    pub fn source_spatial_params(&self, id: SourceId) -> Result<crate::spatial::SpatialParams> {
        Ok(*self.registry()?.get(id)?.spatial_state().params())
    }

    // --------------------------------------------------------------- listener

    /// Sets the listener position and orientation. `right` is derived from
    /// `forward × up`.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when `forward` and `up` are zero or parallel; the
    /// listener keeps its previous pose.
    pub fn set_listener(&self, position: Vec3, forward: Vec3, up: Vec3) -> Result<()> {
        self.listener()?.set_orientation(position, forward, up)
    }

    pub fn set_listener_pose(&self, pose: Pose) -> Result<()> {
        self.listener()?.set_pose(pose);
        Ok(())
    }

    pub fn set_listener_velocity(&self, velocity: Vec3) -> Result<()> {
        self.listener()?.velocity = velocity;
        Ok(())
    }

    /// Returns a copy of the listener state.
    pub fn listener_state(&self) -> Result<Listener> {
        Ok(*self.listener()?)
    }

    /// Sets the gain applied to the whole mix, clamped to [0, 1].
    pub fn set_master_volume(&self, volume: f32) -> Result<()> {
        self.listener()?.master_volume = volume.clamp(0.0, 1.0);
        Ok(())
    }

    /// Sets the scale from world units to metres used for attenuation and Doppler.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for factors that are not strictly positive.
    pub fn set_distance_factor(&self, factor: f32) -> Result<()> {
        if !(factor > 0.0 && factor.is_finite()) {
            return Err(CitySonicError::Configuration(format!(
                "distance factor {} must be positive",
                factor
            )));
        }
        self.listener()?.distance_factor = factor;
        Ok(())
    }

    /// Scales the Doppler effect; 0 disables it.
    pub fn set_doppler_factor(&self, factor: f32) -> Result<()> {
        self.listener()?.doppler_factor = factor.max(0.0);
        Ok(())
    }

    // ----------------------------------------------------- scene and reverb

    /// Installs the occlusion collaborator consulted for every spatial source.
    pub fn set_occlusion_query(&self, query: impl OcclusionQuery + 'static) -> Result<()> {
        *lock(&self.shared.occlusion, "occlusion query")? = Box::new(query);
        Ok(())
    }

    /// Registers a reverb zone. Zones are matched in registration order; zone 0 is
    /// the global fallback.
    ///
    /// The zone's taps and feedback are used as given. Zones built with
    /// [`ReverbZone::new`] already have taps laid out for their preset; after editing
    /// `room_size`, `pre_delay` or `decay_time` call [`ReverbZone::layout_taps`].
    ///
    /// # Errors
    ///
    /// Returns `Exhausted` once `reverb.max_zones` zones exist, and `Configuration` if
    /// a tap is longer than the reverb delay line.
    pub fn add_reverb_zone(&self, zone: ReverbZone) -> Result<ZoneId> {
        lock(&self.shared.reverb, "reverb engine")?.add_zone(zone)
    }

    /// Retunes the global zone 0. Each value is clamped to [0, 1] and the taps are
    /// laid out again from the new room size.
    pub fn set_global_reverb(
        &self,
        room_size: f32,
        damping: f32,
        wet_gain: f32,
        dry_gain: f32,
    ) -> Result<()> {
        lock(&self.shared.reverb, "reverb engine")?.set_global_params(
            room_size,
            damping,
            wet_gain,
            dry_gain,
            self.desc.sample_rate,
        )
    }

    /// Removes every zone added with [`add_reverb_zone`](Self::add_reverb_zone). The
    /// global outdoor zone is kept as zone 0.
    pub fn clear_reverb_zones(&self) -> Result<()> {
        let mut reverb = lock(&self.shared.reverb, "reverb engine")?;
        reverb.clear_zones();
        reverb.add_zone(ReverbZone::global(self.desc.sample_rate))?;
        Ok(())
    }

    /// Turns reverb on or off. The quality tier can still keep it off.
    pub fn set_reverb_enabled(&self, enabled: bool) -> Result<()> {
        self.shared.reverb_allowed.store(enabled, Ordering::Relaxed);
        let tier_allows = self.shared.counters.quality_tier().settings().reverb;
        lock(&self.shared.reverb, "reverb engine")?.set_enabled(enabled && tier_allows);
        Ok(())
    }

    // ---------------------------------------------------------------- streams

    /// Opens a WAV file as a stream and starts buffering it.
    ///
    /// # Arguments
    ///
    /// * `path` - WAV file; only the header is read here
    /// * `stream_type` - What the stream represents (music is usually `Ambient`)
    /// * `priority` - Higher priorities may evict idle lower-priority streams when
    ///   the pool is full
    ///
    /// # Errors
    ///
    /// Returns `Io` or `AudioLoading` if the file cannot be opened or fails header
    /// validation, `Exhausted` if no stream slot can be freed.
    pub fn create_stream(
        &self,
        path: impl AsRef<Path>,
        stream_type: SourceType,
        priority: u8,
    ) -> Result<StreamId> {
        self.streaming()?.create(path, stream_type, priority)
    }

    /// Creates a stream over any [`StreamReader`] (procedural or in-memory audio).
    pub fn create_stream_from_reader(
        &self,
        reader: Box<dyn StreamReader>,
        stream_type: SourceType,
        priority: u8,
    ) -> Result<StreamId> {
        self.streaming()?
            .create_from_reader(reader, stream_type, priority)
    }

    /// Starts a stream.
    ///
    /// # Errors
    ///
    /// Returns `NotReady` while the first chunk is still loading. Retry after a
    /// short delay.
    pub fn play_stream(&self, id: StreamId) -> Result<()> {
        self.with_stream(id, |s| s.play(id))
    }

    pub fn pause_stream(&self, id: StreamId) -> Result<()> {
        self.with_stream(id, |s| s.pause(id))
    }

    pub fn resume_stream(&self, id: StreamId) -> Result<()> {
        self.with_stream(id, |s| s.resume(id))
    }

    /// Stops and rewinds a stream. If it was part of a crossfade, the other side
    /// finishes its own ramp.
    pub fn stop_stream(&self, id: StreamId) -> Result<()> {
        self.with_stream(id, |s| s.stop(id))
    }

    /// Stops a stream and frees its slot.
    pub fn release_stream(&self, id: StreamId) -> Result<()> {
        self.with_stream(id, |s| s.release(id))
    }

    /// Crossfades from one stream to another over `duration_frames` output frames.
    ///
    /// # Errors
    ///
    /// Returns `NotReady` if `from` is not playing or `to` has nothing buffered yet.
    pub fn crossfade(&self, from: StreamId, to: StreamId, duration_frames: u64) -> Result<()> {
        self.with_stream(to, |s| s.crossfade(from, to, duration_frames))
    }

    pub fn set_stream_volume(&self, id: StreamId, volume: f32) -> Result<()> {
        self.with_stream(id, |s| s.set_volume(id, volume))
    }

    pub fn set_stream_pan(&self, id: StreamId, pan: f32) -> Result<()> {
        self.with_stream(id, |s| s.set_pan(id, pan))
    }

    pub fn set_stream_pitch(&self, id: StreamId, pitch: f32) -> Result<()> {
        self.with_stream(id, |s| s.set_pitch(id, pitch))
    }

    /// Enables or disables looping; `region` is `(start, end)` in source frames.
    pub fn set_stream_looping(
        &self,
        id: StreamId,
        enabled: bool,
        region: Option<(u64, Option<u64>)>,
    ) -> Result<()> {
        self.with_stream(id, |s| s.set_looping(id, enabled, region))
    }

    pub fn stream_state(&self, id: StreamId) -> Result<StreamState> {
        self.with_stream(id, |s| s.state(id))
    }

    pub fn stream_format(&self, id: StreamId) -> Result<StreamFormat> {
        self.with_stream(id, |s| s.format(id))
    }

    /// Services queued stream refills on the calling thread. Only does work in
    /// [`StreamIoMode::Manual`]; returns the number of chunks loaded.
    pub fn pump_stream_io(&mut self) -> usize {
        self.loader.as_mut().map_or(0, |loader| loader.process_pending())
    }

    // -------------------------------------------------------------- rendering

    /// Renders one block into the output ring on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns `NotReady` once a [`CitySonicEngine`](crate::CitySonicEngine) has taken
    /// over rendering.
    pub fn render_block(&mut self) -> Result<usize> {
        self.renderer
            .as_mut()
            .ok_or_else(|| {
                CitySonicError::NotReady("rendering is driven by an audio engine".into())
            })?
            .render_block()
    }

    /// Pops rendered frames. Frames past the available data are silence and count
    /// as an underrun. Returns the number of real frames.
    pub fn read_output(&mut self, left: &mut [f32], right: &mut [f32]) -> Result<usize> {
        let output = self.output.as_mut().ok_or_else(|| {
            CitySonicError::NotReady("output is consumed by an audio engine".into())
        })?;
        Ok(output.read(left, right))
    }

    pub(crate) fn take_render_side(&mut self) -> Result<(AudioRenderer, FrameConsumer)> {
        match (self.renderer.take(), self.output.take()) {
            (Some(renderer), Some(output)) => Ok((renderer, output)),
            (renderer, output) => {
                self.renderer = renderer;
                self.output = output;
                Err(CitySonicError::NotReady(
                    "renderer already owned by an audio engine".into(),
                ))
            }
        }
    }

    pub(crate) fn event_sender(&self) -> Sender<CitySonicEvent> {
        self.event_sender.clone()
    }

    // ------------------------------------------------------------ diagnostics

    /// Drains events raised since the last call.
    pub fn poll_events(&self) -> Vec<CitySonicEvent> {
        self.event_receiver.try_iter().collect()
    }

    /// Drains per-block timing measurements. Only the most recent few hundred blocks
    /// are kept when nobody polls.
    pub fn poll_timing_events(&self) -> Vec<RenderTimingEvent> {
        self.timing_receiver.try_iter().collect()
    }

    pub fn get_performance_stats(&self) -> PerformanceStats {
        self.shared.counters.snapshot(self.ring.underruns())
    }

    /// Sources currently playing or fading, mixed or virtualized.
    pub fn active_source_count(&self) -> Result<usize> {
        Ok(self.registry()?.audible_count())
    }

    /// Whether the HRTF table was built. Without it spatial sources are panned.
    pub fn is_hrtf_available(&self) -> bool {
        self.hrtf_available
    }

    pub fn quality_tier(&self) -> QualityTier {
        self.shared.counters.quality_tier()
    }

    /// Output peak meters, decaying between blocks.
    pub fn peak_levels(&self) -> PeakLevels {
        self.shared.peak_levels()
    }

    /// Frames rendered but not yet consumed by the device.
    pub fn buffered_output_frames(&self) -> usize {
        self.ring.available()
    }

    /// Logs a performance summary at info level.
    pub fn log_statistics(&self) {
        let stats = self.get_performance_stats();
        let peaks = self.peak_levels();
        let streams = self.streaming().map(|s| s.len()).unwrap_or(0);
        log::info!("=== CitySonic statistics ===");
        log::info!(
            "Frames processed: {} in {} blocks",
            stats.frames_processed,
            stats.blocks_rendered
        );
        log::info!(
            "Underruns: {}, CPU peak: {:.1}%, overloads: {}",
            stats.underruns,
            stats.peak_cpu * 100.0,
            stats.cpu_overloads
        );
        log::info!(
            "Active sources: {}, streams: {}, quality: {}",
            stats.active_sources,
            streams,
            stats.quality_tier
        );
        log::info!(
            "HRTF: {}, peaks L {:.3} R {:.3}",
            if self.hrtf_available { "on" } else { "panning" },
            peaks.left,
            peaks.right
        );
    }
}

fn stop_source(source: &mut AudioSource) {
    source.state = PlayState::Stopped;
    source.cursor.rewind();
    source.fade = FadeEnvelope::default();
    source.spatial.reset();
}

/// State a paused source returns to, from the fade it was paused in.
fn resumed_state(fade: &FadeEnvelope) -> PlayState {
    if fade.is_complete() {
        PlayState::Playing
    } else if fade.target() > fade.level() {
        PlayState::FadingIn
    } else {
        PlayState::FadingOut
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GovernorDesc, HrtfMode};
    use crate::reverb::ReverbZoneType;
    use crate::streaming::MemoryStreamReader;
    use approx::assert_abs_diff_eq;

    fn desc() -> CitySonicWorldDesc {
        CitySonicWorldDesc::new()
            .block_size(256)
            .ring_capacity_frames(1 << 16)
            .max_sources(8)
            .hrtf_mode(HrtfMode::Disabled)
            .stream_io_mode(StreamIoMode::Manual)
            .governor(GovernorDesc {
                lower_threshold: 1e-9,
                upper_threshold: f32::MAX,
                ..GovernorDesc::default()
            })
    }

    fn world() -> CitySonicWorld {
        let _ = env_logger::builder().is_test(true).try_init();
        let world = CitySonicWorld::new(desc()).unwrap();
        world.set_reverb_enabled(false).unwrap();
        world
    }

    fn tone(frames: usize) -> CitySonicAudioData {
        CitySonicAudioData::from_samples(vec![0.5; frames], 48000, 1).unwrap()
    }

    #[test]
    fn test_invalid_desc_rejected() {
        assert!(matches!(
            CitySonicWorld::new(CitySonicWorldDesc::new().block_size(0)),
            Err(CitySonicError::Configuration(_))
        ));
    }

    #[test]
    fn test_play_requires_clip() {
        let world = world();
        let id = world.create_source(SourceType::Vehicle).unwrap();
        let err = world.play(id).unwrap_err();
        assert!(err.is_retryable());
        world.set_source_clip(id, &tone(1000)).unwrap();
        world.play(id).unwrap();
        assert_eq!(world.source_state(id).unwrap(), PlayState::Playing);
    }

    #[test]
    fn test_stale_handle_is_invalid() {
        let world = world();
        let id = world.create_source(SourceType::Building).unwrap();
        world.release_source(id).unwrap();
        assert!(matches!(
            world.set_volume(id, 0.5),
            Err(CitySonicError::InvalidHandle(_))
        ));
        assert!(world.release_source(id).is_err());
        let reused = world.create_source(SourceType::Building).unwrap();
        assert_eq!(reused.index(), id.index());
        assert!(world.source_state(id).is_err());
    }

    #[test]
    fn test_source_pool_exhaustion() {
        let world = world();
        for _ in 0..8 {
            world.create_source(SourceType::Entity).unwrap();
        }
        assert!(matches!(
            world.create_source(SourceType::Entity),
            Err(CitySonicError::Exhausted { capacity: 8, .. })
        ));
    }

    #[test]
    fn test_pause_and_resume_keep_position() {
        let mut world = world();
        let id = world.play_ui_sound(&tone(48000), 1.0).unwrap();
        world.render_block().unwrap();
        world.pause(id).unwrap();
        world.render_block().unwrap();
        assert_eq!(world.source_state(id).unwrap(), PlayState::Paused);
        world.resume(id).unwrap();
        assert_eq!(world.source_state(id).unwrap(), PlayState::Playing);
        world.stop(id).unwrap();
        assert_eq!(world.source_state(id).unwrap(), PlayState::Stopped);
        // Stopped sources keep their clip and can be restarted.
        world.play(id).unwrap();
    }

    #[test]
    fn test_one_shot_releases_itself() {
        let mut world = world();
        let id = world
            .play_sound_at_position(&tone(300), Vec3::new(0.0, 0.0, -2.0), 1.0)
            .unwrap();
        world.render_block().unwrap();
        world.render_block().unwrap();
        assert!(world.source_state(id).is_err());
        assert!(
            world
                .poll_events()
                .contains(&CitySonicEvent::SourceCompleted { source_id: id })
        );
        assert_eq!(world.active_source_count().unwrap(), 0);
    }

    #[test]
    fn test_ambient_loop_keeps_playing() {
        let mut world = world();
        let id = world.start_ambient_loop(&tone(200), 0.3).unwrap();
        for _ in 0..4 {
            world.render_block().unwrap();
        }
        assert_eq!(world.source_state(id).unwrap(), PlayState::Playing);
        let loops = world
            .poll_events()
            .iter()
            .filter(|e| matches!(e, CitySonicEvent::SourceLooped { .. }))
            .count();
        assert!(loops >= 4);
    }

    #[test]
    fn test_fade_in_then_fade_out() {
        let mut world = world();
        let id = world.create_source(SourceType::Ui).unwrap();
        world.set_source_clip(id, &tone(48000)).unwrap();
        world.fade_in(id, 512).unwrap();
        assert_eq!(world.source_state(id).unwrap(), PlayState::FadingIn);
        world.render_block().unwrap();
        world.render_block().unwrap();
        assert_eq!(world.source_state(id).unwrap(), PlayState::Playing);

        world.fade_out(id, 256).unwrap();
        world.render_block().unwrap();
        assert_eq!(world.source_state(id).unwrap(), PlayState::Stopped);
        assert!(
            world
                .poll_events()
                .contains(&CitySonicEvent::SourceFadedOut { source_id: id })
        );
    }

    #[test]
    fn test_fade_in_output_ramps() {
        let mut world = world();
        let id = world.create_source(SourceType::Ui).unwrap();
        world.set_source_clip(id, &tone(48000)).unwrap();
        world.fade_in(id, 256).unwrap();
        world.render_block().unwrap();
        let mut left = vec![0.0; 256];
        let mut right = vec![0.0; 256];
        world.read_output(&mut left, &mut right).unwrap();
        assert!(left[0] < 0.01);
        assert!(left[128] > left[0]);
        assert!(left[255] > left[128]);
    }

    #[test]
    fn test_listener_rejects_degenerate_basis() {
        let world = world();
        let err = world.set_listener(Vec3::ZERO, Vec3::Y, Vec3::Y);
        assert!(matches!(err, Err(CitySonicError::Configuration(_))));
        world
            .set_listener(Vec3::new(1.0, 2.0, 3.0), Vec3::NEG_Z, Vec3::Y)
            .unwrap();
        assert_eq!(
            world.listener_state().unwrap().position,
            Vec3::new(1.0, 2.0, 3.0)
        );
    }

    #[test]
    fn test_master_volume_clamped() {
        let world = world();
        world.set_master_volume(3.0).unwrap();
        assert_eq!(world.listener_state().unwrap().master_volume, 1.0);
        world.set_master_volume(-1.0).unwrap();
        assert_eq!(world.listener_state().unwrap().master_volume, 0.0);
        assert!(world.set_distance_factor(0.0).is_err());
    }

    #[test]
    fn test_spatial_params_follow_listener() {
        let mut world = world();
        let id = world
            .play_sound_at_position(&tone(48000), Vec3::new(10.0, 0.0, 0.0), 1.0)
            .unwrap();
        world.render_block().unwrap();
        let params = world.source_spatial_params(id).unwrap();
        assert_abs_diff_eq!(params.azimuth, 90.0, epsilon = 1e-3);
        assert_abs_diff_eq!(params.distance, 10.0, epsilon = 1e-4);

        world.set_listener(Vec3::ZERO, Vec3::X, Vec3::Y).unwrap();
        world.render_block().unwrap();
        let params = world.source_spatial_params(id).unwrap();
        assert_abs_diff_eq!(params.azimuth, 0.0, epsilon = 1e-3);
    }

    #[test]
    fn test_reverb_zones() {
        let world = world();
        let tunnel = ReverbZone::new(ReverbZoneType::Tunnel, Vec3::ZERO, 20.0, 48000);
        let id = world.add_reverb_zone(tunnel).unwrap();
        assert_eq!(id.index(), 1);
        world.clear_reverb_zones().unwrap();
        let reverb = lock(&world.shared.reverb, "reverb").unwrap();
        assert_eq!(reverb.zone_count(), 1);
        assert_eq!(reverb.find_zone(Vec3::ZERO).map(|z| z.index()), Some(0));
    }

    #[test]
    fn test_stopped_source_keeps_clip_until_unloaded() {
        let world = world();
        let id = world.create_source(SourceType::Vehicle).unwrap();
        world.set_source_clip(id, &tone(1000)).unwrap();
        world.play(id).unwrap();
        world.stop(id).unwrap();
        assert_eq!(world.source_state(id).unwrap(), PlayState::Stopped);
        world.play(id).unwrap();

        world.unload_source(id).unwrap();
        assert!(matches!(world.play(id), Err(CitySonicError::NotReady(_))));
    }

    #[test]
    fn test_custom_reverb_taps_and_global_retune() {
        let world = world();
        let mut hall = ReverbZone::new(ReverbZoneType::IndoorLarge, Vec3::ZERO, 30.0, 48000);
        for (i, tap) in hall.taps.iter_mut().enumerate() {
            tap.delay = 1000 * (i + 1);
            tap.gain = 0.05;
        }
        hall.feedback = 0.25;
        let id = world.add_reverb_zone(hall.clone()).unwrap();

        let mut too_long = hall.clone();
        too_long.taps[0].delay = 48000 * 60;
        assert!(matches!(
            world.add_reverb_zone(too_long),
            Err(CitySonicError::Configuration(_))
        ));

        world.set_global_reverb(0.3, 0.2, 0.5, 0.5).unwrap();
        let reverb = lock(&world.shared.reverb, "reverb").unwrap();
        assert_eq!(reverb.zone(id), Some(&hall));
        let global = reverb.zone(ZoneId(0)).unwrap();
        assert_eq!(global.room_size, 0.3);
        assert_eq!(global.wet_gain, 0.5);
    }

    #[test]
    fn test_loop_region_ignored_when_not_looping() {
        let mut world = world();
        let id = world.play_ui_sound(&tone(600), 1.0).unwrap();
        world.set_loop_region(id, 0, Some(100)).unwrap();

        world.render_block().unwrap();
        assert_eq!(world.source_state(id).unwrap(), PlayState::Playing);
        let mut left = vec![0.0; 256];
        let mut right = vec![0.0; 256];
        world.read_output(&mut left, &mut right).unwrap();
        assert!(left.iter().all(|s| s.abs() > 0.1));

        world.render_block().unwrap();
        world.render_block().unwrap();
        assert!(world.source_state(id).is_err());
    }

    #[test]
    fn test_stream_through_world() {
        let mut world = world();
        let clip = CitySonicAudioData::from_samples(vec![0.25; 96000], 48000, 2).unwrap();
        let id = world
            .create_stream_from_reader(
                Box::new(MemoryStreamReader::new(clip)),
                SourceType::Ambient,
                1,
            )
            .unwrap();
        assert!(matches!(
            world.play_stream(id),
            Err(CitySonicError::NotReady(_))
        ));

        assert!(world.pump_stream_io() > 0);
        world.render_block().unwrap();
        world.play_stream(id).unwrap();
        world.render_block().unwrap();
        assert_eq!(world.stream_state(id).unwrap(), StreamState::Playing);
        assert_eq!(world.stream_format(id).unwrap().channels, 2);

        world.release_stream(id).unwrap();
        assert!(matches!(
            world.stream_state(id),
            Err(CitySonicError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_load_source_file() {
        let world = world();
        let samples: Vec<i16> = (0..4800).map(|i| ((i % 100) * 100) as i16).collect();
        let bytes = crate::audio_data::wav_bytes(2, 24000, &samples);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("horn.wav");
        std::fs::write(&path, bytes).unwrap();

        let id = world.create_source(SourceType::Vehicle).unwrap();
        world.load_source_file(id, &path).unwrap();
        world.play(id).unwrap();

        assert!(world.load_source_file(id, dir.path().join("missing.wav")).is_err());
        // A failed load keeps the previous clip.
        assert_eq!(world.source_state(id).unwrap(), PlayState::Playing);
    }

    #[test]
    fn test_stats_and_timing() {
        let mut world = world();
        world.play_ui_sound(&tone(48000), 1.0).unwrap();
        for _ in 0..3 {
            world.render_block().unwrap();
        }
        let stats = world.get_performance_stats();
        assert_eq!(stats.frames_processed, 768);
        assert_eq!(stats.blocks_rendered, 3);
        assert_eq!(stats.active_sources, 1);
        assert_eq!(world.poll_timing_events().len(), 3);
        assert_eq!(world.buffered_output_frames(), 768);
        assert!(world.peak_levels().left > 0.4);

        let mut left = vec![0.0; 1024];
        let mut right = vec![0.0; 1024];
        assert_eq!(world.read_output(&mut left, &mut right).unwrap(), 768);
        assert_eq!(world.get_performance_stats().underruns, 1);
        world.log_statistics();
    }
}

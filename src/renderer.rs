//! The mixing task: renders one audio block end to end.
//!
//! Per block, in order:
//!
//! 1. streaming refill bookkeeping and stream mixing
//! 2. source virtualization against the quality tier's source cap
//! 3. per-source occlusion, spatial parameters, playback and convolution
//! 4. reverb on the summed bus for the listener's zone
//! 5. master volume, limiter and meters
//! 6. hand-off to the output ring
//! 7. governor feedback, counters and timing events
//!
//! The renderer owns everything the block needs exclusively (spatial processor,
//! mixer, scratch buffers, ring producer). State shared with game code lives in
//! [`SharedState`] behind short-lived locks; the device callback never touches it.

use crate::config::CitySonicWorldDesc;
use crate::error::{Result, lock};
use crate::events::{CitySonicEvent, RenderTimingEvent};
use crate::governor::{FormatNegotiator, PerformanceCounters, PerformanceGovernor, QualityTier};
use crate::mixer::{Mixer, PeakLevels, Voice};
use crate::playback::{GainRamp, PlayState};
use crate::registry::{SourceId, SourceRegistry};
use crate::reverb::{ReverbEngine, ReverbZone};
use crate::ring::{FrameConsumer, FrameProducer, frame_ring};
use crate::scene::{DistanceOcclusion, OcclusionQuery};
use crate::spatial::{Listener, SpatialProcessor, distance_attenuation, pan_gains};
use crate::streaming::{StreamLoader, StreamingLayer};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Timing events kept for game code before new ones are dropped.
const TIMING_QUEUE: usize = 256;

/// State shared between the world (game thread) and the renderer (mixing task).
pub(crate) struct SharedState {
    pub registry: Mutex<SourceRegistry>,
    pub streaming: Mutex<StreamingLayer>,
    pub listener: Mutex<Listener>,
    pub occlusion: Mutex<Box<dyn OcclusionQuery>>,
    pub reverb: Mutex<ReverbEngine>,
    pub counters: PerformanceCounters,
    /// Game-side reverb switch; the tier can still turn reverb off.
    pub reverb_allowed: AtomicBool,
    peak_left: AtomicU32,
    peak_right: AtomicU32,
}

impl SharedState {
    pub fn peak_levels(&self) -> PeakLevels {
        PeakLevels {
            left: f32::from_bits(self.peak_left.load(Ordering::Relaxed)),
            right: f32::from_bits(self.peak_right.load(Ordering::Relaxed)),
        }
    }

    fn store_peaks(&self, peaks: PeakLevels) {
        self.peak_left.store(peaks.left.to_bits(), Ordering::Relaxed);
        self.peak_right.store(peaks.right.to_bits(), Ordering::Relaxed);
    }
}

/// Everything `CitySonicWorld` needs, built in one go so a failed allocation
/// leaves nothing half-constructed.
pub(crate) struct RenderParts {
    pub shared: Arc<SharedState>,
    pub renderer: AudioRenderer,
    pub output: FrameConsumer,
    pub loader: StreamLoader,
    pub event_sender: Sender<CitySonicEvent>,
    pub events: Receiver<CitySonicEvent>,
    pub timing: Receiver<RenderTimingEvent>,
    pub hrtf_available: bool,
}

/// Renders audio blocks into the output ring.
///
/// Driven either by the engine's mixing thread or directly through
/// [`CitySonicWorld::render_block`](crate::CitySonicWorld::render_block).
pub struct AudioRenderer {
    shared: Arc<SharedState>,
    output: FrameProducer,
    processor: SpatialProcessor,
    mixer: Mixer,
    governor: PerformanceGovernor,
    negotiator: Option<Arc<dyn FormatNegotiator>>,
    events: Sender<CitySonicEvent>,
    timing: Sender<RenderTimingEvent>,
    sample_rate: u32,
    block_size: usize,
    block_index: u64,
    dry: Vec<f32>,
    wet_left: Vec<f32>,
    wet_right: Vec<f32>,
    /// (audibility score, source) for the virtualization pass.
    ranking: Vec<(f32, SourceId)>,
    ended: Vec<SourceId>,
    dropped_frames: u64,
}

fn scratch(frames: usize) -> Result<Vec<f32>> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(frames)?;
    buffer.resize(frames, 0.0);
    Ok(buffer)
}

impl AudioRenderer {
    pub(crate) fn build(desc: &CitySonicWorldDesc) -> Result<RenderParts> {
        let (event_tx, event_rx) = unbounded();
        let (timing_tx, timing_rx) = bounded(TIMING_QUEUE);

        let registry = SourceRegistry::new(desc.max_sources)?;
        let (streaming, loader) = StreamingLayer::new(
            &desc.streaming,
            desc.sample_rate,
            desc.block_size,
            event_tx.clone(),
        )?;
        let mut reverb = ReverbEngine::new(&desc.reverb, desc.sample_rate)?;
        reverb.add_zone(ReverbZone::global(desc.sample_rate))?;
        let (producer, consumer) = frame_ring(desc.ring_capacity_frames)?;

        let processor = SpatialProcessor::new(desc);
        let hrtf_available = processor.is_hrtf_available();
        let governor = PerformanceGovernor::new(&desc.governor);

        let mut ranking = Vec::new();
        ranking.try_reserve_exact(desc.max_sources)?;
        let mut ended = Vec::new();
        ended.try_reserve_exact(desc.max_sources)?;

        let shared = Arc::new(SharedState {
            registry: Mutex::new(registry),
            streaming: Mutex::new(streaming),
            listener: Mutex::new(Listener::default()),
            occlusion: Mutex::new(Box::new(DistanceOcclusion::default())),
            reverb: Mutex::new(reverb),
            counters: PerformanceCounters::new(governor.tier()),
            reverb_allowed: AtomicBool::new(true),
            peak_left: AtomicU32::new(0f32.to_bits()),
            peak_right: AtomicU32::new(0f32.to_bits()),
        });

        let event_sender = event_tx.clone();
        let mut renderer = Self {
            shared: shared.clone(),
            output: producer,
            processor,
            mixer: Mixer::new(&desc.mixer, desc.block_size)?,
            governor,
            negotiator: None,
            events: event_tx,
            timing: timing_tx,
            sample_rate: desc.sample_rate,
            block_size: desc.block_size,
            block_index: 0,
            dry: scratch(desc.block_size)?,
            wet_left: scratch(desc.block_size)?,
            wet_right: scratch(desc.block_size)?,
            ranking,
            ended,
            dropped_frames: 0,
        };
        renderer.apply_tier(renderer.governor.tier())?;

        Ok(RenderParts {
            shared,
            renderer,
            output: consumer,
            loader,
            event_sender,
            events: event_rx,
            timing: timing_rx,
            hrtf_available,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames the output ring can take right now.
    pub fn output_space(&self) -> usize {
        self.output.free_frames()
    }

    /// Blocks rendered so far.
    pub fn blocks_rendered(&self) -> u64 {
        self.block_index
    }

    pub fn quality_tier(&self) -> QualityTier {
        self.governor.tier()
    }

    /// Install the device-side half of tier changes.
    pub fn set_format_negotiator(&mut self, negotiator: Arc<dyn FormatNegotiator>) {
        self.negotiator = Some(negotiator);
    }

    /// Render one block and push it into the output ring. Returns the frames rendered.
    ///
    /// Frames the ring cannot accept are dropped; the mixing thread only renders when
    /// a whole block fits.
    pub fn render_block(&mut self) -> Result<usize> {
        let started = Instant::now();
        let frames = self.block_size;
        let mut timing = RenderTimingEvent {
            block_index: self.block_index,
            frames,
            ..RenderTimingEvent::default()
        };
        self.mixer.begin_block(frames);

        let phase = Instant::now();
        {
            let mut streaming = lock(&self.shared.streaming, "streaming layer")?;
            streaming.check_buffer_levels();
            let (left, right) = streaming.render(frames);
            self.mixer.accumulate(&Voice {
                left,
                right,
                gain: GainRamp::UNITY,
            });
        }
        timing.streaming_time_us = phase.elapsed().as_micros() as u64;

        let listener = *lock(&self.shared.listener, "listener")?;
        let phase = Instant::now();
        let (rendered, mixing) = self.render_sources(frames, &listener)?;
        timing.spatial_time_us = phase.elapsed().saturating_sub(mixing).as_micros() as u64;
        timing.mixing_time_us = mixing.as_micros() as u64;

        let phase = Instant::now();
        {
            let mut reverb = lock(&self.shared.reverb, "reverb engine")?;
            let zone = reverb.find_zone(listener.position);
            let (left, right) = self.mixer.bus_mut();
            reverb.process_in_place(left, right, zone);
        }
        timing.reverb_time_us = phase.elapsed().as_micros() as u64;

        let phase = Instant::now();
        self.mixer.finish_block(listener.master_volume);
        self.shared.store_peaks(self.mixer.peak_levels());
        let (left, right) = self.mixer.output();
        let written = self.output.write(left, right);
        if written < frames {
            self.dropped_frames += (frames - written) as u64;
            log::trace!(
                "Output ring full, dropped {} frames ({} total)",
                frames - written,
                self.dropped_frames
            );
        }
        timing.mixing_time_us += phase.elapsed().as_micros() as u64;

        let elapsed = started.elapsed();
        let budget = Duration::from_secs_f64(frames as f64 / self.sample_rate as f64);
        let previous = self.governor.tier();
        if let Some(tier) = self.governor.observe(elapsed, budget) {
            self.apply_tier(tier)?;
            let _ = self.events.send(CitySonicEvent::QualityTierChanged {
                old_tier: previous,
                new_tier: tier,
            });
        }
        self.shared
            .counters
            .record_block(frames, rendered, &self.governor);

        timing.total_time_us = elapsed.as_micros() as u64;
        timing.budget_us = budget.as_micros() as u64;
        if let Err(TrySendError::Disconnected(_)) = self.timing.try_send(timing) {
            log::trace!("Timing receiver gone");
        }

        self.block_index += 1;
        Ok(frames)
    }

    /// Returns the number of sources mixed and the time spent accumulating them.
    fn render_sources(&mut self, frames: usize, listener: &Listener) -> Result<(usize, Duration)> {
        let shared = self.shared.clone();
        let mut registry = lock(&shared.registry, "source registry")?;
        let mut occlusion = lock(&shared.occlusion, "occlusion query")?;
        occlusion.begin_block();

        self.mark_virtualized(&mut registry, listener);

        let Self {
            processor,
            mixer,
            events,
            dry,
            wet_left,
            wet_right,
            ended,
            ..
        } = self;
        let dry = &mut dry[..frames];
        let left = &mut wet_left[..frames];
        let right = &mut wet_right[..frames];
        let mut mixing = Duration::ZERO;
        let mut rendered = 0;
        ended.clear();

        for (id, source) in registry.iter_mut() {
            if !source.state.is_audible() {
                continue;
            }
            let Some(clip) = source.clip.as_ref() else {
                source.state = PlayState::Stopped;
                continue;
            };

            let params = if source.source_type.is_spatial() {
                let occluded = occlusion.occlusion(source.position, listener.position);
                Some(processor.update_source(
                    &mut source.spatial,
                    source.position,
                    source.velocity,
                    listener,
                    occluded,
                ))
            } else {
                None
            };
            let rate = source.pitch * params.map_or(1.0, |p| p.doppler);
            let outcome = source.cursor.read_block(clip.samples(), rate, dry);
            let fade = source.fade.advance(frames);

            if !source.virtualized {
                let gain = match params {
                    Some(p) => {
                        processor.render_source(&mut source.spatial, dry, left, right);
                        source.volume * p.attenuation * p.occlusion
                    }
                    None => {
                        let (pan_l, pan_r) = pan_gains(source.pan);
                        for ((&x, l), r) in dry.iter().zip(left.iter_mut()).zip(right.iter_mut()) {
                            *l = x * pan_l;
                            *r = x * pan_r;
                        }
                        source.volume
                    }
                };
                let phase = Instant::now();
                mixer.accumulate(&Voice {
                    left: &left[..],
                    right: &right[..],
                    gain: fade.scaled(gain),
                });
                mixing += phase.elapsed();
                rendered += 1;
            }

            if outcome.loops > 0 {
                let _ = events.send(CitySonicEvent::SourceLooped {
                    source_id: id,
                    loop_count: outcome.loops,
                });
            }
            if outcome.ended {
                ended.push(id);
                continue;
            }
            if source.fade.is_complete() {
                match source.state {
                    PlayState::FadingIn => source.state = PlayState::Playing,
                    PlayState::FadingOut => {
                        source.state = PlayState::Stopped;
                        source.cursor.rewind();
                        let _ = events.send(CitySonicEvent::SourceFadedOut { source_id: id });
                    }
                    _ => {}
                }
            }
        }

        for &id in ended.iter() {
            registry.destroy(id)?;
            let _ = events.send(CitySonicEvent::SourceCompleted { source_id: id });
        }

        Ok((rendered, mixing))
    }

    /// Flag the least audible sources beyond the tier's cap. Virtualized sources keep
    /// their cursors moving but are not spatialized or mixed.
    fn mark_virtualized(&mut self, registry: &mut SourceRegistry, listener: &Listener) {
        let model = *self.processor.distance_model();
        self.ranking.clear();
        for (id, source) in registry.iter_mut() {
            source.virtualized = false;
            if !source.state.is_audible() {
                continue;
            }
            let score = if source.source_type.is_spatial() {
                let distance =
                    (source.position - listener.position).length() * listener.distance_factor;
                source.volume * distance_attenuation(distance, &model)
            } else {
                source.volume
            };
            if self.ranking.len() < self.ranking.capacity() {
                self.ranking.push((score, id));
            }
        }

        let limit = registry.active_limit();
        if self.ranking.len() <= limit {
            return;
        }
        self.ranking
            .sort_unstable_by(|a, b| b.0.total_cmp(&a.0));
        for &(_, id) in &self.ranking[limit..] {
            if let Ok(source) = registry.get_mut(id) {
                source.virtualized = true;
            }
        }
    }

    /// Push a tier's settings to the registry, spatial processor, reverb and device.
    fn apply_tier(&mut self, tier: QualityTier) -> Result<()> {
        let settings = tier.settings();
        lock(&self.shared.registry, "source registry")?.set_active_limit(settings.max_sources);
        self.processor.set_hrtf_enabled(settings.hrtf);
        let reverb_allowed = self.shared.reverb_allowed.load(Ordering::Relaxed);
        lock(&self.shared.reverb, "reverb engine")?.set_enabled(settings.reverb && reverb_allowed);
        if let Some(negotiator) = &self.negotiator {
            negotiator.request_format(settings.sample_rate, settings.buffer_frames);
        }
        log::debug!(
            "Quality tier {} applied ({} sources, hrtf {}, reverb {})",
            tier,
            settings.max_sources,
            settings.hrtf,
            settings.reverb
        );
        Ok(())
    }
}

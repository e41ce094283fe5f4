//! Long-form audio (music, ambience) streamed from disk in chunks.
//!
//! Each stream owns a ring of `buffer_count` chunks (triple buffering by default).
//! The mixing task plays the current chunk while [`StreamingLayer::check_buffer_levels`]
//! asks the [`StreamLoader`] to refill the ones already consumed. Streams are mixed
//! without spatialization, panned by their `pan` value.
//!
//! State machine:
//!
//! ```text
//! Stopped -> Loading -> Buffering -> Playing -> { Paused, CrossfadingOut, Finishing } -> Stopped
//!                                    CrossfadingIn -> Playing
//! ```

mod loader;
mod reader;

pub use loader::{LoaderThread, StreamLoader};
pub use reader::{MemoryStreamReader, StreamFormat, StreamReader, WavStreamReader, validate_wav_magic};

use crate::config::StreamingDesc;
use crate::error::{CitySonicError, Result};
use crate::events::CitySonicEvent;
use crate::registry::SourceType;
use crate::slots::{SlotHandle, SlotPool};
use crate::spatial::pan_gains;
use crossbeam_channel::{Receiver, Sender, unbounded};
use loader::{LoadRequest, LoadResult, SharedReader};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Handle to a stream. Stale after `release_stream`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(pub(crate) SlotHandle);

impl StreamId {
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamId({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Stopped,
    /// Initial chunk loads issued, none back yet.
    Loading,
    /// At least one chunk is ready; `play` will succeed.
    Buffering,
    Playing,
    Paused,
    CrossfadingIn,
    CrossfadingOut,
    /// The last chunk of a non-looping stream is playing.
    Finishing,
}

impl StreamState {
    pub fn is_audible(&self) -> bool {
        matches!(
            self,
            Self::Playing | Self::CrossfadingIn | Self::CrossfadingOut | Self::Finishing
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Empty,
    Loading,
    Ready,
}

#[derive(Debug)]
struct Chunk {
    state: ChunkState,
    /// Stereo interleaved.
    data: Vec<f32>,
    frames: usize,
    /// Holds the final frames before the end (or loop end) of the data.
    last: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkAdvance {
    Stayed,
    Looped,
    Finished,
}

/// Linear crossfade gain ramp. Both sides of a crossfade get one with the same
/// duration, so they progress together.
#[derive(Debug, Clone, Copy, PartialEq)]
struct StreamFade {
    start: f32,
    target: f32,
    duration: u64,
    elapsed: u64,
}

impl StreamFade {
    fn gain_at(&self, offset: u64) -> f32 {
        if self.duration == 0 {
            return self.target;
        }
        let t = (self.elapsed + offset).min(self.duration) as f32 / self.duration as f32;
        self.start + (self.target - self.start) * t
    }

    fn level(&self) -> f32 {
        self.gain_at(0)
    }

    fn is_complete(&self) -> bool {
        self.elapsed >= self.duration
    }

    fn progress(&self) -> f32 {
        if self.duration == 0 {
            1.0
        } else {
            self.elapsed.min(self.duration) as f32 / self.duration as f32
        }
    }
}

struct Stream {
    stream_type: SourceType,
    priority: u8,
    state: StreamState,
    /// State to return to on resume.
    resume_state: StreamState,
    reader: Option<SharedReader>,
    format: StreamFormat,
    chunks: Vec<Chunk>,
    current: usize,
    /// Fractional read position inside the current chunk, in file frames.
    position: f64,
    fill_index: usize,
    fill_frame: u64,
    /// No more chunks will be requested.
    exhausted: bool,
    /// Bumped on rewind; load results from older epochs are discarded.
    epoch: u64,
    /// Frames have been consumed since the last rewind.
    consumed: bool,
    starving: bool,
    volume: f32,
    pan: f32,
    pitch: f32,
    looping: bool,
    loop_start: u64,
    loop_end: Option<u64>,
    fade: Option<StreamFade>,
}

impl Stream {
    fn vacant() -> Self {
        Self {
            stream_type: SourceType::Ambient,
            priority: 0,
            state: StreamState::Stopped,
            resume_state: StreamState::Playing,
            reader: None,
            format: StreamFormat {
                sample_rate: 0,
                channels: 0,
                bits_per_sample: 0,
                total_frames: 0,
            },
            chunks: Vec::new(),
            current: 0,
            position: 0.0,
            fill_index: 0,
            fill_frame: 0,
            exhausted: false,
            epoch: 0,
            consumed: false,
            starving: false,
            volume: 1.0,
            pan: 0.0,
            pitch: 1.0,
            looping: false,
            loop_start: 0,
            loop_end: None,
            fade: None,
        }
    }

    /// Frame (exclusive) at which reading stops or wraps. The loop end only applies
    /// while looping.
    fn data_end(&self) -> u64 {
        let total = self.format.total_frames;
        match self.loop_end {
            Some(end) if self.looping => end.min(total),
            _ => total,
        }
    }

    fn loops(&self) -> bool {
        self.looping && self.data_end() > self.loop_start
    }

    /// Drop buffered audio and restart from the beginning on the next refill.
    fn rewind(&mut self) {
        self.epoch += 1;
        for chunk in &mut self.chunks {
            if chunk.state == ChunkState::Ready {
                chunk.state = ChunkState::Empty;
            }
            chunk.frames = 0;
            chunk.last = false;
        }
        self.current = 0;
        self.position = 0.0;
        self.fill_index = 0;
        self.fill_frame = 0;
        self.exhausted = false;
        self.consumed = false;
        self.starving = false;
    }

    /// Release chunks the read position has moved past.
    fn advance_chunks(&mut self) -> ChunkAdvance {
        let count = self.chunks.len();
        let mut outcome = ChunkAdvance::Stayed;
        for _ in 0..count {
            if !self.current_ready() {
                break;
            }
            let chunk = &mut self.chunks[self.current];
            if self.position < chunk.frames as f64 {
                break;
            }
            let was_last = chunk.last;
            self.position -= chunk.frames as f64;
            chunk.state = ChunkState::Empty;
            chunk.frames = 0;
            chunk.last = false;
            self.current = (self.current + 1) % count;
            if was_last {
                if self.loops() {
                    outcome = ChunkAdvance::Looped;
                } else {
                    return ChunkAdvance::Finished;
                }
            }
        }
        outcome
    }

    /// Gain a new crossfade ramp starts from.
    fn current_gain(&self) -> f32 {
        match self.fade {
            Some(fade) => fade.level(),
            None if self.state.is_audible() => 1.0,
            None => 0.0,
        }
    }

    fn current_ready(&self) -> bool {
        self.chunks
            .get(self.current)
            .is_some_and(|c| c.state == ChunkState::Ready)
    }

    fn buffered_frames(&self) -> usize {
        let mut total = 0;
        let n = self.chunks.len();
        for k in 0..n {
            let chunk = &self.chunks[(self.current + k) % n];
            if chunk.state != ChunkState::Ready {
                break;
            }
            total += chunk.frames;
            if chunk.last {
                break;
            }
        }
        total.saturating_sub(self.position as usize)
    }
}

/// Manager for all streams.
pub struct StreamingLayer {
    pool: SlotPool<Stream>,
    desc: StreamingDesc,
    sample_rate: u32,
    requests: Sender<LoadRequest>,
    results: Receiver<LoadResult>,
    events: Sender<CitySonicEvent>,
    crossfades: Vec<(StreamId, StreamId)>,
    bus_left: Vec<f32>,
    bus_right: Vec<f32>,
}

impl StreamingLayer {
    /// Create the layer and the loader that services its refills.
    pub fn new(
        desc: &StreamingDesc,
        sample_rate: u32,
        max_block_frames: usize,
        events: Sender<CitySonicEvent>,
    ) -> Result<(Self, StreamLoader)> {
        let pool = SlotPool::with_capacity(desc.max_streams, || Ok(Stream::vacant()))?;
        let (request_tx, request_rx) = unbounded();
        let (result_tx, result_rx) = unbounded();

        let mut bus_left = Vec::new();
        let mut bus_right = Vec::new();
        bus_left.try_reserve_exact(max_block_frames)?;
        bus_right.try_reserve_exact(max_block_frames)?;
        bus_left.resize(max_block_frames, 0.0);
        bus_right.resize(max_block_frames, 0.0);
        let mut crossfades = Vec::new();
        crossfades.try_reserve_exact(desc.max_streams)?;

        log::debug!(
            "Streaming layer ready ({} streams x {} chunks of {} frames)",
            desc.max_streams,
            desc.buffer_count,
            desc.chunk_frames
        );
        Ok((
            Self {
                pool,
                desc: *desc,
                sample_rate,
                requests: request_tx,
                results: result_rx,
                events,
                crossfades,
                bus_left,
                bus_right,
            },
            StreamLoader::new(request_rx, result_tx),
        ))
    }

    /// Open a WAV file and start buffering it.
    pub fn create(
        &mut self,
        path: impl AsRef<Path>,
        stream_type: SourceType,
        priority: u8,
    ) -> Result<StreamId> {
        let path = path.as_ref();
        let reader = WavStreamReader::open(path).inspect_err(|e| {
            log::error!("Failed to open stream {}: {}", path.display(), e);
        })?;
        self.create_from_reader(Box::new(reader), stream_type, priority)
    }

    /// Start buffering from any [`StreamReader`].
    ///
    /// When every slot is taken, the lowest-priority inaudible stream is evicted if
    /// its priority is below `priority`.
    ///
    /// # Errors
    ///
    /// `Exhausted` when no slot can be freed, `AudioFormat` for a reader reporting a
    /// zero sample rate or channel count.
    pub fn create_from_reader(
        &mut self,
        reader: Box<dyn StreamReader>,
        stream_type: SourceType,
        priority: u8,
    ) -> Result<StreamId> {
        let format = reader.format();
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(CitySonicError::AudioFormat(format!(
                "unusable stream format {:?}",
                format
            )));
        }

        if self.pool.len() == self.pool.capacity() {
            self.evict_for(priority)?;
        }
        let capacity = self.pool.capacity();
        let (handle, stream) = self.pool.allocate().ok_or(CitySonicError::Exhausted {
            pool: "stream",
            capacity,
        })?;
        let id = StreamId(handle);

        // Chunks still loading for a previous occupant come back stale and are
        // recycled by `apply_result`.
        let chunk_samples = self.desc.chunk_frames * 2;
        let mut chunks = std::mem::take(&mut stream.chunks);
        if chunks.is_empty() {
            chunks.try_reserve_exact(self.desc.buffer_count)?;
            for _ in 0..self.desc.buffer_count {
                chunks.push(Chunk {
                    state: ChunkState::Empty,
                    data: Vec::new(),
                    frames: 0,
                    last: false,
                });
            }
        }
        for chunk in &mut chunks {
            if chunk.state == ChunkState::Ready {
                chunk.state = ChunkState::Empty;
            }
            if chunk.state == ChunkState::Empty {
                chunk.data.clear();
                chunk.data.try_reserve_exact(chunk_samples)?;
            }
            chunk.frames = 0;
            chunk.last = false;
        }

        *stream = Stream {
            stream_type,
            priority,
            reader: Some(Arc::new(Mutex::new(reader))),
            format,
            chunks,
            epoch: stream.epoch + 1,
            ..Stream::vacant()
        };

        log::debug!(
            "Created {:?} stream {} ({} Hz, {} ch, {} frames, priority {})",
            stream_type,
            id,
            format.sample_rate,
            format.channels,
            format.total_frames,
            priority
        );
        self.request_refills(id);
        self.set_state(id, StreamState::Loading);
        Ok(id)
    }

    fn evict_for(&mut self, priority: u8) -> Result<()> {
        let victim = self
            .pool
            .iter()
            .filter(|(_, s)| !s.state.is_audible() && s.priority < priority)
            .min_by_key(|(_, s)| s.priority)
            .map(|(h, _)| StreamId(h));
        match victim {
            Some(victim) => {
                log::info!(
                    "Stream pool full, evicting {} for priority {} stream",
                    victim,
                    priority
                );
                self.release(victim)
            }
            None => Err(CitySonicError::Exhausted {
                pool: "stream",
                capacity: self.pool.capacity(),
            }),
        }
    }

    fn stream(&self, id: StreamId) -> Result<&Stream> {
        self.pool
            .get(id.0)
            .ok_or_else(|| CitySonicError::InvalidHandle(id.to_string()))
    }

    fn stream_mut(&mut self, id: StreamId) -> Result<&mut Stream> {
        self.pool
            .get_mut(id.0)
            .ok_or_else(|| CitySonicError::InvalidHandle(id.to_string()))
    }

    fn set_state(&mut self, id: StreamId, new_state: StreamState) {
        let Some(stream) = self.pool.get_mut(id.0) else {
            return;
        };
        let old_state = stream.state;
        if old_state == new_state {
            return;
        }
        stream.state = new_state;
        log::debug!("{} {:?} -> {:?}", id, old_state, new_state);
        let _ = self.events.send(CitySonicEvent::StreamStateChanged {
            stream_id: id,
            old_state,
            new_state,
        });
    }

    pub fn state(&self, id: StreamId) -> Result<StreamState> {
        Ok(self.stream(id)?.state)
    }

    pub fn format(&self, id: StreamId) -> Result<StreamFormat> {
        Ok(self.stream(id)?.format)
    }

    pub fn stream_type(&self, id: StreamId) -> Result<SourceType> {
        Ok(self.stream(id)?.stream_type)
    }

    /// Frames ready to play from the current position.
    pub fn buffered_frames(&self, id: StreamId) -> Result<usize> {
        Ok(self.stream(id)?.buffered_frames())
    }

    /// Current crossfade gain of a stream; 1 outside a crossfade.
    pub fn fade_gain(&self, id: StreamId) -> Result<f32> {
        Ok(self.stream(id)?.fade.map_or(1.0, |f| f.level()))
    }

    /// Progress in [0, 1] of the crossfade a stream takes part in.
    pub fn crossfade_progress(&self, id: StreamId) -> Result<Option<f32>> {
        Ok(self.stream(id)?.fade.map(|f| f.progress()))
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Start playback.
    ///
    /// # Errors
    ///
    /// `NotReady` if the chunk at the play position has not been loaded yet. Retry
    /// after the loader has caught up.
    pub fn play(&mut self, id: StreamId) -> Result<()> {
        let stream = self.stream(id)?;
        match stream.state {
            StreamState::Playing
            | StreamState::CrossfadingIn
            | StreamState::CrossfadingOut
            | StreamState::Finishing => return Ok(()),
            StreamState::Paused => return self.resume(id),
            _ => {}
        }
        if !stream.current_ready() {
            return Err(CitySonicError::NotReady(format!("{} is still buffering", id)));
        }
        self.set_state(id, StreamState::Playing);
        Ok(())
    }

    pub fn pause(&mut self, id: StreamId) -> Result<()> {
        let stream = self.stream_mut(id)?;
        if !stream.state.is_audible() {
            return Ok(());
        }
        stream.resume_state = stream.state;
        self.set_state(id, StreamState::Paused);
        Ok(())
    }

    pub fn resume(&mut self, id: StreamId) -> Result<()> {
        let stream = self.stream(id)?;
        if stream.state != StreamState::Paused {
            return Ok(());
        }
        let resume_state = stream.resume_state;
        self.set_state(id, resume_state);
        Ok(())
    }

    /// Stop and rewind. Buffering restarts in the background so a later `play` is quick.
    pub fn stop(&mut self, id: StreamId) -> Result<()> {
        self.stream(id)?;
        self.detach_crossfade(id);
        self.stop_and_rewind(id);
        Ok(())
    }

    fn stop_and_rewind(&mut self, id: StreamId) {
        if let Some(stream) = self.pool.get_mut(id.0) {
            stream.fade = None;
            if stream.consumed {
                stream.rewind();
            }
        }
        self.set_state(id, StreamState::Stopped);
        self.request_refills(id);
    }

    /// Stop the stream and free its slot. The handle becomes stale.
    pub fn release(&mut self, id: StreamId) -> Result<()> {
        self.stream(id)?;
        self.detach_crossfade(id);
        let stream = self
            .pool
            .release(id.0)
            .ok_or_else(|| CitySonicError::InvalidHandle(id.to_string()))?;
        stream.state = StreamState::Stopped;
        stream.reader = None;
        stream.fade = None;
        stream.epoch += 1;
        log::debug!("Released {}", id);
        Ok(())
    }

    pub fn set_volume(&mut self, id: StreamId, volume: f32) -> Result<()> {
        self.stream_mut(id)?.volume = volume.max(0.0);
        Ok(())
    }

    pub fn set_pan(&mut self, id: StreamId, pan: f32) -> Result<()> {
        self.stream_mut(id)?.pan = pan.clamp(-1.0, 1.0);
        Ok(())
    }

    pub fn set_pitch(&mut self, id: StreamId, pitch: f32) -> Result<()> {
        self.stream_mut(id)?.pitch = pitch.max(0.0);
        Ok(())
    }

    /// Enable or disable looping. `region` restricts the loop to `[start, end)` frames;
    /// `None` loops the whole stream. Chunks already buffered play out as loaded.
    pub fn set_looping(
        &mut self,
        id: StreamId,
        enabled: bool,
        region: Option<(u64, Option<u64>)>,
    ) -> Result<()> {
        let stream = self.stream_mut(id)?;
        stream.looping = enabled;
        if let Some((start, end)) = region {
            stream.loop_start = start;
            stream.loop_end = end;
        }
        if enabled && stream.exhausted && stream.loops() {
            stream.exhausted = false;
            stream.fill_frame = stream.loop_start;
            if stream.state == StreamState::Finishing {
                self.set_state(id, StreamState::Playing);
            }
        }
        Ok(())
    }

    /// Fade `from` out and `to` in over `duration_frames` output frames.
    ///
    /// Each side ramps linearly from its current gain: a stream that is already
    /// playing starts from its fade level (1 outside a fade), a stream that is not
    /// audible starts from silence. When the two starting gains sum to one, as for a
    /// fresh crossfade or a reversed one, the sum stays at one throughout. On
    /// completion `from` is stopped and `to` is playing.
    ///
    /// A crossfade that either stream was already part of is superseded; its other
    /// stream keeps ramping toward its target on its own.
    ///
    /// # Errors
    ///
    /// `NotReady` if `from` is not audible or `to` has nothing buffered.
    pub fn crossfade(&mut self, from: StreamId, to: StreamId, duration_frames: u64) -> Result<()> {
        if from == to {
            return Err(CitySonicError::Configuration(
                "cannot crossfade a stream into itself".into(),
            ));
        }
        let from_state = self.stream(from)?.state;
        let to_stream = self.stream(to)?;
        if !from_state.is_audible() {
            return Err(CitySonicError::NotReady(format!("{} is not playing", from)));
        }
        if !to_stream.state.is_audible() && !to_stream.current_ready() {
            return Err(CitySonicError::NotReady(format!("{} is still buffering", to)));
        }

        let from_level = self.stream(from)?.current_gain();
        let to_level = self.stream(to)?.current_gain();
        self.detach_crossfade(from);
        self.detach_crossfade(to);

        let duration = duration_frames.max(1);
        for (id, start, target) in [(from, from_level, 0.0), (to, to_level, 1.0)] {
            self.stream_mut(id)?.fade = Some(StreamFade {
                start,
                target,
                duration,
                elapsed: 0,
            });
        }
        self.crossfades.push((from, to));
        self.set_state(from, StreamState::CrossfadingOut);
        self.set_state(to, StreamState::CrossfadingIn);
        log::debug!("Crossfading {} -> {} over {} frames", from, to, duration);
        Ok(())
    }

    /// Drop the crossfade pairing `id` takes part in. Both streams keep their ramps;
    /// each settles on its own when its ramp completes.
    fn detach_crossfade(&mut self, id: StreamId) {
        self.crossfades.retain(|&(from, to)| from != id && to != id);
    }

    /// A completed ramp toward silence stops the stream; one toward full gain leaves it
    /// playing.
    fn settle_fade(&mut self, id: StreamId) {
        let Some(stream) = self.pool.get_mut(id.0) else {
            return;
        };
        let Some(fade) = stream.fade.take() else {
            return;
        };
        if fade.target <= 0.0 {
            self.stop_and_rewind(id);
        } else if stream.state == StreamState::CrossfadingIn {
            self.set_state(id, StreamState::Playing);
        } else if stream.state == StreamState::Paused {
            stream.resume_state = StreamState::Playing;
        }
    }

    /// Apply finished loads and request refills for chunks that have been consumed.
    pub fn check_buffer_levels(&mut self) {
        while let Ok(result) = self.results.try_recv() {
            self.apply_result(result);
        }

        for index in 0..self.pool.capacity() {
            let Some(handle) = self.pool.handle_at(index) else {
                continue;
            };
            let id = StreamId(handle);
            let Some(stream) = self.pool.get(handle) else {
                continue;
            };
            if stream.exhausted || stream.reader.is_none() {
                continue;
            }
            let remaining = if stream.current_ready() {
                stream.chunks[stream.current].frames as f64 - stream.position
            } else {
                0.0
            };
            let prefill = !stream.state.is_audible() && stream.state != StreamState::Paused;
            if prefill || remaining < self.desc.low_water_frames as f64 {
                self.request_refills(id);
            }
        }
    }

    fn apply_result(&mut self, result: LoadResult) {
        let id = result.stream;
        // Epochs keep counting across occupants of a slot, so a result for a released
        // stream is recognised as stale and its buffer goes back to the slot.
        let Some(stream) = self.pool.value_at_mut(id.index()) else {
            return;
        };
        let Some(chunk) = stream.chunks.get_mut(result.chunk) else {
            return;
        };
        chunk.data = result.buffer;
        if result.epoch != stream.epoch {
            chunk.state = ChunkState::Empty;
            return;
        }

        if let Some(error) = result.error {
            chunk.state = ChunkState::Empty;
            stream.exhausted = true;
            let _ = self.events.send(CitySonicEvent::StreamIoError {
                stream_id: id,
                error,
            });
            self.detach_crossfade(id);
            if let Some(stream) = self.pool.get_mut(id.0) {
                stream.fade = None;
            }
            self.set_state(id, StreamState::Stopped);
            return;
        }

        chunk.frames = result.frames;
        chunk.state = ChunkState::Ready;
        if stream.state == StreamState::Loading {
            self.set_state(id, StreamState::Buffering);
        }
    }

    /// Issue loads for consecutive empty chunks starting at the fill position.
    fn request_refills(&mut self, id: StreamId) {
        let Some(stream) = self.pool.get_mut(id.0) else {
            return;
        };
        let Some(reader) = stream.reader.clone() else {
            return;
        };
        let count = stream.chunks.len();
        let end = stream.data_end();
        for _ in 0..count {
            if stream.exhausted {
                break;
            }
            let index = stream.fill_index;
            if stream.chunks[index].state != ChunkState::Empty {
                break;
            }
            let frames = (end.saturating_sub(stream.fill_frame)).min(self.desc.chunk_frames as u64)
                as usize;
            let last = stream.fill_frame + frames as u64 >= end;
            let chunk = &mut stream.chunks[index];
            chunk.state = ChunkState::Loading;
            chunk.last = last;
            chunk.frames = 0;

            let request = LoadRequest {
                stream: id,
                chunk: index,
                epoch: stream.epoch,
                start_frame: stream.fill_frame,
                frames,
                buffer: std::mem::take(&mut chunk.data),
                reader: reader.clone(),
            };
            if self.requests.send(request).is_err() {
                log::error!("Stream loader gone, cannot refill {}", id);
                stream.chunks[index].state = ChunkState::Empty;
                return;
            }

            stream.fill_frame += frames as u64;
            stream.fill_index = (index + 1) % count;
            if last {
                if stream.loops() {
                    stream.fill_frame = stream.loop_start;
                } else {
                    stream.exhausted = true;
                }
            }
        }
    }

    /// Mix every audible stream into the layer's stereo bus and return it.
    pub fn render(&mut self, frames: usize) -> (&[f32], &[f32]) {
        let frames = frames.min(self.bus_left.len());
        self.bus_left[..frames].fill(0.0);
        self.bus_right[..frames].fill(0.0);

        for index in 0..self.pool.capacity() {
            let Some(handle) = self.pool.handle_at(index) else {
                continue;
            };
            let id = StreamId(handle);
            let audible = self.pool.get(handle).is_some_and(|s| s.state.is_audible());
            if audible {
                let advancing = self.fade_advancing(id);
                self.render_stream(id, frames, advancing);
            }
        }
        self.advance_fades(frames as u64);

        (&self.bus_left[..frames], &self.bus_right[..frames])
    }

    /// A crossfade only progresses while neither side is paused. A ramp left over from
    /// a superseded crossfade progresses while its own stream is not paused.
    fn fade_advancing(&self, id: StreamId) -> bool {
        let unpaused = |s: &StreamId| {
            self.pool
                .get(s.0)
                .is_some_and(|s| s.state != StreamState::Paused)
        };
        match self
            .crossfades
            .iter()
            .find(|&&(from, to)| from == id || to == id)
        {
            Some((from, to)) => unpaused(from) && unpaused(to),
            None => unpaused(&id),
        }
    }

    fn render_stream(&mut self, id: StreamId, frames: usize, advancing: bool) {
        let world_rate = self.sample_rate as f64;
        let Some(stream) = self.pool.get_mut(id.0) else {
            return;
        };
        let step = stream.format.sample_rate as f64 / world_rate * stream.pitch as f64;
        let (pan_l, pan_r) = pan_gains(stream.pan);
        let volume = stream.volume;
        let fade = stream.fade;
        let count = stream.chunks.len();

        let mut loops = 0;
        let mut finished = false;
        let mut starved_frames = 0;
        let mut reached_last = false;

        // Zero-length chunks (empty data) are skipped before the first read.
        match stream.advance_chunks() {
            ChunkAdvance::Looped => loops += 1,
            ChunkAdvance::Finished => finished = true,
            ChunkAdvance::Stayed => {}
        }

        let mut i = 0;
        while i < frames && !finished {
            if !stream.current_ready() {
                starved_frames = frames - i;
                break;
            }
            let chunk = &stream.chunks[stream.current];
            reached_last |= chunk.last;
            let idx = stream.position as usize;
            let frac = (stream.position - idx as f64) as f32;
            let (l0, r0) = (chunk.data[idx * 2], chunk.data[idx * 2 + 1]);
            let (l1, r1) = if idx + 1 < chunk.frames {
                (chunk.data[idx * 2 + 2], chunk.data[idx * 2 + 3])
            } else {
                let next = &stream.chunks[(stream.current + 1) % count];
                if !chunk.last && next.state == ChunkState::Ready && next.frames > 0 {
                    (next.data[0], next.data[1])
                } else {
                    (l0, r0)
                }
            };

            let offset = if advancing { i as u64 } else { 0 };
            let gain = volume * fade.map_or(1.0, |f| f.gain_at(offset));
            self.bus_left[i] += (l0 + (l1 - l0) * frac) * gain * pan_l;
            self.bus_right[i] += (r0 + (r1 - r0) * frac) * gain * pan_r;
            stream.position += step;
            stream.consumed = true;
            i += 1;

            match stream.advance_chunks() {
                ChunkAdvance::Looped => loops += 1,
                ChunkAdvance::Finished => finished = true,
                ChunkAdvance::Stayed => {}
            }
        }

        if starved_frames > 0 {
            if !stream.starving {
                stream.starving = true;
                log::warn!("{} starved for {} frames", id, starved_frames);
                let _ = self.events.send(CitySonicEvent::StreamStarved {
                    stream_id: id,
                    missing_frames: starved_frames,
                });
            }
        } else {
            stream.starving = false;
        }

        let loops_now = stream.loops();
        for _ in 0..loops {
            let _ = self.events.send(CitySonicEvent::StreamLooped { stream_id: id });
        }
        if finished {
            self.detach_crossfade(id);
            self.stop_and_rewind(id);
            log::debug!("{} finished", id);
            let _ = self.events.send(CitySonicEvent::StreamFinished { stream_id: id });
        } else if reached_last && !loops_now {
            let state = self.pool.get(id.0).map(|s| s.state);
            if state == Some(StreamState::Playing) {
                self.set_state(id, StreamState::Finishing);
            }
        }
    }

    fn advance_fades(&mut self, frames: u64) {
        for index in 0..self.pool.capacity() {
            let Some(handle) = self.pool.handle_at(index) else {
                continue;
            };
            let id = StreamId(handle);
            let advancing = self.fade_advancing(id);
            let Some(fade) = self.pool.get_mut(handle).and_then(|s| s.fade.as_mut()) else {
                continue;
            };
            if advancing {
                fade.elapsed = (fade.elapsed + frames).min(fade.duration);
            }
            if fade.is_complete() {
                self.settle_fade(id);
            }
        }

        let mut i = 0;
        while i < self.crossfades.len() {
            let (from, to) = self.crossfades[i];
            let settled = [from, to]
                .iter()
                .all(|s| self.pool.get(s.0).is_none_or(|s| s.fade.is_none()));
            if settled {
                self.crossfades.swap_remove(i);
                log::debug!("Crossfade {} -> {} complete", from, to);
                let _ = self
                    .events
                    .send(CitySonicEvent::CrossfadeCompleted { from, to });
            } else {
                i += 1;
            }
        }
    }
}

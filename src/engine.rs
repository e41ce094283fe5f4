use crate::config::CitySonicWorldDesc;
use crate::error::{CitySonicError, Result};
use crate::events::CitySonicEvent;
use crate::governor::FormatNegotiator;
use crate::renderer::AudioRenderer;
use crate::ring::FrameConsumer;
use crate::world::CitySonicWorld;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Device format most recently requested by the performance governor.
///
/// The render sample rate is fixed when the world is created, so only the buffer
/// size is applied, on the next [`CitySonicEngine::start`]. The rate is recorded for
/// hosts that want to rebuild the world at a lower rate.
#[derive(Debug, Default)]
pub struct DeviceFormatRequest {
    sample_rate: AtomicU32,
    buffer_frames: AtomicUsize,
    requests: AtomicU64,
}

impl DeviceFormatRequest {
    /// `(sample_rate, buffer_frames)` of the latest request, if any.
    pub fn requested_format(&self) -> Option<(u32, usize)> {
        if self.requests.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some((
            self.sample_rate.load(Ordering::Relaxed),
            self.buffer_frames.load(Ordering::Relaxed),
        ))
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

impl FormatNegotiator for DeviceFormatRequest {
    fn request_format(&self, sample_rate: u32, buffer_frames: usize) {
        self.sample_rate.store(sample_rate, Ordering::Relaxed);
        self.buffer_frames.store(buffer_frames, Ordering::Relaxed);
        self.requests.fetch_add(1, Ordering::Release);
        log::info!(
            "Device format requested: {} Hz, {} frame buffer",
            sample_rate,
            buffer_frames
        );
    }
}

/// Audio engine that binds a world's renderer to the default output device.
///
/// Two threads run while the engine is started:
///
/// - **Mixing thread** (`citysonic-mixer`): renders a block whenever the output ring
///   has room for one
/// - **Device callback** (owned by cpal): drains the ring, substituting silence and
///   counting an underrun when it runs dry. It never blocks, allocates or logs
pub struct CitySonicEngine {
    desc: CitySonicWorldDesc,
    stream: Option<cpal::Stream>,
    is_running: Arc<AtomicBool>,
    frames_played: Arc<AtomicU64>,
    output: Arc<Mutex<FrameConsumer>>,
    renderer: Option<AudioRenderer>,
    mixing_thread: Option<JoinHandle<AudioRenderer>>,
    events: Sender<CitySonicEvent>,
    format_request: Arc<DeviceFormatRequest>,
}

impl CitySonicEngine {
    /// Take over rendering for `world`.
    ///
    /// From here on the world's own [`render_block`](CitySonicWorld::render_block)
    /// returns `NotReady`; every other world operation keeps working.
    ///
    /// # Errors
    ///
    /// Returns `NotReady` if another engine already owns the world's renderer.
    pub fn new(world: &mut CitySonicWorld) -> Result<Self> {
        let (mut renderer, output) = world.take_render_side()?;
        let format_request = Arc::new(DeviceFormatRequest::default());
        renderer.set_format_negotiator(format_request.clone());

        Ok(Self {
            desc: world.desc().clone(),
            stream: None,
            is_running: Arc::new(AtomicBool::new(false)),
            frames_played: Arc::new(AtomicU64::new(0)),
            output: Arc::new(Mutex::new(output)),
            renderer: Some(renderer),
            mixing_thread: None,
            events: world.event_sender(),
            format_request,
        })
    }

    /// Start the mixing thread and the device stream.
    ///
    /// # Errors
    ///
    /// Returns `AudioDevice` if there is no output device or the stream cannot be
    /// built or started, `AudioFormat` for device sample formats other than
    /// f32/i16/u16, and `Engine` if the mixing thread cannot be spawned.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let renderer = self.renderer.take().ok_or_else(|| {
            CitySonicError::Engine("Renderer lost after a failed start".into())
        })?;

        let stream = match self.build_stream() {
            Ok(stream) => stream,
            Err(e) => {
                self.renderer = Some(renderer);
                return Err(e);
            }
        };

        self.is_running.store(true, Ordering::Release);
        match spawn_mixing_thread(renderer, self.is_running.clone(), self.events.clone()) {
            Ok(handle) => self.mixing_thread = Some(handle),
            Err(e) => {
                self.is_running.store(false, Ordering::Release);
                return Err(e);
            }
        }

        if let Err(e) = stream.play() {
            self.join_mixing_thread();
            return Err(CitySonicError::AudioDevice(format!(
                "Failed to start stream: {}",
                e
            )));
        }
        self.stream = Some(stream);

        log::info!(
            "Audio engine started: {} Hz, {} channels, block {}",
            self.desc.sample_rate,
            self.desc.channels,
            self.desc.block_size
        );
        let _ = self.events.send(CitySonicEvent::EngineStarted);
        Ok(())
    }

    /// Stop the device stream and the mixing thread. The engine can be started again.
    pub fn stop(&mut self) -> Result<()> {
        let was_running = self.stream.is_some() || self.mixing_thread.is_some();
        if let Some(stream) = self.stream.take() {
            self.is_running.store(false, Ordering::Release);
            drop(stream);
        }
        self.join_mixing_thread();
        if !was_running {
            return Ok(());
        }
        if self.renderer.is_none() {
            return Err(CitySonicError::Engine("Mixing thread panicked".into()));
        }
        log::info!(
            "Audio engine stopped after {} frames",
            self.frames_played()
        );
        let _ = self.events.send(CitySonicEvent::EngineStopped);
        Ok(())
    }

    /// Check if the engine is currently running
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Frames of real (non-silence) audio delivered to the device since creation.
    pub fn frames_played(&self) -> u64 {
        self.frames_played.load(Ordering::Relaxed)
    }

    /// Get the engine configuration
    pub fn config(&self) -> &CitySonicWorldDesc {
        &self.desc
    }

    /// The governor's latest device format request.
    pub fn format_request(&self) -> &DeviceFormatRequest {
        &self.format_request
    }

    fn join_mixing_thread(&mut self) {
        self.is_running.store(false, Ordering::Release);
        if let Some(handle) = self.mixing_thread.take() {
            match handle.join() {
                Ok(renderer) => self.renderer = Some(renderer),
                Err(_) => log::error!("Mixing thread panicked"),
            }
        }
    }

    fn build_stream(&self) -> Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or_else(|| {
            CitySonicError::AudioDevice("No default output device available".into())
        })?;

        let buffer_frames = self
            .format_request
            .requested_format()
            .map_or(self.desc.block_size, |(_, frames)| frames);
        let config = cpal::StreamConfig {
            channels: self.desc.channels,
            sample_rate: cpal::SampleRate(self.desc.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(buffer_frames as u32),
        };

        let default_config = device.default_output_config().map_err(|e| {
            CitySonicError::AudioDevice(format!("Failed to get default config: {}", e))
        })?;

        match default_config.sample_format() {
            cpal::SampleFormat::F32 => self.create_stream::<f32>(&device, &config),
            cpal::SampleFormat::I16 => self.create_stream::<i16>(&device, &config),
            cpal::SampleFormat::U16 => self.create_stream::<u16>(&device, &config),
            other => Err(CitySonicError::AudioFormat(format!(
                "Unsupported sample format {:?}",
                other
            ))),
        }
    }

    /// Create a typed audio stream whose callback drains the output ring.
    fn create_stream<T>(
        &self,
        device: &cpal::Device,
        config: &cpal::StreamConfig,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = config.channels as usize;
        let is_running = self.is_running.clone();
        let frames_played = self.frames_played.clone();
        let output = self.output.clone();
        // Sized for generous device periods; grown only if a device asks for more.
        let mut scratch = vec![0.0f32; self.desc.ring_capacity_frames.max(4096) * channels];

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    if scratch.len() < data.len() {
                        scratch.resize(data.len(), 0.0);
                    }
                    let buffer = &mut scratch[..data.len()];

                    let frames = if is_running.load(Ordering::Acquire) {
                        match output.try_lock() {
                            Ok(mut consumer) => consumer.read_interleaved(buffer, channels),
                            Err(_) => {
                                buffer.fill(0.0);
                                0
                            }
                        }
                    } else {
                        buffer.fill(0.0);
                        0
                    };

                    for (sample, &value) in data.iter_mut().zip(buffer.iter()) {
                        *sample = T::from_sample(value);
                    }
                    frames_played.fetch_add(frames as u64, Ordering::Relaxed);
                },
                move |err| {
                    log::error!("Audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| CitySonicError::AudioDevice(format!("Failed to build stream: {}", e)))
    }
}

impl Drop for CitySonicEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Render blocks on a dedicated thread until `running` clears. The renderer is handed
/// back through the join handle.
///
/// A render error ends the thread: it is logged, reported as
/// [`CitySonicEvent::EngineError`], and the device falls back to silence.
pub(crate) fn spawn_mixing_thread(
    mut renderer: AudioRenderer,
    running: Arc<AtomicBool>,
    events: Sender<CitySonicEvent>,
) -> Result<JoinHandle<AudioRenderer>> {
    let block = renderer.block_size();
    let idle = Duration::from_secs_f64(block as f64 / renderer.sample_rate() as f64 / 4.0);

    std::thread::Builder::new()
        .name("citysonic-mixer".into())
        .spawn(move || {
            log::debug!("Mixing thread started");
            while running.load(Ordering::Acquire) {
                if renderer.output_space() < block {
                    std::thread::sleep(idle);
                    continue;
                }
                if let Err(e) = renderer.render_block() {
                    log::error!("Render failed, stopping mixing thread: {}", e);
                    let _ = events.send(CitySonicEvent::EngineError {
                        error: e.to_string(),
                    });
                    running.store(false, Ordering::Release);
                }
            }
            log::debug!(
                "Mixing thread stopped after {} blocks",
                renderer.blocks_rendered()
            );
            renderer
        })
        .map_err(|e| CitySonicError::Engine(format!("Failed to spawn mixing thread: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HrtfMode, StreamIoMode};

    fn desc() -> CitySonicWorldDesc {
        CitySonicWorldDesc::new()
            .block_size(256)
            .ring_capacity_frames(2048)
            .hrtf_mode(HrtfMode::Disabled)
            .stream_io_mode(StreamIoMode::Manual)
    }

    #[test]
    fn test_format_request_records_latest() {
        let request = DeviceFormatRequest::default();
        assert_eq!(request.requested_format(), None);
        request.request_format(44100, 512);
        request.request_format(22050, 1024);
        assert_eq!(request.requested_format(), Some((22050, 1024)));
        assert_eq!(request.request_count(), 2);
    }

    #[test]
    fn test_engine_takes_render_side() {
        let mut world = CitySonicWorld::new(desc()).unwrap();
        let engine = CitySonicEngine::new(&mut world).unwrap();
        assert!(!engine.is_running());
        assert!(matches!(
            world.render_block(),
            Err(CitySonicError::NotReady(_))
        ));
        assert!(CitySonicEngine::new(&mut world).is_err());
    }

    #[test]
    fn test_mixing_thread_fills_ring_and_returns_renderer() {
        let mut world = CitySonicWorld::new(desc()).unwrap();
        let (renderer, output) = world.take_render_side().unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let handle =
            spawn_mixing_thread(renderer, running.clone(), world.event_sender()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while output.available() < 1024 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        running.store(false, Ordering::Release);
        let renderer = handle.join().unwrap();

        assert!(renderer.blocks_rendered() >= 4);
        // Ring holds 2047 frames; the thread only renders whole blocks that fit.
        assert!(output.available() <= 2047);
        assert!(output.available() >= 1024);
    }
}

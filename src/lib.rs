//! Real-time spatial audio for large city simulations.
//!
//! A [`CitySonicWorld`] holds every sound source, stream and the listener. Each audio
//! block the renderer spatializes up to a few hundred sources (HRTF convolution or
//! stereo panning, distance attenuation, Doppler, occlusion), mixes them with the
//! streamed music and ambience, runs the zone reverb, limits the result and hands it
//! to the device through a lock-free ring. A performance governor watches render
//! time and steps the quality tier up or down to stay inside the block budget.
//!
//! Rendering can be driven by a [`CitySonicEngine`] (cpal output stream plus a
//! mixing thread) or synchronously with [`CitySonicWorld::render_block`].

pub mod audio_data;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod governor;
pub mod math;
pub mod mixer;
pub mod playback;
pub mod registry;
pub mod renderer;
pub mod reverb;
pub mod ring;
pub mod scene;
pub mod slots;
pub mod spatial;
pub mod streaming;
pub mod world;

pub use audio_data::CitySonicAudioData;
pub use config::CitySonicWorldDesc;
pub use engine::{CitySonicEngine, DeviceFormatRequest};
pub use error::{CitySonicError, Result};
pub use events::{CitySonicEvent, RenderTimingEvent};
pub use governor::{FormatNegotiator, PerformanceStats, QualityTier};
pub use math::{Pose, Quat, Vec3};
pub use mixer::PeakLevels;
pub use playback::PlayState;
pub use registry::{SourceId, SourceType};
pub use renderer::AudioRenderer;
pub use reverb::{ReverbZone, ReverbZoneType, ZoneId};
pub use scene::{AudioMaterial, MaterialTable, OcclusionQuery, RayHit, RayTracer};
pub use spatial::Listener;
pub use streaming::{StreamId, StreamReader, StreamState};
pub use world::CitySonicWorld;

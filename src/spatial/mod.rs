//! Listener-relative spatialization: HRTF table, per-source processing, listener.

pub mod hrtf;
mod listener;
mod processor;

pub use hrtf::{HRTF_TAPS, HrtfFilter, HrtfTable};
pub use listener::{DEFAULT_SPEED_OF_SOUND, Listener};
pub use processor::{
    SourceSpatialState, SpatialParams, SpatialProcessor, distance_attenuation, doppler_pitch,
    listener_angles, pan_gains,
};

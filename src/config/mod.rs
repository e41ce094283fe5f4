//! Configuration for CitySonic

mod world_desc;

pub use world_desc::{
    CitySonicWorldDesc, DistanceModel, DopplerRange, GovernorDesc, HrtfMode, MixerDesc,
    ReverbDesc, StreamIoMode, StreamingDesc,
};

//! Scene geometry seams used for occlusion.
//!
//! Geometry itself lives in the game. The engine only asks one question per source
//! per block: how much of the direct path between source and listener survives?
//! That question is the [`OcclusionQuery`] capability. Two answers ship with the
//! crate:
//!
//! 1. [`DistanceOcclusion`] - a deterministic model that muffles far sources, used
//!    when no geometry is wired in
//! 2. [`RayTracedOcclusion`] - casts the direct path through a game-provided
//!    [`RayTracer`] and multiplies the transmission of every surface it crosses,
//!    looked up in a [`MaterialTable`]

mod material;
mod occlusion;
mod ray_tracer;

pub use material::{AudioMaterial, MaterialTable};
pub use occlusion::{DistanceOcclusion, OcclusionQuery, RayTracedOcclusion, Unoccluded};
pub use ray_tracer::{RayHit, RayTracer};

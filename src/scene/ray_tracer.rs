//! Ray casting callback supplied by the game.

use crate::math::Vec3;

/// Closest intersection along a ray.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub hit: bool,
    /// Distance from the ray origin, in world units. Meaningless on a miss.
    pub distance: f32,
    /// Index into the [`MaterialTable`](super::MaterialTable).
    pub material_index: u8,
}

impl RayHit {
    pub fn miss() -> Self {
        Self {
            hit: false,
            distance: 0.0,
            material_index: 0,
        }
    }

    pub fn new(distance: f32, material_index: u8) -> Self {
        Self {
            hit: true,
            distance,
            material_index,
        }
    }
}

impl Default for RayHit {
    fn default() -> Self {
        Self::miss()
    }
}

/// Geometry query implemented by the game's collision world.
///
/// Called from the mixing thread, at most a few times per source per block, so it
/// must be `Send + Sync` and should avoid blocking.
pub trait RayTracer: Send + Sync {
    /// Closest hit within `max_distance` along a normalized `direction`, or a miss.
    fn cast_ray(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> RayHit;

    /// Called once per block before any casts, e.g. to refresh acceleration structures.
    fn begin_block(&mut self) {}
}

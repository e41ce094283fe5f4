use crate::math::Vec3;
use crate::scene::{MaterialTable, RayTracer};

/// Occlusion capability consulted once per spatial source per block.
///
/// Returns the fraction of the direct path that survives, in [0, 1] (1 = clear).
pub trait OcclusionQuery: Send + Sync {
    fn occlusion(&self, source: Vec3, listener: Vec3) -> f32;

    /// Called once per block before any queries.
    fn begin_block(&mut self) {}
}

/// Never occludes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unoccluded;

impl OcclusionQuery for Unoccluded {
    fn occlusion(&self, _source: Vec3, _listener: Vec3) -> f32 {
        1.0
    }
}

/// Deterministic stand-in for geometry: sources are progressively muffled between
/// `clear_distance` and `full_distance`, down to `1 - strength`.
///
/// Approximates the growing chance that buildings sit between a distant source and
/// the listener in a dense city without casting a single ray.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceOcclusion {
    pub clear_distance: f32,
    pub full_distance: f32,
    pub strength: f32,
}

impl Default for DistanceOcclusion {
    fn default() -> Self {
        Self {
            clear_distance: 50.0,
            full_distance: 600.0,
            strength: 0.3,
        }
    }
}

impl OcclusionQuery for DistanceOcclusion {
    fn occlusion(&self, source: Vec3, listener: Vec3) -> f32 {
        let distance = source.distance(listener);
        let span = (self.full_distance - self.clear_distance).max(f32::EPSILON);
        let t = ((distance - self.clear_distance) / span).clamp(0.0, 1.0);
        let smooth = t * t * (3.0 - 2.0 * t);
        (1.0 - self.strength.clamp(0.0, 1.0) * smooth).clamp(0.0, 1.0)
    }
}

/// Walks the listener-to-source segment through a [`RayTracer`], multiplying in the
/// transmission of each surface crossed.
pub struct RayTracedOcclusion<T: RayTracer> {
    tracer: T,
    materials: MaterialTable,
    max_surfaces: usize,
}

impl<T: RayTracer> RayTracedOcclusion<T> {
    /// Surfaces hit this close to the previous one are treated as the same wall.
    const SURFACE_EPSILON: f32 = 1e-3;

    pub fn new(tracer: T, materials: MaterialTable) -> Self {
        Self {
            tracer,
            materials,
            max_surfaces: 4,
        }
    }

    /// Stop after this many surfaces; anything beyond is treated as fully blocked.
    pub fn max_surfaces(mut self, count: usize) -> Self {
        self.max_surfaces = count.max(1);
        self
    }

    pub fn tracer(&self) -> &T {
        &self.tracer
    }
}

impl<T: RayTracer> OcclusionQuery for RayTracedOcclusion<T> {
    fn occlusion(&self, source: Vec3, listener: Vec3) -> f32 {
        let to_source = source - listener;
        let length = to_source.length();
        let Some(direction) = to_source.try_normalize() else {
            return 1.0;
        };

        let mut factor = 1.0;
        let mut travelled = 0.0;
        for _ in 0..self.max_surfaces {
            let origin = listener + direction * travelled;
            let hit = self.tracer.cast_ray(origin, direction, length - travelled);
            if !hit.hit || travelled + hit.distance >= length {
                return factor;
            }
            factor *= self.materials.get_or_generic(hit.material_index).transmission;
            travelled += hit.distance + Self::SURFACE_EPSILON;
        }
        // Hit budget exhausted with geometry still in the way.
        0.0
    }

    fn begin_block(&mut self) {
        self.tracer.begin_block();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{AudioMaterial, RayHit};

    /// Infinite planes perpendicular to X at the given coordinates.
    struct Walls {
        xs: Vec<f32>,
        material: u8,
    }

    impl RayTracer for Walls {
        fn cast_ray(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> RayHit {
            if direction.x.abs() < 1e-6 {
                return RayHit::miss();
            }
            self.xs
                .iter()
                .map(|&x| (x - origin.x) / direction.x)
                .filter(|&t| t > 0.0 && t <= max_distance)
                .fold(None, |best: Option<f32>, t| Some(best.map_or(t, |b| b.min(t))))
                .map_or(RayHit::miss(), |t| RayHit::new(t, self.material))
        }
    }

    #[test]
    fn test_unoccluded() {
        assert_eq!(Unoccluded.occlusion(Vec3::ZERO, Vec3::X * 100.0), 1.0);
    }

    #[test]
    fn test_distance_occlusion_ramps() {
        let model = DistanceOcclusion::default();
        assert_eq!(model.occlusion(Vec3::new(10.0, 0.0, 0.0), Vec3::ZERO), 1.0);
        let mid = model.occlusion(Vec3::new(325.0, 0.0, 0.0), Vec3::ZERO);
        assert!(mid < 1.0 && mid > 0.7);
        let far = model.occlusion(Vec3::new(5000.0, 0.0, 0.0), Vec3::ZERO);
        assert!((far - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_ray_traced_occlusion_multiplies_transmission() {
        let mut materials = MaterialTable::new();
        let glass = materials.add(AudioMaterial::GLASS).unwrap();
        let query = RayTracedOcclusion::new(
            Walls {
                xs: vec![2.0, 4.0],
                material: glass,
            },
            materials,
        );

        let clear = query.occlusion(Vec3::new(1.0, 0.0, 0.0), Vec3::ZERO);
        assert_eq!(clear, 1.0);

        let one_wall = query.occlusion(Vec3::new(3.0, 0.0, 0.0), Vec3::ZERO);
        assert!((one_wall - 0.45).abs() < 1e-6);

        let two_walls = query.occlusion(Vec3::new(10.0, 0.0, 0.0), Vec3::ZERO);
        assert!((two_walls - 0.45 * 0.45).abs() < 1e-6);
    }

    #[test]
    fn test_surface_budget_blocks_completely() {
        let query = RayTracedOcclusion::new(
            Walls {
                xs: vec![1.0, 2.0, 3.0],
                material: 0,
            },
            MaterialTable::with_presets(),
        )
        .max_surfaces(2);
        assert_eq!(query.occlusion(Vec3::new(10.0, 0.0, 0.0), Vec3::ZERO), 0.0);
    }
}

//! Math types for CitySonic

pub use glam::{Quat, Vec3};

/// Position and orientation of an object in world space.
///
/// The convention is right-handed with -Z forward and +Y up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Pose {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    pub fn identity() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
        }
    }

    pub fn forward(&self) -> Vec3 {
        self.rotation * (-Vec3::Z)
    }

    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }

    pub fn right(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    /// Orthonormal basis of this pose as (forward, up, right).
    pub fn basis(&self) -> Basis {
        Basis {
            forward: self.forward(),
            up: self.up(),
            right: self.right(),
        }
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

/// Orthonormal forward/up/right frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Basis {
    pub forward: Vec3,
    pub up: Vec3,
    pub right: Vec3,
}

impl Basis {
    /// Builds a frame from a forward and an approximate up vector.
    ///
    /// `right` is derived as `forward × up` and `up` is recomputed from the other two
    /// so the result stays orthonormal even when the inputs are slightly skewed.
    /// Returns `None` when either vector is degenerate or they are parallel.
    pub fn from_forward_up(forward: Vec3, up: Vec3) -> Option<Self> {
        let forward = forward.try_normalize()?;
        let right = forward.cross(up).try_normalize()?;
        let up = right.cross(forward);
        Some(Self { forward, up, right })
    }
}

impl Default for Basis {
    fn default() -> Self {
        Self {
            forward: Vec3::NEG_Z,
            up: Vec3::Y,
            right: Vec3::X,
        }
    }
}

#[inline]
pub(crate) fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

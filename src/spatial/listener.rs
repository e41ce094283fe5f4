use crate::error::{CitySonicError, Result};
use crate::math::{Basis, Pose, Vec3};

pub const DEFAULT_SPEED_OF_SOUND: f32 = 343.3;

/// The single pair of ears every spatial source is rendered for.
///
/// Game code mutates it between blocks; the renderer copies it once at the start of
/// each block, so all sources in a block see the same listener.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Listener {
    pub position: Vec3,
    pub basis: Basis,
    pub velocity: Vec3,
    /// Final gain applied to the whole mix, in [0, 1].
    pub master_volume: f32,
    /// World units to metres.
    pub distance_factor: f32,
    /// Doppler strength; 0 disables pitch shifting.
    pub doppler_factor: f32,
    pub speed_of_sound: f32,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            basis: Basis::default(),
            velocity: Vec3::ZERO,
            master_volume: 1.0,
            distance_factor: 1.0,
            doppler_factor: 1.0,
            speed_of_sound: DEFAULT_SPEED_OF_SOUND,
        }
    }
}

impl Listener {
    /// Set position and orientation. `right` is derived from `forward × up`.
    ///
    /// # Errors
    ///
    /// `Configuration` when `forward` and `up` are degenerate or parallel; the listener
    /// is left untouched.
    pub fn set_orientation(&mut self, position: Vec3, forward: Vec3, up: Vec3) -> Result<()> {
        let basis = Basis::from_forward_up(forward, up).ok_or_else(|| {
            CitySonicError::Configuration(format!(
                "listener forward {:?} and up {:?} do not span a frame",
                forward, up
            ))
        })?;
        self.position = position;
        self.basis = basis;
        Ok(())
    }

    pub fn set_pose(&mut self, pose: Pose) {
        self.position = pose.position;
        self.basis = pose.basis();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_listener_faces_negative_z() {
        let listener = Listener::default();
        assert_eq!(listener.basis.forward, Vec3::NEG_Z);
        assert_eq!(listener.basis.right, Vec3::X);
        assert_eq!(listener.speed_of_sound, 343.3);
    }

    #[test]
    fn test_set_orientation_rejects_parallel_vectors() {
        let mut listener = Listener::default();
        assert!(
            listener
                .set_orientation(Vec3::ONE, Vec3::Y, Vec3::Y * 2.0)
                .is_err()
        );
        assert_eq!(listener.position, Vec3::ZERO);
    }

    #[test]
    fn test_set_orientation_facing_positive_x() {
        let mut listener = Listener::default();
        listener
            .set_orientation(Vec3::new(1.0, 2.0, 3.0), Vec3::X, Vec3::Y)
            .unwrap();
        assert!((listener.basis.right - Vec3::Z).length() < 1e-6);
        assert_eq!(listener.position, Vec3::new(1.0, 2.0, 3.0));
    }
}

//! Rigid body transforms.
//!
//! `SE3` is direction agnostic. The `CameraToWorld` and `WorldToCamera`
//! wrappers carry the direction in the type so a world point can never be
//! transformed with the wrong matrix.

use std::ops::Mul;

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

/// A rigid transform `x' = R x + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self::new(UnitQuaternion::identity(), Vector3::zeros())
    }

    /// Build from a rotation matrix (re-orthonormalized) and a translation.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rotation = Rotation3::from_matrix(&rotation);
        Self::new(UnitQuaternion::from_rotation_matrix(&rotation), translation)
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self::new(rotation, -(rotation * self.translation))
    }

    #[inline]
    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    #[inline]
    pub fn transform_vector(&self, vector: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * vector
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }
}

impl Mul for SE3 {
    type Output = SE3;

    fn mul(self, rhs: SE3) -> SE3 {
        SE3::new(
            self.rotation * rhs.rotation,
            self.rotation * rhs.translation + self.translation,
        )
    }
}

/// Transform from the camera frame to the world frame (the camera pose).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraToWorld(pub SE3);

/// Transform from the world frame to the camera frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldToCamera(pub SE3);

impl CameraToWorld {
    pub fn inverse(&self) -> WorldToCamera {
        WorldToCamera(self.0.inverse())
    }

    /// Camera center in world coordinates.
    pub fn camera_position(&self) -> Vector3<f64> {
        self.0.translation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.0.rotation_matrix()
    }
}

impl WorldToCamera {
    pub fn inverse(&self) -> CameraToWorld {
        CameraToWorld(self.0.inverse())
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.0.rotation_matrix()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_inverse_round_trip() {
        let t = SE3::new(
            UnitQuaternion::from_euler_angles(0.1, -0.4, 0.7),
            Vector3::new(100.0, -20.0, 35.0),
        );
        let p = Vector3::new(1.0, 2.0, 3.0);

        let back = t.inverse().transform_point(&t.transform_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-10);
        assert_relative_eq!((t * t.inverse()).translation, Vector3::zeros(), epsilon = 1e-10);
    }

    #[test]
    fn test_from_rt_matches_quaternion() {
        let q = UnitQuaternion::from_euler_angles(0.3, 0.2, -0.1);
        let t = SE3::from_rt(q.to_rotation_matrix().into_inner(), Vector3::new(1.0, 0.0, 0.0));

        assert_relative_eq!(t.rotation.angle_to(&q), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_camera_to_world_direction() {
        let c2w = CameraToWorld(SE3::new(UnitQuaternion::identity(), Vector3::new(0.0, 0.0, 500.0)));
        let w2c = c2w.inverse();

        assert_relative_eq!(c2w.camera_position(), Vector3::new(0.0, 0.0, 500.0));
        assert_relative_eq!(
            w2c.0.transform_point(&Vector3::new(0.0, 0.0, 1500.0)),
            Vector3::new(0.0, 0.0, 1000.0)
        );
    }
}

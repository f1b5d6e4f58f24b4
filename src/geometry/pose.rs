//! Observer pose with its uncertainty.

use nalgebra::{Matrix3, Matrix6, UnitQuaternion, Vector3, Vector6};

use crate::error::CovarianceError;
use crate::geometry::covariance::check_covariance;
use crate::geometry::so3::quaternion_to_scaled_axis;
use crate::geometry::{CameraToWorld, SE3, WorldToCamera};

/// Camera pose in the world frame.
///
/// The covariance is ordered as position (mm) then rotation (scaled axis,
/// rad).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
    pub covariance: Matrix6<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Self::new(Vector3::zeros(), UnitQuaternion::identity(), Matrix6::zeros())
    }
}

impl Pose {
    pub fn new(position: Vector3<f64>, orientation: UnitQuaternion<f64>, covariance: Matrix6<f64>) -> Self {
        Self {
            position,
            orientation,
            covariance,
        }
    }

    pub fn from_camera_to_world(c2w: &CameraToWorld, covariance: Matrix6<f64>) -> Self {
        Self::new(c2w.0.translation, c2w.0.rotation, covariance)
    }

    pub fn camera_to_world(&self) -> CameraToWorld {
        CameraToWorld(SE3::new(self.orientation, self.position))
    }

    pub fn world_to_camera(&self) -> WorldToCamera {
        self.camera_to_world().inverse()
    }

    /// Uncertainty of the camera center.
    pub fn position_covariance(&self) -> Matrix3<f64> {
        self.covariance.fixed_view::<3, 3>(0, 0).into_owned()
    }

    pub fn check_covariance(&self) -> Result<(), CovarianceError> {
        check_covariance(&self.covariance)
    }

    /// Replace the estimate, keeping nothing of the previous value.
    pub fn update(&mut self, position: Vector3<f64>, orientation: UnitQuaternion<f64>, covariance: Matrix6<f64>) {
        self.position = position;
        self.orientation = orientation;
        self.covariance = covariance;
    }

    /// Position and scaled-axis orientation as a single vector.
    pub fn to_vector(&self) -> Vector6<f64> {
        let r = quaternion_to_scaled_axis(&self.orientation);
        Vector6::new(self.position.x, self.position.y, self.position.z, r.x, r.y, r.z)
    }

    /// Distance between two camera centers (mm).
    pub fn position_error(&self, other: &Pose) -> f64 {
        (self.position - other.position).norm()
    }

    /// Rotation angle between two orientations (rad).
    pub fn angle_error(&self, other: &Pose) -> f64 {
        self.orientation.angle_to(&other.orientation)
    }
}

impl std::fmt::Display for Pose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (roll, pitch, yaw) = self.orientation.euler_angles();
        write!(
            f,
            "position [{:.2}, {:.2}, {:.2}] mm, rotation [{:.2}, {:.2}, {:.2}] deg, position std [{:.2}, {:.2}, {:.2}]",
            self.position.x,
            self.position.y,
            self.position.z,
            roll.to_degrees(),
            pitch.to_degrees(),
            yaw.to_degrees(),
            self.covariance[(0, 0)].max(0.0).sqrt(),
            self.covariance[(1, 1)].max(0.0).sqrt(),
            self.covariance[(2, 2)].max(0.0).sqrt(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pose_transforms_are_inverse() {
        let pose = Pose::new(
            Vector3::new(10.0, 20.0, 30.0),
            UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3),
            Matrix6::identity(),
        );
        let p = Vector3::new(-200.0, 50.0, 1000.0);

        let in_camera = pose.world_to_camera().0.transform_point(&p);
        assert_relative_eq!(pose.camera_to_world().0.transform_point(&in_camera), p, epsilon = 1e-9);
    }

    #[test]
    fn test_position_covariance_block() {
        let mut covariance = Matrix6::identity();
        covariance[(1, 1)] = 4.0;
        covariance[(4, 4)] = 9.0;
        let pose = Pose::new(Vector3::zeros(), UnitQuaternion::identity(), covariance);

        let block = pose.position_covariance();
        assert_relative_eq!(block[(1, 1)], 4.0);
        assert_relative_eq!(block[(2, 2)], 1.0);
    }

    #[test]
    fn test_errors() {
        let a = Pose::default();
        let mut b = Pose::default();
        b.update(
            Vector3::new(3.0, 4.0, 0.0),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.2, 0.0)),
            Matrix6::zeros(),
        );

        assert_relative_eq!(a.position_error(&b), 5.0);
        assert_relative_eq!(a.angle_error(&b), 0.2, epsilon = 1e-12);
        assert_relative_eq!(b.to_vector()[4], 0.2, epsilon = 1e-12);
    }

    #[test]
    fn test_invalid_covariance_is_reported() {
        let mut pose = Pose::default();
        pose.covariance[(0, 0)] = f64::NAN;
        assert!(pose.check_covariance().is_err());
    }
}

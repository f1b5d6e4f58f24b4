//! Planes segmented from the depth image.

use nalgebra::Matrix4;

use crate::geometry::{CameraCoordinate, PlaneCameraCoordinates, is_covariance_valid};

/// Plane detected in the current frame, expressed in the camera frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectedPlane {
    pub parametrization: PlaneCameraCoordinates,
    /// Covariance of `(n, d)`.
    pub covariance: Matrix4<f64>,
    /// Center of the segmented region.
    pub centroid: CameraCoordinate,
}

impl DetectedPlane {
    pub fn new(parametrization: PlaneCameraCoordinates, covariance: Matrix4<f64>, centroid: CameraCoordinate) -> Self {
        Self {
            parametrization,
            covariance,
            centroid,
        }
    }

    pub fn is_valid(&self) -> bool {
        is_covariance_valid(&self.covariance) && self.centroid.0.iter().all(|v| v.is_finite())
    }

    /// Whether two detections describe the same plane within the matching
    /// tolerances.
    pub fn is_similar(&self, other: &PlaneCameraCoordinates, minimum_cos_angle: f64, maximum_offset_mm: f64) -> bool {
        self.parametrization.cos_angle(other) >= minimum_cos_angle
            && self.parametrization.distance(other).offset.abs() <= maximum_offset_mm
    }
}

//! Infinite planes in Hessian normal form, `n · X + d = 0` with `|n| = 1`.

use nalgebra::{Vector3, Vector4};

use crate::error::GeometryError;
use crate::geometry::{CameraToWorld, WorldToCamera};

const MIN_NORMAL_NORM: f64 = 1e-9;

/// Plane parameters expressed in the camera frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneCameraCoordinates {
    pub normal: Vector3<f64>,
    pub offset: f64,
}

/// Plane parameters expressed in the world frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneWorldCoordinates {
    pub normal: Vector3<f64>,
    pub offset: f64,
}

/// Misalignment between two planes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneDistance {
    /// `n_a × n_b` after orienting both normals the same way. Its norm is the
    /// sine of the angle between the planes.
    pub angle_vector: Vector3<f64>,
    /// Angle between the normals (rad), in `[0, π/2]`.
    pub angle: f64,
    /// Offset difference (mm).
    pub offset: f64,
}

fn normalize(normal: Vector3<f64>, offset: f64) -> Result<(Vector3<f64>, f64), GeometryError> {
    let norm = normal.norm();
    if !norm.is_finite() || norm < MIN_NORMAL_NORM || !offset.is_finite() {
        return Err(GeometryError::DegeneratePlane);
    }
    Ok((normal / norm, offset / norm))
}

fn plane_distance(
    normal_a: &Vector3<f64>,
    offset_a: f64,
    normal_b: &Vector3<f64>,
    offset_b: f64,
) -> PlaneDistance {
    // (n, d) and (-n, -d) describe the same plane
    let (normal_b, offset_b) = if normal_a.dot(normal_b) < 0.0 {
        (-normal_b, -offset_b)
    } else {
        (*normal_b, offset_b)
    };
    let angle_vector = normal_a.cross(&normal_b);
    PlaneDistance {
        angle_vector,
        angle: angle_vector.norm().atan2(normal_a.dot(&normal_b)),
        offset: offset_a - offset_b,
    }
}

impl PlaneCameraCoordinates {
    /// Build from an unnormalized normal.
    pub fn new(normal: Vector3<f64>, offset: f64) -> Result<Self, GeometryError> {
        let (normal, offset) = normalize(normal, offset)?;
        Ok(Self { normal, offset })
    }

    pub fn to_world(&self, c2w: &CameraToWorld) -> PlaneWorldCoordinates {
        let normal = c2w.0.transform_vector(&self.normal);
        PlaneWorldCoordinates {
            normal,
            offset: self.offset - normal.dot(&c2w.camera_position()),
        }
    }

    pub fn to_vector(&self) -> Vector4<f64> {
        Vector4::new(self.normal.x, self.normal.y, self.normal.z, self.offset)
    }

    /// Cosine of the angle between both normals, sign independent.
    pub fn cos_angle(&self, other: &PlaneCameraCoordinates) -> f64 {
        self.normal.dot(&other.normal).abs()
    }

    pub fn distance(&self, other: &PlaneCameraCoordinates) -> PlaneDistance {
        plane_distance(&self.normal, self.offset, &other.normal, other.offset)
    }
}

impl PlaneWorldCoordinates {
    pub fn new(normal: Vector3<f64>, offset: f64) -> Result<Self, GeometryError> {
        let (normal, offset) = normalize(normal, offset)?;
        Ok(Self { normal, offset })
    }

    pub fn to_camera(&self, w2c: &WorldToCamera) -> PlaneCameraCoordinates {
        let camera_position = w2c.inverse().camera_position();
        PlaneCameraCoordinates {
            normal: w2c.0.transform_vector(&self.normal),
            offset: self.offset + self.normal.dot(&camera_position),
        }
    }

    pub fn to_vector(&self) -> Vector4<f64> {
        Vector4::new(self.normal.x, self.normal.y, self.normal.z, self.offset)
    }

    /// Signed distance of a world point to this plane (mm).
    pub fn signed_distance(&self, point: &Vector3<f64>) -> f64 {
        self.normal.dot(point) + self.offset
    }

    pub fn distance(&self, other: &PlaneWorldCoordinates) -> PlaneDistance {
        plane_distance(&self.normal, self.offset, &other.normal, other.offset)
    }
}

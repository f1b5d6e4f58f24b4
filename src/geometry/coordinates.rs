//! Point coordinates in the screen, camera and world frames.
//!
//! Screen coordinates are in pixels (plus depth in mm for RGB-D
//! observations), camera and world coordinates are in millimeters. Each
//! frame has its own type so transforms cannot be chained in the wrong
//! order.

use nalgebra::{Vector2, Vector3};

use crate::error::GeometryError;
use crate::geometry::{CameraModel, CameraToWorld, WorldToCamera};

/// Pixel position without depth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenCoordinate2D {
    pub u: f64,
    pub v: f64,
}

/// Pixel position with the registered depth (mm). Depth may be invalid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenCoordinate {
    pub u: f64,
    pub v: f64,
    pub depth: f64,
}

/// Point in the camera frame (mm, z forward).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraCoordinate(pub Vector3<f64>);

/// Point in the world frame (mm).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldCoordinate(pub Vector3<f64>);

impl ScreenCoordinate2D {
    pub fn new(u: f64, v: f64) -> Self {
        Self { u, v }
    }

    pub fn as_vector(&self) -> Vector2<f64> {
        Vector2::new(self.u, self.v)
    }

    pub fn distance(&self, other: &ScreenCoordinate2D) -> f64 {
        (self.as_vector() - other.as_vector()).norm()
    }

    /// Unit direction of the viewing ray through this pixel, in the world frame.
    pub fn to_world_ray(&self, camera: &CameraModel, c2w: &CameraToWorld) -> Vector3<f64> {
        c2w.0.transform_vector(&camera.ray(self.u, self.v)).normalize()
    }
}

impl From<Vector2<f64>> for ScreenCoordinate2D {
    fn from(v: Vector2<f64>) -> Self {
        Self::new(v.x, v.y)
    }
}

impl ScreenCoordinate {
    pub fn new(u: f64, v: f64, depth: f64) -> Self {
        Self { u, v, depth }
    }

    pub fn get_2d(&self) -> ScreenCoordinate2D {
        ScreenCoordinate2D::new(self.u, self.v)
    }

    pub fn to_camera(&self, camera: &CameraModel) -> CameraCoordinate {
        CameraCoordinate(camera.back_project(self.u, self.v, self.depth))
    }

    pub fn to_world(&self, camera: &CameraModel, c2w: &CameraToWorld) -> WorldCoordinate {
        self.to_camera(camera).to_world(c2w)
    }
}

impl CameraCoordinate {
    pub fn to_world(&self, c2w: &CameraToWorld) -> WorldCoordinate {
        WorldCoordinate(c2w.0.transform_point(&self.0))
    }

    pub fn to_screen(&self, camera: &CameraModel) -> Result<ScreenCoordinate2D, GeometryError> {
        camera
            .project(&self.0)
            .map(ScreenCoordinate2D::from)
            .ok_or(GeometryError::BehindCamera(self.0.z))
    }
}

impl WorldCoordinate {
    pub fn to_camera(&self, w2c: &WorldToCamera) -> CameraCoordinate {
        CameraCoordinate(w2c.0.transform_point(&self.0))
    }

    pub fn to_screen(&self, w2c: &WorldToCamera, camera: &CameraModel) -> Result<ScreenCoordinate2D, GeometryError> {
        self.to_camera(w2c).to_screen(camera)
    }

    /// Signed retroprojection offset (px) between this point and an observation.
    pub fn screen_distance(
        &self,
        observed: &ScreenCoordinate2D,
        w2c: &WorldToCamera,
        camera: &CameraModel,
    ) -> Result<Vector2<f64>, GeometryError> {
        let projected = self.to_screen(w2c, camera)?;
        Ok(projected.as_vector() - observed.as_vector())
    }

    /// Lateral offset (mm) between this point and the viewing ray of an
    /// observation, measured at the depth of this point.
    pub fn ray_distance(
        &self,
        observed: &ScreenCoordinate2D,
        w2c: &WorldToCamera,
        camera: &CameraModel,
    ) -> Result<Vector2<f64>, GeometryError> {
        let p = self.to_camera(w2c).0;
        if p.z <= 0.0 {
            return Err(GeometryError::BehindCamera(p.z));
        }
        let ray = camera.ray(observed.u, observed.v);
        Ok(Vector2::new(p.x - ray.x * p.z, p.y - ray.y * p.z))
    }

    pub fn distance(&self, other: &WorldCoordinate) -> f64 {
        (self.0 - other.0).norm()
    }
}

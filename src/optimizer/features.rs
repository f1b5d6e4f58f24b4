//! Matches seen by the pose optimizer: residuals, inlier distances and
//! random perturbations used by the variance estimation.

use nalgebra::Vector3;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::config::{InlierThresholds, SlamConfig};
use crate::error::GeometryError;
use crate::geometry::{CameraModel, InverseDepthWorldPoint, PlaneWorldCoordinates, WorldCoordinate, WorldToCamera};
use crate::map::{FeatureId, FeatureKind, PerKind};
use crate::optimizer::loss::RobustLoss;
use crate::optimizer::matches::{PlaneMatch, Point2dMatch, PointMatch};

/// A match the optimizer can score against a candidate camera pose.
pub trait OptimizationFeature: Clone + Send + Sync {
    const KIND: FeatureKind;
    /// Residual components written by [`OptimizationFeature::normalized_residuals`].
    const RESIDUAL_COUNT: usize;

    fn id(&self) -> FeatureId;

    /// Residual components in inlier threshold units.
    fn normalized_residuals(
        &self,
        w2c: &WorldToCamera,
        camera: &CameraModel,
        thresholds: &InlierThresholds,
        out: &mut [f64],
    ) -> Result<(), GeometryError>;

    /// Distance to the observation in inlier threshold units. At most 1 for
    /// an inlier.
    fn normalized_distance(
        &self,
        w2c: &WorldToCamera,
        camera: &CameraModel,
        thresholds: &InlierThresholds,
    ) -> Result<f64, GeometryError>;

    /// Copy with the landmark displaced by its own uncertainty.
    fn random_variation<R: Rng + ?Sized>(&self, rng: &mut R) -> Self;
}

fn gaussian<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.sample(StandardNormal)
}

impl OptimizationFeature for PointMatch {
    const KIND: FeatureKind = FeatureKind::Point;
    const RESIDUAL_COUNT: usize = 2;

    fn id(&self) -> FeatureId {
        self.id
    }

    fn normalized_residuals(
        &self,
        w2c: &WorldToCamera,
        camera: &CameraModel,
        thresholds: &InlierThresholds,
        out: &mut [f64],
    ) -> Result<(), GeometryError> {
        let offset = self.world_point.screen_distance(&self.observation, w2c, camera)? / thresholds.point_px;
        out[0] = offset.x;
        out[1] = offset.y;
        Ok(())
    }

    fn normalized_distance(
        &self,
        w2c: &WorldToCamera,
        camera: &CameraModel,
        thresholds: &InlierThresholds,
    ) -> Result<f64, GeometryError> {
        let offset = self.world_point.screen_distance(&self.observation, w2c, camera)?;
        Ok(offset.abs().max() / thresholds.point_px)
    }

    fn random_variation<R: Rng + ?Sized>(&self, rng: &mut R) -> Self {
        let noise = Vector3::from_fn(|i, _| gaussian(rng) * self.world_covariance[(i, i)].max(0.0).sqrt());
        Self {
            world_point: WorldCoordinate(self.world_point.0 + noise),
            ..*self
        }
    }
}

impl OptimizationFeature for Point2dMatch {
    const KIND: FeatureKind = FeatureKind::Point2D;
    const RESIDUAL_COUNT: usize = 2;

    fn id(&self) -> FeatureId {
        self.id
    }

    /// Lateral offset between the landmark and the observation ray.
    fn normalized_residuals(
        &self,
        w2c: &WorldToCamera,
        camera: &CameraModel,
        thresholds: &InlierThresholds,
        out: &mut [f64],
    ) -> Result<(), GeometryError> {
        let offset = self.point.to_cartesian().ray_distance(&self.observation, w2c, camera)? / thresholds.point_2d_mm;
        out[0] = offset.x;
        out[1] = offset.y;
        Ok(())
    }

    fn normalized_distance(
        &self,
        w2c: &WorldToCamera,
        camera: &CameraModel,
        thresholds: &InlierThresholds,
    ) -> Result<f64, GeometryError> {
        let offset = self.point.to_cartesian().ray_distance(&self.observation, w2c, camera)?;
        Ok(offset.abs().max() / thresholds.point_2d_mm)
    }

    /// Only the bearing is perturbed: the depth is unknown by construction.
    fn random_variation<R: Rng + ?Sized>(&self, rng: &mut R) -> Self {
        let theta = self.point.theta() + gaussian(rng) * self.standard_deviations[3];
        let phi = self.point.phi() + gaussian(rng) * self.standard_deviations[4];
        let point = InverseDepthWorldPoint::new(*self.point.first_observation(), theta, phi, self.point.inverse_depth())
            .unwrap_or(self.point);
        Self { point, ..*self }
    }
}

impl OptimizationFeature for PlaneMatch {
    const KIND: FeatureKind = FeatureKind::Plane;
    const RESIDUAL_COUNT: usize = 4;

    fn id(&self) -> FeatureId {
        self.id
    }

    fn normalized_residuals(
        &self,
        w2c: &WorldToCamera,
        _camera: &CameraModel,
        thresholds: &InlierThresholds,
        out: &mut [f64],
    ) -> Result<(), GeometryError> {
        let distance = self.world_plane.to_camera(w2c).distance(&self.observation);
        let angle = distance.angle_vector / thresholds.plane_angle_rad;
        out[0] = angle.x;
        out[1] = angle.y;
        out[2] = angle.z;
        out[3] = distance.offset / thresholds.plane_distance_mm;
        Ok(())
    }

    fn normalized_distance(
        &self,
        w2c: &WorldToCamera,
        _camera: &CameraModel,
        thresholds: &InlierThresholds,
    ) -> Result<f64, GeometryError> {
        let distance = self.world_plane.to_camera(w2c).distance(&self.observation);
        Ok((distance.angle / thresholds.plane_angle_rad).max(distance.offset.abs() / thresholds.plane_distance_mm))
    }

    fn random_variation<R: Rng + ?Sized>(&self, rng: &mut R) -> Self {
        let normal = self.world_plane.normal
            + Vector3::from_fn(|i, _| gaussian(rng) * self.world_covariance[(i, i)].max(0.0).sqrt());
        let offset = self.world_plane.offset + gaussian(rng) * self.world_covariance[(3, 3)].max(0.0).sqrt();
        let world_plane = PlaneWorldCoordinates::new(normal, offset).unwrap_or(self.world_plane);
        Self { world_plane, ..*self }
    }
}

/// Constants turning feature distances into weighted residuals and scores.
#[derive(Debug, Clone, Copy)]
pub struct FeatureScoring {
    pub camera: CameraModel,
    pub thresholds: InlierThresholds,
    /// `1 / minimum_for_optimization` per kind: a minimal set of any kind
    /// scores 1.
    pub weights: PerKind<f64>,
    pub loss: RobustLoss,
}

impl FeatureScoring {
    pub fn new(config: &SlamConfig) -> Self {
        let optimization = &config.optimization;
        Self {
            camera: config.camera,
            thresholds: optimization.inlier_thresholds,
            weights: optimization.minimum_for_optimization.map(|_, minimum| 1.0 / (*minimum).max(1) as f64),
            loss: RobustLoss::new(optimization.loss_alpha, optimization.loss_scale),
        }
    }

    pub fn weight<F: OptimizationFeature>(&self) -> f64 {
        *self.weights.get(F::KIND)
    }

    /// Weighted residuals reshaped by the robust loss.
    pub fn write_residuals<F: OptimizationFeature>(
        &self,
        feature: &F,
        w2c: &WorldToCamera,
        out: &mut [f64],
    ) -> Result<(), GeometryError> {
        feature.normalized_residuals(w2c, &self.camera, &self.thresholds, out)?;
        let weight = self.weight::<F>().sqrt();
        for residual in out.iter_mut() {
            *residual = self.loss.apply(*residual * weight);
        }
        Ok(())
    }

    /// Score contribution `weight * min(distance, 1)` and inlier flag. A
    /// feature that cannot be evaluated is an outlier at full penalty.
    pub fn score<F: OptimizationFeature>(&self, feature: &F, w2c: &WorldToCamera) -> (f64, bool) {
        let weight = self.weight::<F>();
        match feature.normalized_distance(w2c, &self.camera, &self.thresholds) {
            Ok(distance) if distance.is_finite() => (weight * distance.min(1.0), distance <= 1.0),
            _ => (weight, false),
        }
    }
}

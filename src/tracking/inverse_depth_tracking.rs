//! Tracking of points whose depth is unknown.
//!
//! A `PointInverseDepth` is created from the first 2D observation of a point,
//! with a fixed prior on its inverse depth. Every later observation is
//! converted to the same form, both estimates are merged in cartesian world
//! space with the shared Kalman filter, and the merged point is converted
//! back to inverse depth around the original first observation center.
//!
//! When the depth uncertainty becomes small compared to the distance of the
//! point (low linearity score), the point can be upgraded to a cartesian
//! landmark.

use nalgebra::{Matrix3, Matrix6, Vector2};

use crate::error::{CovarianceError, GeometryError, TrackingError};
use crate::geometry::covariance::world_point_covariance;
use crate::geometry::inverse_depth::{FIRST_POSE_INDEX, INVERSE_DEPTH_INDEX, PHI_INDEX, THETA_INDEX};
use crate::geometry::{
    CameraModel, CameraToWorld, InverseDepthWorldPoint, ScreenCoordinate, ScreenCoordinate2D,
    WorldCoordinate, WorldToCamera, check_covariance, propagate_covariance,
};
use crate::tracking::TrackingContext;
use crate::tracking::point_tracking::TrackingUpdate;

/// Scale of the linearity score.
const LINEARITY_SCORE_SCALE: f64 = 4.0;

/// Projection of a point with uncertain depth: the segment between the
/// projections of its closest and furthest plausible positions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenSegment {
    pub closest: ScreenCoordinate2D,
    pub furthest: ScreenCoordinate2D,
}

impl ScreenSegment {
    pub fn length(&self) -> f64 {
        self.closest.distance(&self.furthest)
    }

    /// Distance from a pixel to the segment (px).
    pub fn distance_to(&self, point: &ScreenCoordinate2D) -> f64 {
        let a = self.closest.as_vector();
        let ab = self.furthest.as_vector() - a;
        let ap = point.as_vector() - a;
        let length_squared = ab.norm_squared();
        if length_squared <= f64::EPSILON {
            return ap.norm();
        }
        let t = (ap.dot(&ab) / length_squared).clamp(0.0, 1.0);
        (ap - ab * t).norm()
    }

    pub fn middle(&self) -> ScreenCoordinate2D {
        ScreenCoordinate2D::from((self.closest.as_vector() + self.furthest.as_vector()) / 2.0)
    }
}

/// Inverse-depth point estimate with its 6x6 covariance, ordered as
/// `(first observation center, θ, φ, ρ)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointInverseDepth {
    coordinates: InverseDepthWorldPoint,
    covariance: Matrix6<f64>,
}

impl PointInverseDepth {
    pub fn new(coordinates: InverseDepthWorldPoint, covariance: Matrix6<f64>) -> Result<Self, TrackingError> {
        check_covariance(&covariance)?;
        Ok(Self {
            coordinates,
            covariance,
        })
    }

    /// Hypothesis for a first 2D observation, at the baseline inverse depth.
    pub fn from_observation(
        observation: &ScreenCoordinate2D,
        c2w: &CameraToWorld,
        pose_position_covariance: &Matrix3<f64>,
        context: &TrackingContext,
    ) -> Result<Self, TrackingError> {
        let baseline = context.detection.inverse_depth_baseline;
        let coordinates = InverseDepthWorldPoint::from_screen(observation, c2w, &context.camera, baseline)?;

        let angle_variance = context.detection.inverse_depth_angle_baseline_deg.to_radians().powi(2);
        let mut covariance = Matrix6::zeros();
        covariance
            .fixed_view_mut::<3, 3>(FIRST_POSE_INDEX, FIRST_POSE_INDEX)
            .copy_from(pose_position_covariance);
        covariance[(THETA_INDEX, THETA_INDEX)] = angle_variance;
        covariance[(PHI_INDEX, PHI_INDEX)] = angle_variance;
        covariance[(INVERSE_DEPTH_INDEX, INVERSE_DEPTH_INDEX)] = (baseline / 4.0).powi(2);

        Self::new(coordinates, covariance)
    }

    pub fn coordinates(&self) -> &InverseDepthWorldPoint {
        &self.coordinates
    }

    pub fn covariance(&self) -> &Matrix6<f64> {
        &self.covariance
    }

    /// Standard deviation of the inverse depth (1/mm).
    pub fn inverse_depth_std(&self) -> f64 {
        self.covariance[(INVERSE_DEPTH_INDEX, INVERSE_DEPTH_INDEX)].max(0.0).sqrt()
    }

    /// Square roots of the covariance diagonal.
    pub fn standard_deviations(&self) -> [f64; 6] {
        std::array::from_fn(|i| self.covariance[(i, i)].max(0.0).sqrt())
    }

    /// Cartesian estimate and its covariance.
    pub fn to_cartesian(&self) -> Result<(WorldCoordinate, Matrix3<f64>), CovarianceError> {
        let (point, jacobian) = self.coordinates.to_cartesian_with_jacobian();
        let covariance = propagate_covariance(&self.covariance, &jacobian)?;
        Ok((point, covariance))
    }

    /// Merge a new observation without depth.
    pub fn track_2d(
        &mut self,
        observation: &ScreenCoordinate2D,
        c2w: &CameraToWorld,
        pose_position_covariance: &Matrix3<f64>,
        context: &TrackingContext,
    ) -> Result<TrackingUpdate, TrackingError> {
        let transient = Self::from_observation(observation, c2w, pose_position_covariance, context)?;
        let (observed, observed_covariance) = transient.to_cartesian()?;
        self.merge(&observed, &observed_covariance, context)
    }

    /// Merge a new observation with a measured depth.
    pub fn track_3d(
        &mut self,
        observation: &ScreenCoordinate,
        c2w: &CameraToWorld,
        pose_position_covariance: &Matrix3<f64>,
        context: &TrackingContext,
    ) -> Result<TrackingUpdate, TrackingError> {
        if !context.detection.is_depth_valid(observation.depth) {
            return Err(GeometryError::InvalidDepth(observation.depth).into());
        }
        let observed = observation.to_world(&context.camera, c2w);
        let observed_covariance =
            world_point_covariance(observation, c2w, pose_position_covariance, &context.camera, &context.detection)?;
        self.merge(&observed, &observed_covariance, context)
    }

    /// Kalman merge in cartesian space, then back to inverse depth. The
    /// state is only replaced once every step succeeded.
    fn merge(
        &mut self,
        observed: &WorldCoordinate,
        observed_covariance: &Matrix3<f64>,
        context: &TrackingContext,
    ) -> Result<TrackingUpdate, TrackingError> {
        let (current, current_covariance) = self.to_cartesian()?;

        let (state, merged_covariance) =
            context
                .filter
                .get_new_state(&current.0, &current_covariance, &observed.0, observed_covariance)?;
        let merged = WorldCoordinate(state);

        let first_observation = *self.coordinates.first_observation();
        let (coordinates, jacobian) = InverseDepthWorldPoint::from_cartesian(&merged, &first_observation)?;
        let mut covariance = propagate_covariance(&merged_covariance, &jacobian)?;
        // the first observation center keeps its creation time uncertainty
        covariance
            .fixed_view_mut::<3, 3>(FIRST_POSE_INDEX, FIRST_POSE_INDEX)
            .copy_from(&self.covariance.fixed_view::<3, 3>(FIRST_POSE_INDEX, FIRST_POSE_INDEX));
        check_covariance(&covariance)?;

        let update = TrackingUpdate::between(&current, &merged, &merged_covariance);
        self.coordinates = coordinates;
        self.covariance = covariance;
        Ok(update)
    }

    /// Depth reliability score: the depth uncertainty relative to the
    /// distance of the point, weighted by the alignment between the bearing
    /// and the current viewing ray. Lower is better.
    ///
    /// ```text
    /// σ_d = σ_ρ / ρ²
    /// score = 4 (σ_d / 1000) / (|h_c| / 1000) |cos α|
    /// ```
    pub fn compute_linearity_score(&self, c2w: &CameraToWorld) -> f64 {
        let inverse_depth = self.coordinates.inverse_depth();
        let depth_std_m = self.inverse_depth_std() / (inverse_depth * inverse_depth) / 1000.0;

        let hc = self.coordinates.to_cartesian().0 - c2w.camera_position();
        let distance = hc.norm();
        if distance <= f64::EPSILON {
            return f64::INFINITY;
        }
        let cos_alpha = self.coordinates.bearing_vector().dot(&hc) / distance;
        LINEARITY_SCORE_SCALE * depth_std_m / (distance / 1000.0) * cos_alpha.abs()
    }

    /// Screen segment spanned by the point at `ρ ± σ_ρ`.
    pub fn to_screen_coordinates(&self, w2c: &WorldToCamera, camera: &CameraModel) -> Result<ScreenSegment, GeometryError> {
        let inverse_depth = self.coordinates.inverse_depth();
        let std = self.inverse_depth_std();

        let closest = self.coordinates.to_cartesian_at(inverse_depth + std)?;
        let furthest = self.coordinates.to_cartesian_at((inverse_depth - std).max(inverse_depth * 0.1))?;
        Ok(ScreenSegment {
            closest: closest.to_screen(w2c, camera)?,
            furthest: furthest.to_screen(w2c, camera)?,
        })
    }

    /// Signed lateral offset (mm) between the estimate and an observation ray.
    pub fn ray_distance(
        &self,
        observation: &ScreenCoordinate2D,
        w2c: &WorldToCamera,
        camera: &CameraModel,
    ) -> Result<Vector2<f64>, GeometryError> {
        self.coordinates.to_cartesian().ray_distance(observation, w2c, camera)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlamConfig;
    use crate::geometry::SE3;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn context() -> TrackingContext {
        TrackingContext::new(&SlamConfig::default())
    }

    fn shifted_camera(x: f64) -> CameraToWorld {
        CameraToWorld(SE3::new(UnitQuaternion::identity(), Vector3::new(x, 0.0, 0.0)))
    }

    fn observe(point: &Vector3<f64>, c2w: &CameraToWorld, camera: &CameraModel) -> ScreenCoordinate {
        let screen = WorldCoordinate(*point).to_screen(&c2w.inverse(), camera).unwrap();
        let depth = c2w.inverse().0.transform_point(point).z;
        ScreenCoordinate::new(screen.u, screen.v, depth)
    }

    #[test]
    fn test_initial_covariance() {
        let context = context();
        let pose_covariance = Matrix3::identity() * 4.0;
        let point = PointInverseDepth::from_observation(
            &ScreenCoordinate2D::new(300.0, 200.0),
            &shifted_camera(0.0),
            &pose_covariance,
            &context,
        )
        .unwrap();

        let baseline = context.detection.inverse_depth_baseline;
        let angle = context.detection.inverse_depth_angle_baseline_deg.to_radians();
        let covariance = point.covariance();
        assert_relative_eq!(covariance[(0, 0)], 4.0);
        assert_relative_eq!(covariance[(THETA_INDEX, THETA_INDEX)], angle * angle);
        assert_relative_eq!(covariance[(PHI_INDEX, PHI_INDEX)], angle * angle);
        assert_relative_eq!(covariance[(INVERSE_DEPTH_INDEX, INVERSE_DEPTH_INDEX)], (baseline / 4.0).powi(2));
        assert_relative_eq!(point.coordinates().inverse_depth(), baseline);
    }

    #[test]
    fn test_track_3d_pulls_toward_measured_point() {
        let context = context();
        let target = Vector3::new(200.0, -100.0, 2500.0);
        let first = shifted_camera(0.0);
        let observation = observe(&target, &first, &context.camera);

        let mut point =
            PointInverseDepth::from_observation(&observation.get_2d(), &first, &Matrix3::zeros(), &context).unwrap();
        let before = point.coordinates().to_cartesian().distance(&WorldCoordinate(target));

        let second = shifted_camera(150.0);
        let update = point
            .track_3d(&observe(&target, &second, &context.camera), &second, &Matrix3::zeros(), &context)
            .unwrap();

        let after = point.coordinates().to_cartesian().distance(&WorldCoordinate(target));
        assert!(after < before);
        assert!(update.displacement > 0.0);
        assert!(point.coordinates().inverse_depth() > 0.0);
        assert!(check_covariance(point.covariance()).is_ok());
    }

    #[test]
    fn test_track_2d_keeps_first_pose_block_and_shrinks_uncertainty() {
        let context = context();
        let target = Vector3::new(-150.0, 50.0, 1500.0);
        let pose_covariance = Matrix3::identity() * 2.0;
        let first = shifted_camera(0.0);
        let mut point = PointInverseDepth::from_observation(
            &observe(&target, &first, &context.camera).get_2d(),
            &first,
            &pose_covariance,
            &context,
        )
        .unwrap();
        let (_, covariance_before) = point.to_cartesian().unwrap();

        let second = shifted_camera(200.0);
        point
            .track_2d(&observe(&target, &second, &context.camera).get_2d(), &second, &pose_covariance, &context)
            .unwrap();

        let (_, covariance_after) = point.to_cartesian().unwrap();
        assert!(covariance_after.trace() < covariance_before.trace());
        assert_relative_eq!(
            point.covariance().fixed_view::<3, 3>(0, 0).into_owned(),
            pose_covariance,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_invalid_depth_leaves_state_untouched() {
        let context = context();
        let first = shifted_camera(0.0);
        let mut point =
            PointInverseDepth::from_observation(&ScreenCoordinate2D::new(320.0, 240.0), &first, &Matrix3::zeros(), &context)
                .unwrap();
        let before = point;

        let invalid = ScreenCoordinate::new(320.0, 240.0, 10.0);
        assert!(point.track_3d(&invalid, &first, &Matrix3::zeros(), &context).is_err());
        assert_eq!(point, before);
    }

    #[test]
    fn test_linearity_score() {
        let first = shifted_camera(0.0);
        let coordinates = InverseDepthWorldPoint::new(Vector3::zeros(), std::f64::consts::FRAC_PI_2, 0.0, 1.0 / 2000.0).unwrap();
        let mut covariance = Matrix6::zeros();
        covariance[(INVERSE_DEPTH_INDEX, INVERSE_DEPTH_INDEX)] = (1.0 / 20000.0_f64).powi(2);
        let point = PointInverseDepth::new(coordinates, covariance).unwrap();

        // σ_d = (1/20000) * 2000² = 200 mm, seen head on from 2 m
        let expected = 4.0 * 0.2 / 2.0;
        assert_relative_eq!(point.compute_linearity_score(&first), expected, epsilon = 1e-9);

        // seen from the side, the bearing is almost orthogonal to the ray
        let side = CameraToWorld(SE3::new(UnitQuaternion::identity(), Vector3::new(2000.0, 0.0, 2000.0)));
        assert!(point.compute_linearity_score(&side) < 1e-6);
    }

    #[test]
    fn test_screen_segment() {
        let context = context();
        let first = shifted_camera(0.0);
        let observation = ScreenCoordinate2D::new(400.0, 260.0);
        let point = PointInverseDepth::from_observation(&observation, &first, &Matrix3::zeros(), &context).unwrap();

        // seen from the first camera the whole segment collapses on the observation
        let segment = point.to_screen_coordinates(&first.inverse(), &context.camera).unwrap();
        assert!(segment.length() < 1e-6);
        assert!(segment.distance_to(&observation) < 1e-6);

        // a translated camera sees the depth ambiguity as a segment
        let second = shifted_camera(300.0);
        let segment = point.to_screen_coordinates(&second.inverse(), &context.camera).unwrap();
        assert!(segment.length() > 1.0);
        assert!(segment.distance_to(&segment.middle()) < 1e-9);
    }
}

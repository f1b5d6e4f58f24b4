//! Synthetic scenes with exact observations, shared by the optimizer tests.

use std::ops::Range;

use nalgebra::{Matrix3, Matrix4, UnitQuaternion, Vector3, Vector6};

use crate::config::SlamConfig;
use crate::geometry::inverse_depth::bearing_angles;
use crate::geometry::{CameraCoordinate, InverseDepthWorldPoint, PlaneCameraCoordinates, Pose, ScreenCoordinate2D, WorldCoordinate};
use crate::map::FeatureId;
use crate::optimizer::matches::{MatchContainer, PlaneMatch, Point2dMatch, PointMatch};

pub struct TestScene {
    pub config: SlamConfig,
    pub true_pose: Pose,
    pub matches: MatchContainer,
}

impl TestScene {
    pub fn new(points: usize, points_2d: usize, planes: usize) -> Self {
        let config = SlamConfig::default();
        let true_pose = true_pose();
        let matches = MatchContainer {
            points: point_matches(&config, &true_pose, points),
            points_2d: point_2d_matches(&config, &true_pose, points_2d),
            planes: plane_matches(&true_pose, planes),
        };
        Self {
            config,
            true_pose,
            matches,
        }
    }

    /// Move the observation of the points in `range` by `factor` inlier
    /// thresholds.
    pub fn with_point_outliers(mut self, range: Range<usize>, factor: f64) -> Self {
        let shift = factor * self.config.optimization.inlier_thresholds.point_px;
        for m in self.matches.points.iter_mut().skip(range.start).take(range.len()) {
            m.observation = ScreenCoordinate2D::new(m.observation.u + shift, m.observation.v - shift);
        }
        self
    }
}

pub fn true_pose() -> Pose {
    Pose::new(
        Vector3::new(120.0, -40.0, 60.0),
        UnitQuaternion::from_euler_angles(0.05, -0.1, 0.03),
        nalgebra::Matrix6::zeros(),
    )
}

/// `pose` moved by `translation` mm along a fixed direction and rotated by
/// `angle` rad.
pub fn perturbed(pose: &Pose, translation: f64, angle: f64) -> Pose {
    let direction = Vector3::new(1.0, -2.0, 0.5).normalize();
    let axis = nalgebra::Unit::new_normalize(Vector3::new(0.3, 1.0, -0.2));
    Pose::new(
        pose.position + direction * translation,
        UnitQuaternion::from_axis_angle(&axis, angle) * pose.orientation,
        pose.covariance,
    )
}

/// Camera frame position of the i-th synthetic point: a 5 x 4 grid over
/// several depths.
fn camera_point(index: usize) -> Vector3<f64> {
    let column = (index % 5) as f64;
    let row = ((index / 5) % 4) as f64;
    Vector3::new(
        -600.0 + 300.0 * column,
        -400.0 + 800.0 / 3.0 * row,
        1500.0 + 75.0 * index as f64,
    )
}

pub fn point_matches(config: &SlamConfig, pose: &Pose, count: usize) -> Vec<PointMatch> {
    let c2w = pose.camera_to_world();
    (0..count)
        .filter_map(|i| {
            let camera = CameraCoordinate(camera_point(i));
            let observation = camera.to_screen(&config.camera).ok()?;
            Some(PointMatch {
                id: FeatureId::new(1000 + i as u64),
                detection_index: i,
                observation,
                world_point: camera.to_world(&c2w),
                world_covariance: Matrix3::from_diagonal_element(4.0),
                descriptor_distance: Some(0),
            })
        })
        .collect()
}

/// Points first seen from a camera 300 mm to the side, with their exact
/// depth along that first ray.
pub fn point_2d_matches(config: &SlamConfig, pose: &Pose, count: usize) -> Vec<Point2dMatch> {
    let c2w = pose.camera_to_world();
    let first_center = pose.position + Vector3::new(300.0, 0.0, 0.0);
    (0..count)
        .filter_map(|i| {
            // interleave with the 3D grid
            let camera = CameraCoordinate(camera_point(i) + Vector3::new(150.0, 130.0, 40.0));
            let observation = camera.to_screen(&config.camera).ok()?;
            let world: WorldCoordinate = camera.to_world(&c2w);
            let ray = world.0 - first_center;
            let (theta, phi) = bearing_angles(&ray).ok()?;
            let point = InverseDepthWorldPoint::new(first_center, theta, phi, 1.0 / ray.norm()).ok()?;
            Some(Point2dMatch {
                id: FeatureId::new(2000 + i as u64),
                detection_index: i,
                observation,
                point,
                standard_deviations: Vector6::new(1.0, 1.0, 1.0, 0.005, 0.005, 1e-5),
                descriptor_distance: Some(0),
            })
        })
        .collect()
}

/// Up to three non parallel planes around the camera.
pub fn plane_matches(pose: &Pose, count: usize) -> Vec<PlaneMatch> {
    let c2w = pose.camera_to_world();
    let planes = [
        (Vector3::new(0.0, 0.0, -1.0), 3000.0),
        (Vector3::new(0.0, 1.0, 0.1), -800.0),
        (Vector3::new(1.0, 0.0, 0.2), 1200.0),
    ];
    planes
        .iter()
        .take(count)
        .enumerate()
        .filter_map(|(i, (normal, offset))| {
            let observation = PlaneCameraCoordinates::new(*normal, *offset).ok()?;
            Some(PlaneMatch {
                id: FeatureId::new(3000 + i as u64),
                detection_index: i,
                observation,
                world_plane: observation.to_world(&c2w),
                world_covariance: Matrix4::from_diagonal(&nalgebra::Vector4::new(1e-4, 1e-4, 1e-4, 4.0)),
            })
        })
        .collect()
}

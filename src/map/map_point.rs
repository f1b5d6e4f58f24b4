//! Landmarks with a resolved world position.

use nalgebra::Matrix3;

use crate::error::TrackingError;
use crate::features::{DetectedKeypoints, Descriptor};
use crate::geometry::covariance::world_point_covariance;
use crate::geometry::{CameraModel, Pose, WorldCoordinate, WorldToCamera};
use crate::map::feature::{LifecycleCounters, MapFeature, MatchSearch, ScreenFootprint};
use crate::map::types::{Color, FeatureId, FeatureKind};
use crate::map::writer::{LandmarkGeometry, LandmarkRecord};
use crate::optimizer::matches::PointMatch;
use crate::tracking::{TrackedPoint, TrackingContext};

#[derive(Debug, Clone, PartialEq)]
pub struct MapPoint {
    id: FeatureId,
    point: TrackedPoint,
    descriptor: Descriptor,
    matched_index: Option<usize>,
}

impl MapPoint {
    /// Fresh landmark with a new id.
    pub fn new(point: TrackedPoint, descriptor: Descriptor) -> Self {
        Self::with_id(FeatureId::next(), point, descriptor, None)
    }

    /// Landmark continuing an existing id, used by upgrades.
    pub fn with_id(id: FeatureId, point: TrackedPoint, descriptor: Descriptor, matched_index: Option<usize>) -> Self {
        Self {
            id,
            point,
            descriptor,
            matched_index,
        }
    }

    pub fn coordinates(&self) -> &WorldCoordinate {
        self.point.coordinates()
    }

    pub fn covariance(&self) -> &Matrix3<f64> {
        self.point.covariance()
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }
}

impl MapFeature for MapPoint {
    const KIND: FeatureKind = FeatureKind::Point;

    type Detections = DetectedKeypoints;
    type Match = PointMatch;

    fn id(&self) -> FeatureId {
        self.id
    }

    fn matched_index(&self) -> Option<usize> {
        self.matched_index
    }

    fn set_matched_index(&mut self, index: Option<usize>) {
        self.matched_index = index;
    }

    fn detection_count(detections: &DetectedKeypoints) -> usize {
        detections.len()
    }

    fn can_add_to_map(detections: &DetectedKeypoints, index: usize, context: &TrackingContext) -> bool {
        detections
            .get(index)
            .is_some_and(|keypoint| keypoint.descriptor.is_some() && context.detection.is_depth_valid(keypoint.coordinates.depth))
    }

    fn from_detection(
        detections: &DetectedKeypoints,
        index: usize,
        pose: &Pose,
        context: &TrackingContext,
    ) -> Result<Self, TrackingError> {
        let keypoint = detections.get(index).ok_or(TrackingError::InvalidDetection(index))?;
        let descriptor = keypoint.descriptor.ok_or(TrackingError::InvalidDetection(index))?;
        let c2w = pose.camera_to_world();
        let coordinates = keypoint.coordinates.to_world(&context.camera, &c2w);
        let covariance = world_point_covariance(
            &keypoint.coordinates,
            &c2w,
            &pose.position_covariance(),
            &context.camera,
            &context.detection,
        )?;
        Ok(Self::new(TrackedPoint::new(coordinates, covariance)?, descriptor))
    }

    fn find_match(&self, detections: &DetectedKeypoints, search: &MatchSearch<'_>, is_matched: &[bool]) -> Option<usize> {
        if let Some(index) = detections.get_tracking_match_index(self.id, is_matched) {
            return Some(index);
        }
        let projected = self.coordinates().to_screen(&search.w2c, search.camera).ok()?;
        detections
            .get_match_index(
                &projected,
                search.radius(),
                &self.descriptor,
                search.matching.maximum_descriptor_distance,
                is_matched,
            )
            .map(|found| found.index)
    }

    fn make_match(&self, detections: &DetectedKeypoints, index: usize) -> Option<PointMatch> {
        let keypoint = detections.get(index)?;
        Some(PointMatch {
            id: self.id,
            detection_index: index,
            observation: keypoint.get_2d(),
            world_point: *self.coordinates(),
            world_covariance: *self.covariance(),
            descriptor_distance: keypoint.descriptor.map(|d| d.distance(&self.descriptor)),
        })
    }

    /// Observations without depth confirm the landmark without moving it.
    fn track(
        &mut self,
        detections: &DetectedKeypoints,
        index: usize,
        pose: &Pose,
        context: &TrackingContext,
    ) -> Result<(), TrackingError> {
        let keypoint = detections.get(index).ok_or(TrackingError::InvalidDetection(index))?;
        if !context.detection.is_depth_valid(keypoint.coordinates.depth) {
            return Ok(());
        }
        let c2w = pose.camera_to_world();
        let observation = keypoint.coordinates.to_world(&context.camera, &c2w);
        let observation_covariance = world_point_covariance(
            &keypoint.coordinates,
            &c2w,
            &pose.position_covariance(),
            &context.camera,
            &context.detection,
        )?;
        self.point.track(&observation, &observation_covariance, &context.filter)?;
        Ok(())
    }

    fn screen_footprint(&self, w2c: &WorldToCamera, camera: &CameraModel) -> Option<ScreenFootprint> {
        let projected = self.coordinates().to_screen(w2c, camera).ok()?;
        camera
            .is_in_screen(projected.u, projected.v)
            .then_some(ScreenFootprint::Point(projected))
    }

    fn to_record(&self, counters: &LifecycleCounters, color: Color) -> LandmarkRecord {
        LandmarkRecord {
            id: self.id,
            kind: Self::KIND,
            geometry: LandmarkGeometry::Point {
                position: self.coordinates().0.into(),
                standard_deviation: std::array::from_fn(|i| self.covariance()[(i, i)].max(0.0).sqrt()),
            },
            color,
            age: counters.age,
        }
    }
}

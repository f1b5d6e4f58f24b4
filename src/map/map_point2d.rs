//! Landmarks first seen without depth, kept in inverse-depth form until
//! their depth is reliable enough to be upgraded to a [`MapPoint`].

use nalgebra::Vector6;
use tracing::debug;

use crate::error::TrackingError;
use crate::features::{DetectedKeypoints, Descriptor};
use crate::geometry::{CameraModel, CameraToWorld, Pose, WorldToCamera};
use crate::map::feature::{LifecycleCounters, MapFeature, MatchSearch, ScreenFootprint};
use crate::map::map_point::MapPoint;
use crate::map::types::{Color, FeatureId, FeatureKind};
use crate::map::writer::{LandmarkGeometry, LandmarkRecord};
use crate::optimizer::matches::Point2dMatch;
use crate::tracking::{PointInverseDepth, TrackedPoint, TrackingContext};

#[derive(Debug, Clone, PartialEq)]
pub struct MapPoint2D {
    id: FeatureId,
    point: PointInverseDepth,
    descriptor: Descriptor,
    matched_index: Option<usize>,
}

impl MapPoint2D {
    pub fn new(point: PointInverseDepth, descriptor: Descriptor) -> Self {
        Self {
            id: FeatureId::next(),
            point,
            descriptor,
            matched_index: None,
        }
    }

    pub fn point(&self) -> &PointInverseDepth {
        &self.point
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Resolved landmark replacing this one once the depth is reliable. The
    /// id, descriptor and match carry over.
    pub fn compute_upgraded(&self, c2w: &CameraToWorld, linearity_threshold: f64) -> Option<MapPoint> {
        let score = self.point.compute_linearity_score(c2w);
        if score.is_nan() || score >= linearity_threshold {
            return None;
        }
        let upgraded = self
            .point
            .to_cartesian()
            .map_err(TrackingError::from)
            .and_then(|(coordinates, covariance)| TrackedPoint::new(coordinates, covariance));
        match upgraded {
            Ok(point) => {
                debug!("[LocalMap] Upgrading {} to a 3D point (linearity {:.4})", self.id, score);
                Some(MapPoint::with_id(self.id, point, self.descriptor, self.matched_index))
            }
            Err(e) => {
                debug!("[LocalMap] Could not upgrade {}: {}", self.id, e);
                None
            }
        }
    }
}

impl MapFeature for MapPoint2D {
    const KIND: FeatureKind = FeatureKind::Point2D;

    type Detections = DetectedKeypoints;
    type Match = Point2dMatch;

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
            .is_some_and(|keypoint| keypoint.descriptor.is_some() && !context.detection.is_depth_valid(keypoint.coordinates.depth))
    }

    fn from_detection(
        detections: &DetectedKeypoints,
        index: usize,
        pose: &Pose,
        context: &TrackingContext,
    ) -> Result<Self, TrackingError> {
        let keypoint = detections.get(index).ok_or(TrackingError::InvalidDetection(index))?;
        let descriptor = keypoint.descriptor.ok_or(TrackingError::InvalidDetection(index))?;
        let point = PointInverseDepth::from_observation(
            &keypoint.get_2d(),
            &pose.camera_to_world(),
            &pose.position_covariance(),
            context,
        )?;
        Ok(Self::new(point, descriptor))
    }

    /// Tracking carry-over first, then a search around the projected depth
    /// segment.
    fn find_match(&self, detections: &DetectedKeypoints, search: &MatchSearch<'_>, is_matched: &[bool]) -> Option<usize> {
        if let Some(index) = detections.get_tracking_match_index(self.id, is_matched) {
            return Some(index);
        }
        let segment = self.point.to_screen_coordinates(&search.w2c, search.camera).ok()?;
        detections
            .get_match_index_on_segment(
                &segment,
                search.radius(),
                &self.descriptor,
                search.matching.maximum_descriptor_distance,
                is_matched,
            )
            .map(|found| found.index)
    }

    fn make_match(&self, detections: &DetectedKeypoints, index: usize) -> Option<Point2dMatch> {
        let keypoint = detections.get(index)?;
        Some(Point2dMatch {
            id: self.id,
            detection_index: index,
            observation: keypoint.get_2d(),
            point: *self.point.coordinates(),
            standard_deviations: Vector6::from(self.point.standard_deviations()),
            descriptor_distance: keypoint.descriptor.map(|d| d.distance(&self.descriptor)),
        })
    }

    /// Observations with a valid depth are merged as 3D points.
    fn track(
        &mut self,
        detections: &DetectedKeypoints,
        index: usize,
        pose: &Pose,
        context: &TrackingContext,
    ) -> Result<(), TrackingError> {
        let keypoint = detections.get(index).ok_or(TrackingError::InvalidDetection(index))?;
        let c2w = pose.camera_to_world();
        let pose_covariance = pose.position_covariance();

        let update = if context.detection.is_depth_valid(keypoint.coordinates.depth) {
            self.point.track_3d(&keypoint.coordinates, &c2w, &pose_covariance, context)?
        } else {
            self.point.track_2d(&keypoint.get_2d(), &c2w, &pose_covariance, context)?
        };
        if update.is_moving {
            debug!("[LocalMap] {} moved by {:.1} mm", self.id, update.displacement);
        }
        Ok(())
    }

    fn screen_footprint(&self, w2c: &WorldToCamera, camera: &CameraModel) -> Option<ScreenFootprint> {
        let segment = self.point.to_screen_coordinates(w2c, camera).ok()?;
        let visible = camera.is_in_screen(segment.closest.u, segment.closest.v)
            || camera.is_in_screen(segment.furthest.u, segment.furthest.v);
        visible.then_some(ScreenFootprint::Segment(segment))
    }

    fn to_record(&self, counters: &LifecycleCounters, color: Color) -> LandmarkRecord {
        let coordinates = self.point.coordinates();
        LandmarkRecord {
            id: self.id,
            kind: Self::KIND,
            geometry: LandmarkGeometry::InverseDepth {
                first_observation: (*coordinates.first_observation()).into(),
                theta: coordinates.theta(),
                phi: coordinates.phi(),
                inverse_depth: coordinates.inverse_depth(),
                standard_deviation: self.point.standard_deviations(),
            },
            color,
            age: counters.age,
        }
    }
}

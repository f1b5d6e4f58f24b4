//! Infinite plane landmarks.

use nalgebra::{Matrix4, Vector3, Vector4};

use crate::error::{GeometryError, TrackingError};
use crate::features::DetectedPlane;
use crate::geometry::covariance::plane_camera_to_world_covariance;
use crate::geometry::{CameraModel, Pose, PlaneWorldCoordinates, WorldCoordinate, WorldToCamera, check_covariance};
use crate::map::feature::{LifecycleCounters, MapFeature, MatchSearch, ScreenFootprint};
use crate::map::types::{Color, FeatureId, FeatureKind};
use crate::map::writer::{LandmarkGeometry, LandmarkRecord};
use crate::optimizer::matches::PlaneMatch;
use crate::tracking::TrackingContext;

#[derive(Debug, Clone, PartialEq)]
pub struct MapPlane {
    id: FeatureId,
    parametrization: PlaneWorldCoordinates,
    /// Covariance of `(n, d)` in the world frame.
    covariance: Matrix4<f64>,
    /// Center of the last observed region.
    centroid: WorldCoordinate,
    matched_index: Option<usize>,
}

impl MapPlane {
    pub fn parametrization(&self) -> &PlaneWorldCoordinates {
        &self.parametrization
    }

    pub fn covariance(&self) -> &Matrix4<f64> {
        &self.covariance
    }

    pub fn centroid(&self) -> &WorldCoordinate {
        &self.centroid
    }

    fn observe(detection: &DetectedPlane, pose: &Pose) -> Result<(PlaneWorldCoordinates, Matrix4<f64>, WorldCoordinate), TrackingError> {
        let c2w = pose.camera_to_world();
        let plane = detection.parametrization.to_world(&c2w);
        let covariance = plane_camera_to_world_covariance(
            &detection.parametrization,
            &detection.covariance,
            &c2w,
            &pose.position_covariance(),
        )?;
        Ok((plane, covariance, detection.centroid.to_world(&c2w)))
    }
}

/// Bring a merged `(n, d)` back to a unit normal. Both merged planes had
/// unit normals, so the covariance is kept as is.
fn normalize_plane(state: &Vector4<f64>) -> Result<PlaneWorldCoordinates, GeometryError> {
    PlaneWorldCoordinates::new(Vector3::new(state.x, state.y, state.z), state.w)
}

impl MapFeature for MapPlane {
    const KIND: FeatureKind = FeatureKind::Plane;

    type Detections = [DetectedPlane];
    type Match = PlaneMatch;

    fn id(&self) -> FeatureId {
        self.id
    }

    fn matched_index(&self) -> Option<usize> {
        self.matched_index
    }

    fn set_matched_index(&mut self, index: Option<usize>) {
        self.matched_index = index;
    }

    fn detection_count(detections: &[DetectedPlane]) -> usize {
        detections.len()
    }

    fn can_add_to_map(detections: &[DetectedPlane], index: usize, _context: &TrackingContext) -> bool {
        detections.get(index).is_some_and(DetectedPlane::is_valid)
    }

    fn from_detection(
        detections: &[DetectedPlane],
        index: usize,
        pose: &Pose,
        _context: &TrackingContext,
    ) -> Result<Self, TrackingError> {
        let detection = detections.get(index).ok_or(TrackingError::InvalidDetection(index))?;
        let (parametrization, covariance, centroid) = Self::observe(detection, pose)?;
        Ok(Self {
            id: FeatureId::next(),
            parametrization,
            covariance,
            centroid,
            matched_index: None,
        })
    }

    /// Most aligned free detection within the angle and offset tolerances.
    fn find_match(&self, detections: &[DetectedPlane], search: &MatchSearch<'_>, is_matched: &[bool]) -> Option<usize> {
        let projected = self.parametrization.to_camera(&search.w2c);
        let mut best: Option<(usize, f64)> = None;
        for (index, detection) in detections.iter().enumerate() {
            if is_matched.get(index).copied().unwrap_or(true) {
                continue;
            }
            if !detection.is_similar(
                &projected,
                search.matching.plane_maximum_cos_angle,
                search.matching.plane_maximum_merge_distance_mm,
            ) {
                continue;
            }
            let cos_angle = detection.parametrization.cos_angle(&projected);
            if best.is_none_or(|(_, best_cos)| cos_angle > best_cos) {
                best = Some((index, cos_angle));
            }
        }
        best.map(|(index, _)| index)
    }

    fn make_match(&self, detections: &[DetectedPlane], index: usize) -> Option<PlaneMatch> {
        let detection = detections.get(index)?;
        Some(PlaneMatch {
            id: self.id,
            detection_index: index,
            observation: detection.parametrization,
            world_plane: self.parametrization,
            world_covariance: self.covariance,
        })
    }

    fn track(
        &mut self,
        detections: &[DetectedPlane],
        index: usize,
        pose: &Pose,
        context: &TrackingContext,
    ) -> Result<(), TrackingError> {
        let detection = detections.get(index).ok_or(TrackingError::InvalidDetection(index))?;
        let (observed, observed_covariance, centroid) = Self::observe(detection, pose)?;

        // (n, d) and (-n, -d) are the same plane: merge with the map orientation
        let mut measurement = observed.to_vector();
        if observed.normal.dot(&self.parametrization.normal) < 0.0 {
            measurement = -measurement;
        }

        let (state, covariance) = context.plane_filter.get_new_state(
            &self.parametrization.to_vector(),
            &self.covariance,
            &measurement,
            &observed_covariance,
        )?;
        let parametrization = normalize_plane(&state)?;
        check_covariance(&covariance)?;

        self.parametrization = parametrization;
        self.covariance = covariance;
        self.centroid = centroid;
        Ok(())
    }

    fn screen_footprint(&self, w2c: &WorldToCamera, camera: &CameraModel) -> Option<ScreenFootprint> {
        let centroid = self.centroid.to_screen(w2c, camera).ok()?;
        camera
            .is_in_screen(centroid.u, centroid.v)
            .then_some(ScreenFootprint::Plane { centroid })
    }

    fn to_record(&self, counters: &LifecycleCounters, color: Color) -> LandmarkRecord {
        LandmarkRecord {
            id: self.id,
            kind: Self::KIND,
            geometry: LandmarkGeometry::Plane {
                normal: self.parametrization.normal.into(),
                offset: self.parametrization.offset,
                centroid: self.centroid.0.into(),
            },
            color,
            age: counters.age,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlamConfig;
    use crate::geometry::{CameraCoordinate, PlaneCameraCoordinates};
    use approx::assert_relative_eq;

    fn wall(offset: f64, tilt: f64) -> DetectedPlane {
        DetectedPlane::new(
            PlaneCameraCoordinates::new(Vector3::new(tilt, 0.0, -1.0), offset).unwrap(),
            Matrix4::from_diagonal(&Vector4::new(1e-4, 1e-4, 1e-4, 25.0)),
            CameraCoordinate(Vector3::new(0.0, 0.0, offset)),
        )
    }

    #[test]
    fn test_match_picks_most_aligned_plane() {
        let context = TrackingContext::new(&SlamConfig::default());
        let pose = Pose::default();
        let plane = MapPlane::from_detection(&[wall(2000.0, 0.0)], 0, &pose, &context).unwrap();

        let detections = [wall(2050.0, 0.2), wall(2030.0, 0.01), wall(3000.0, 0.0)];
        let search = MatchSearch::new(&pose, &context.camera, &context.matching, false);
        assert_eq!(plane.find_match(&detections, &search, &[false; 3]), Some(1));
        assert_eq!(plane.find_match(&detections, &search, &[false, true, false]), Some(0));
        assert_eq!(plane.find_match(&detections, &search, &[true, true, false]), None);
    }

    #[test]
    fn test_track_merges_flipped_observation() {
        let context = TrackingContext::new(&SlamConfig::default());
        let pose = Pose::default();
        let mut plane = MapPlane::from_detection(&[wall(2000.0, 0.0)], 0, &pose, &context).unwrap();

        let flipped = DetectedPlane::new(
            PlaneCameraCoordinates::new(Vector3::new(0.0, 0.0, 1.0), -2010.0).unwrap(),
            Matrix4::from_diagonal(&Vector4::new(1e-4, 1e-4, 1e-4, 25.0)),
            CameraCoordinate(Vector3::new(0.0, 0.0, 2010.0)),
        );
        plane.track(&[flipped], 0, &pose, &context).unwrap();

        assert_relative_eq!(plane.parametrization().normal, Vector3::new(0.0, 0.0, -1.0), epsilon = 1e-9);
        assert_relative_eq!(plane.parametrization().offset, 2005.0, epsilon = 1e-2);
        assert!(plane.covariance()[(3, 3)] < 25.0);
    }
}

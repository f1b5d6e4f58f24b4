//! Per-frame feature detection, one detector per modality.
//!
//! The keypoint and plane detectors are independent, so they run on two
//! scoped threads and the frame waits for both.

use std::thread;

use tracing::debug;

use crate::error::SlamError;
use crate::features::{DetectedKeypoints, DetectedPlane};
use crate::geometry::ScreenCoordinate2D;
use crate::map::FeatureId;

/// Last known screen position of a local map landmark, used by detectors
/// that can follow keypoints between frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingHint {
    pub id: FeatureId,
    pub position: ScreenCoordinate2D,
}

/// Source of keypoints for a frame of type `I`.
pub trait KeypointDetector<I: ?Sized>: Send {
    fn detect_keypoints(&mut self, frame: &I, hints: &[TrackingHint]) -> Result<DetectedKeypoints, SlamError>;
}

/// Source of planes for a frame of type `I`.
pub trait PlaneDetector<I: ?Sized>: Send {
    fn detect_planes(&mut self, frame: &I) -> Result<Vec<DetectedPlane>, SlamError>;
}

/// Everything detected in one frame.
#[derive(Debug, Clone, Default)]
pub struct DetectedFeatures {
    pub keypoints: DetectedKeypoints,
    pub planes: Vec<DetectedPlane>,
}

/// Run both detectors concurrently on the same frame.
pub fn detect_features<I, K, P>(
    frame: &I,
    hints: &[TrackingHint],
    keypoint_detector: &mut K,
    plane_detector: &mut P,
) -> Result<DetectedFeatures, SlamError>
where
    I: Sync + ?Sized,
    K: KeypointDetector<I>,
    P: PlaneDetector<I>,
{
    let (keypoints, planes) = thread::scope(|scope| {
        let keypoint_handle = scope.spawn(|| keypoint_detector.detect_keypoints(frame, hints));
        let planes = plane_detector.detect_planes(frame);
        let keypoints = keypoint_handle
            .join()
            .map_err(|_| SlamError::Detection("keypoint detector panicked".to_string()));
        (keypoints, planes)
    });
    let keypoints = keypoints??;
    let planes = planes?;

    debug!(
        "[Detection] {} keypoints ({} tracked), {} planes",
        keypoints.len(),
        keypoints.tracked_count(),
        planes.len()
    );
    Ok(DetectedFeatures { keypoints, planes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::DetectedKeyPoint;
    use crate::geometry::{CameraCoordinate, PlaneCameraCoordinates, ScreenCoordinate};
    use nalgebra::{Matrix4, Vector3};
    use std::collections::HashMap;

    struct FixedKeypoints;

    impl KeypointDetector<[f64]> for FixedKeypoints {
        fn detect_keypoints(&mut self, frame: &[f64], hints: &[TrackingHint]) -> Result<DetectedKeypoints, SlamError> {
            let keypoints = frame
                .iter()
                .map(|depth| DetectedKeyPoint::new(ScreenCoordinate::new(10.0, 10.0, *depth), None))
                .collect();
            let tracking: HashMap<FeatureId, usize> = hints.iter().map(|hint| (hint.id, 0)).collect();
            Ok(DetectedKeypoints::new(keypoints, tracking))
        }
    }

    struct OnePlane;

    impl PlaneDetector<[f64]> for OnePlane {
        fn detect_planes(&mut self, _frame: &[f64]) -> Result<Vec<DetectedPlane>, SlamError> {
            Ok(vec![DetectedPlane::new(
                PlaneCameraCoordinates::new(Vector3::new(0.0, 0.0, -1.0), 1000.0)
                    .map_err(|e| SlamError::Detection(e.to_string()))?,
                Matrix4::identity(),
                CameraCoordinate(Vector3::new(0.0, 0.0, 1000.0)),
            )])
        }
    }

    struct FailingPlanes;

    impl PlaneDetector<[f64]> for FailingPlanes {
        fn detect_planes(&mut self, _frame: &[f64]) -> Result<Vec<DetectedPlane>, SlamError> {
            Err(SlamError::Detection("no depth image".to_string()))
        }
    }

    #[test]
    fn test_detect_features_joins_both_detectors() {
        let frame = [1000.0, 2000.0, 0.0];
        let hints = [TrackingHint {
            id: FeatureId::new(3),
            position: ScreenCoordinate2D::new(10.0, 10.0),
        }];

        let features = detect_features(&frame[..], &hints, &mut FixedKeypoints, &mut OnePlane).unwrap();
        assert_eq!(features.keypoints.len(), 3);
        assert_eq!(features.keypoints.tracked_count(), 1);
        assert_eq!(features.planes.len(), 1);
    }

    #[test]
    fn test_detector_error_is_propagated() {
        let frame = [1000.0];
        let result = detect_features(&frame[..], &[], &mut FixedKeypoints, &mut FailingPlanes);
        assert!(matches!(result, Err(SlamError::Detection(_))));
    }
}

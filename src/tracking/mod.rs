//! Landmark tracking: the shared Kalman filter, resolved point tracking and
//! inverse-depth point tracking, plus the per-frame tracking state.
//!
//! Every landmark update reads its constants and the filter from one
//! [`TrackingContext`], built once at system start.

pub mod inverse_depth_tracking;
pub mod kalman;
pub mod point_tracking;
pub mod result;
pub mod state;

pub use inverse_depth_tracking::{PointInverseDepth, ScreenSegment};
pub use kalman::{KalmanFilter, PlaneKalmanFilter, PointKalmanFilter};
pub use point_tracking::{TrackedPoint, TrackingUpdate};
pub use result::{FrameResult, KindStatistics, TimingStats};
pub use state::TrackingState;

use crate::config::{DetectionConfig, MappingConfig, MatchingConfig, SlamConfig};
use crate::geometry::CameraModel;

/// Read-only inputs shared by every landmark update of a frame.
#[derive(Debug, Clone)]
pub struct TrackingContext {
    pub camera: CameraModel,
    pub detection: DetectionConfig,
    pub matching: MatchingConfig,
    pub mapping: MappingConfig,
    pub filter: PointKalmanFilter,
    pub plane_filter: PlaneKalmanFilter,
}

impl TrackingContext {
    pub fn new(config: &SlamConfig) -> Self {
        Self {
            camera: config.camera,
            detection: config.detection.clone(),
            matching: config.matching.clone(),
            mapping: config.mapping.clone(),
            filter: PointKalmanFilter::static_state(config.kalman.process_noise),
            plane_filter: PlaneKalmanFilter::static_state(config.kalman.process_noise),
        }
    }
}

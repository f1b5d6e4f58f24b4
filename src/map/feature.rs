//! Shared capability of every landmark kind, and the lifecycle counters
//! driving the staged -> local -> lost transitions.
//!
//! # Lifecycle
//!
//! - **Staged**: fresh landmarks start with `successive_matched_count = 1`.
//!   A match adds one, a missed frame removes `remove_n_matches`. The
//!   confidence is `count / staged_age_confidence`, clamped to `[-1, 1]`.
//!   Above `minimum_confidence_for_map` the landmark is promoted, at or
//!   below 0 it is discarded.
//! - **Local**: a match increments `age` and resets `failed_tracking_count`,
//!   a missed frame decrements `age` and increments the failure count. The
//!   landmark is lost once the failure count exceeds
//!   `unmatched_count_to_lose`.

use serde::{Deserialize, Serialize};

use crate::config::{LifecycleConfig, MatchingConfig};
use crate::error::TrackingError;
use crate::geometry::{CameraModel, Pose, ScreenCoordinate2D, WorldToCamera};
use crate::map::types::{Color, FeatureId, FeatureKind};
use crate::map::writer::LandmarkRecord;
use crate::tracking::{ScreenSegment, TrackingContext};

/// Per landmark counters. Their meaning depends on the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleCounters {
    pub successive_matched_count: i32,
    pub age: i32,
    pub failed_tracking_count: u32,
}

impl Default for LifecycleCounters {
    fn default() -> Self {
        Self {
            successive_matched_count: 1,
            age: 0,
            failed_tracking_count: 0,
        }
    }
}

impl LifecycleCounters {
    pub fn staged_confidence(&self, config: &LifecycleConfig) -> f64 {
        let confidence = f64::from(self.successive_matched_count) / f64::from(config.staged_age_confidence.max(1));
        confidence.clamp(-1.0, 1.0)
    }

    pub fn local_confidence(&self, config: &LifecycleConfig) -> f64 {
        let confidence = f64::from(self.age) / f64::from(config.age_confidence.max(1));
        confidence.clamp(-1.0, 1.0)
    }

    pub fn mark_staged_matched(&mut self) {
        self.successive_matched_count += 1;
    }

    pub fn mark_staged_unmatched(&mut self, config: &LifecycleConfig) {
        self.successive_matched_count -= config.remove_n_matches as i32;
    }

    pub fn mark_local_matched(&mut self) {
        self.age += 1;
        self.failed_tracking_count = 0;
    }

    pub fn mark_local_unmatched(&mut self, config: &LifecycleConfig) {
        self.age -= 1;
        self.failed_tracking_count += config.remove_n_matches;
    }

    pub fn should_promote(&self, config: &LifecycleConfig) -> bool {
        self.staged_confidence(config) > config.minimum_confidence_for_map
    }

    pub fn should_discard_staged(&self, config: &LifecycleConfig) -> bool {
        self.staged_confidence(config) <= 0.0
    }

    pub fn is_lost(&self, config: &LifecycleConfig) -> bool {
        self.failed_tracking_count > config.unmatched_count_to_lose
    }
}

/// Inputs of a landmark to detection search.
#[derive(Debug, Clone, Copy)]
pub struct MatchSearch<'a> {
    pub w2c: WorldToCamera,
    pub camera: &'a CameraModel,
    pub matching: &'a MatchingConfig,
    /// Wider window, used while tracking is lost.
    pub use_advanced_search: bool,
}

impl<'a> MatchSearch<'a> {
    pub fn new(pose: &Pose, camera: &'a CameraModel, matching: &'a MatchingConfig, use_advanced_search: bool) -> Self {
        Self {
            w2c: pose.world_to_camera(),
            camera,
            matching,
            use_advanced_search,
        }
    }

    /// Projection search radius (px).
    pub fn radius(&self) -> f64 {
        if self.use_advanced_search {
            self.matching.match_search_radius_px * 2.0
        } else {
            self.matching.match_search_radius_px
        }
    }
}

/// Where a landmark lands on the screen, for overlays and tracking hints.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScreenFootprint {
    Point(ScreenCoordinate2D),
    Segment(ScreenSegment),
    Plane { centroid: ScreenCoordinate2D },
}

impl ScreenFootprint {
    pub fn center(&self) -> ScreenCoordinate2D {
        match self {
            ScreenFootprint::Point(point) => *point,
            ScreenFootprint::Segment(segment) => segment.middle(),
            ScreenFootprint::Plane { centroid } => *centroid,
        }
    }
}

/// Capability shared by every landmark kind stored in a
/// [`FeatureMap`](crate::map::FeatureMap).
pub trait MapFeature: Sized {
    const KIND: FeatureKind;

    /// Detections of the frame this kind is matched against.
    type Detections: ?Sized;
    /// Association handed to the pose optimizer.
    type Match;

    fn id(&self) -> FeatureId;

    /// Detection matched this frame, if any.
    fn matched_index(&self) -> Option<usize>;

    fn set_matched_index(&mut self, index: Option<usize>);

    fn detection_count(detections: &Self::Detections) -> usize;

    /// Whether an unmatched detection can seed a new landmark of this kind.
    fn can_add_to_map(detections: &Self::Detections, index: usize, context: &TrackingContext) -> bool;

    fn from_detection(
        detections: &Self::Detections,
        index: usize,
        pose: &Pose,
        context: &TrackingContext,
    ) -> Result<Self, TrackingError>;

    /// Search the detection continuing this landmark.
    fn find_match(&self, detections: &Self::Detections, search: &MatchSearch<'_>, is_matched: &[bool]) -> Option<usize>;

    fn make_match(&self, detections: &Self::Detections, index: usize) -> Option<Self::Match>;

    /// Merge the matched detection. On error the landmark is unchanged.
    fn track(
        &mut self,
        detections: &Self::Detections,
        index: usize,
        pose: &Pose,
        context: &TrackingContext,
    ) -> Result<(), TrackingError>;

    fn screen_footprint(&self, w2c: &WorldToCamera, camera: &CameraModel) -> Option<ScreenFootprint>;

    fn to_record(&self, counters: &LifecycleCounters, color: Color) -> LandmarkRecord;
}

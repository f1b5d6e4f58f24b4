//! Tracking results and diagnostics structures.
//!
//! These types describe what happened during processing of a single frame:
//! - high level tracking state (OK / LOST / etc.)
//! - optimized (or predicted) pose
//! - per landmark kind match and inlier counts
//! - timing information for profiling

use crate::geometry::Pose;
use crate::map::PerKind;
use crate::tracking::TrackingState;

/// Summary of tracking for a single frame.
#[derive(Debug, Clone)]
pub struct FrameResult {
    pub frame_index: usize,
    pub state: TrackingState,
    /// Optimized pose, or the predicted pose when the optimization failed.
    pub pose: Pose,
    /// Whether `pose` comes from a successful optimization.
    pub pose_optimized: bool,
    pub statistics: PerKind<KindStatistics>,
    pub timing: TimingStats,
}

/// Counters of one landmark kind for a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindStatistics {
    pub detected: usize,
    pub matched: usize,
    pub inliers: usize,
    pub outliers: usize,
    pub local_map_size: usize,
    pub staged_size: usize,
}

/// Timing breakdown for a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimingStats {
    pub total_ms: f64,
    /// Zero when the caller supplies already detected features.
    pub detection_ms: f64,
    pub matching_ms: f64,
    pub optimization_ms: f64,
    pub map_update_ms: f64,
}

impl FrameResult {
    pub fn total_inliers(&self) -> usize {
        self.statistics.iter().map(|(_, s)| s.inliers).sum()
    }

    pub fn total_matched(&self) -> usize {
        self.statistics.iter().map(|(_, s)| s.matched).sum()
    }
}

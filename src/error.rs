//! Error types shared by the geometric, tracking and optimization layers.
//!
//! Per-feature failures (one bad observation) are recoverable and usually
//! turned into "unmatched" or "outlier" by the caller. Whole-pose failures
//! propagate to the frame driver, which keeps the predicted pose for the
//! frame. `SlamError::CorruptedPose` is the only fatal condition.

use thiserror::Error;

/// Reasons a covariance matrix is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum CovarianceError {
    #[error("covariance contains a non finite entry")]
    NonFinite,

    #[error("covariance is not symmetric (max asymmetry {0:e})")]
    NotSymmetric(f64),

    #[error("covariance is not positive semi-definite (eigenvalue {0:e})")]
    NotPositiveSemiDefinite(f64),

    #[error("covariance has a negative diagonal entry ({0:e})")]
    NegativeVariance(f64),
}

/// Failures of a coordinate transform or projection.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum GeometryError {
    #[error("point is behind the camera (z = {0})")]
    BehindCamera(f64),

    #[error("depth {0} is outside of the valid sensor range")]
    InvalidDepth(f64),

    #[error("bearing vector is degenerate")]
    DegenerateBearing,

    #[error("inverse depth must be strictly positive (got {0})")]
    NonPositiveInverseDepth(f64),

    #[error("plane normal is degenerate")]
    DegeneratePlane,

    #[error(transparent)]
    Covariance(#[from] CovarianceError),
}

/// Failures of a landmark tracking update. The landmark state is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum TrackingError {
    #[error("innovation covariance is singular")]
    SingularInnovation,

    #[error("detection {0} is missing or unusable")]
    InvalidDetection(usize),

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    Covariance(#[from] CovarianceError),
}

/// Failures of the pose optimization stage.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptimizationError {
    #[error("not enough matched features to constrain a pose (score {score:.3} < 1)")]
    NotEnoughFeatures { score: f64 },

    #[error("RANSAC iteration budget is empty")]
    NoIterationBudget,

    #[error("random subset sampling exhausted after {draws} draws (score {score:.3})")]
    SamplingExhausted { draws: usize, score: f64 },

    #[error("no candidate pose reached a consensus (best inlier score {score:.3})")]
    NoConsensus { score: f64 },

    #[error("pose solver failed: {0}")]
    SolverFailed(String),

    #[error("pose variance needs {required} successful trials, got {succeeded}")]
    VarianceFailed { succeeded: usize, required: usize },

    #[error(transparent)]
    Covariance(#[from] CovarianceError),
}

/// Frame level failures reported by the SLAM driver.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SlamError {
    /// The persisted pose covariance is invalid. All later propagation would be
    /// built on it, so the driver refuses to process more frames.
    #[error("stored pose covariance is corrupted: {0}")]
    CorruptedPose(CovarianceError),

    #[error("feature detection failed: {0}")]
    Detection(String),
}

//! Pose optimization.
//!
//! Matches from the local map go through RANSAC over minimal subsets, a
//! Levenberg-Marquardt refinement on the winning inliers, and a perturbation
//! estimate of the pose covariance:
//! - [`matches`]: per kind match containers and inlier/outlier sets
//! - [`features`]: residuals and scoring of each match kind
//! - [`pose_functor`]: the nonlinear refinement
//! - [`ransac`], [`variance`], [`pose_optimizer`]: the robust estimation

pub mod features;
pub mod loss;
pub mod matches;
pub mod pose_functor;
pub mod pose_optimizer;
pub mod ransac;
pub mod variance;

#[cfg(test)]
pub mod test_scene;

pub use features::{FeatureScoring, OptimizationFeature};
pub use loss::RobustLoss;
pub use matches::{MatchContainer, MatchSets, PlaneMatch, Point2dMatch, PointMatch};
pub use pose_functor::{SolverStatus, optimize_pose};
pub use pose_optimizer::{OptimizerSettings, PoseOptimizer};
pub use ransac::{PoseScore, RansacOutcome, compute_pose_with_ransac};
pub use variance::compute_pose_variance;

//! Frame pose optimizer: RANSAC, inlier refinement and pose covariance.

use rand::SeedableRng;
use rand::rngs::SmallRng;
use tracing::{debug, info};

use crate::config::{RansacConfig, SlamConfig, SolverConfig};
use crate::error::OptimizationError;
use crate::geometry::Pose;
use crate::map::PerKind;
use crate::optimizer::features::FeatureScoring;
use crate::optimizer::matches::{MatchContainer, MatchSets};
use crate::optimizer::ransac::compute_pose_with_ransac;
use crate::optimizer::variance::compute_pose_variance;

/// Everything the optimizer reads from the configuration.
#[derive(Debug, Clone)]
pub struct OptimizerSettings {
    pub scoring: FeatureScoring,
    pub solver: SolverConfig,
    pub ransac: RansacConfig,
    pub minimum_for_optimization: PerKind<usize>,
    pub variance_iterations: usize,
    pub variance_regularization: f64,
    /// Sequential variance trials and a seeded generator.
    pub deterministic: bool,
    pub random_seed: u64,
}

impl OptimizerSettings {
    pub fn new(config: &SlamConfig) -> Self {
        let optimization = &config.optimization;
        Self {
            scoring: FeatureScoring::new(config),
            solver: optimization.solver,
            ransac: config.ransac.clone(),
            minimum_for_optimization: optimization.minimum_for_optimization,
            variance_iterations: optimization.variance_iterations,
            variance_regularization: optimization.variance_regularization,
            deterministic: optimization.deterministic || cfg!(feature = "deterministic"),
            random_seed: optimization.random_seed,
        }
    }
}

pub struct PoseOptimizer {
    settings: OptimizerSettings,
    rng: SmallRng,
}

impl PoseOptimizer {
    pub fn new(config: &SlamConfig) -> Self {
        let settings = OptimizerSettings::new(config);
        let rng = if settings.deterministic {
            SmallRng::seed_from_u64(settings.random_seed)
        } else {
            SmallRng::from_entropy()
        };
        Self { settings, rng }
    }

    pub fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }

    /// Estimate the pose observing `matches`, starting from `seed`.
    ///
    /// Returns the optimized pose, with its covariance, and the inlier and
    /// outlier partition of the matches for that pose.
    pub fn compute_optimized_pose(
        &mut self,
        seed: &Pose,
        matches: &MatchContainer,
    ) -> Result<(Pose, MatchSets), OptimizationError> {
        let outcome = compute_pose_with_ransac(seed, matches, &self.settings, &mut self.rng)?;
        let covariance = compute_pose_variance(&outcome.pose, &outcome.score.sets.inliers, &self.settings, &mut self.rng)?;

        let pose = Pose::new(outcome.pose.position, outcome.pose.orientation, covariance);
        debug!(
            "[PoseOptimizer] Moved {:.2} mm and {:.4} rad from the seed",
            pose.position_error(seed),
            pose.angle_error(seed)
        );
        info!(
            "[PoseOptimizer] Pose optimized in {} RANSAC iterations: {} inliers, {} outliers",
            outcome.iterations,
            outcome.score.sets.inliers.len(),
            outcome.score.sets.outliers.len()
        );
        Ok((pose, outcome.score.sets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::check_covariance;
    use crate::optimizer::test_scene::{self, TestScene};

    fn deterministic_optimizer(config: &SlamConfig) -> PoseOptimizer {
        let mut config = config.clone();
        config.optimization.deterministic = true;
        config.optimization.variance_iterations = 20;
        PoseOptimizer::new(&config)
    }

    #[test]
    fn test_insufficient_features() {
        let scene = TestScene::new(2, 0, 0);
        let mut optimizer = deterministic_optimizer(&scene.config);

        let result = optimizer.compute_optimized_pose(&scene.true_pose, &scene.matches);
        match result {
            Err(OptimizationError::NotEnoughFeatures { score }) => {
                approx::assert_relative_eq!(score, 0.4, epsilon = 1e-12)
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_perfect_synthetic_points() {
        let scene = TestScene::new(20, 0, 0);
        let mut optimizer = deterministic_optimizer(&scene.config);
        let seed = test_scene::perturbed(&scene.true_pose, 10.0, 0.01);

        let (pose, sets) = optimizer.compute_optimized_pose(&seed, &scene.matches).unwrap();

        assert!(pose.position_error(&scene.true_pose) < 1e-3);
        assert!(pose.angle_error(&scene.true_pose) < 1e-6);
        assert_eq!(sets.inliers.points.len(), 20);
        assert!(sets.outliers.is_empty());
        assert!(check_covariance(&pose.covariance).is_ok());
    }

    #[test]
    fn test_outliers_are_rejected() {
        // 20 exact points and 5 extra ones moved far off
        let scene = TestScene::new(25, 0, 0).with_point_outliers(20..25, 50.0);
        let mut optimizer = deterministic_optimizer(&scene.config);
        let seed = test_scene::perturbed(&scene.true_pose, 5.0, 0.005);

        let (pose, sets) = optimizer.compute_optimized_pose(&seed, &scene.matches).unwrap();

        assert!(pose.position_error(&scene.true_pose) < 1e-3);
        assert!(pose.angle_error(&scene.true_pose) < 1e-6);
        assert_eq!(sets.inliers.points.len(), 20);
        assert_eq!(sets.outliers.points.len(), 5);
        let outlier_ids = sets.outlier_ids();
        for m in &scene.matches.points[20..] {
            assert!(outlier_ids.contains(&m.id));
        }
    }

    #[test]
    fn test_mixed_features_covariance() {
        let scene = TestScene::new(10, 6, 3);
        let mut optimizer = deterministic_optimizer(&scene.config);

        let (pose, sets) = optimizer.compute_optimized_pose(&scene.true_pose, &scene.matches).unwrap();

        assert!(pose.position_error(&scene.true_pose) < 1e-2);
        assert_eq!(sets.inliers.len(), scene.matches.len());
        assert!(check_covariance(&pose.covariance).is_ok());
        for i in 0..6 {
            assert!(pose.covariance[(i, i)] > 0.0);
        }
    }
}

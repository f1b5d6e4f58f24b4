//! Nonlinear pose refinement with the `levenberg-marquardt` solver.
//!
//! The 6 parameters are the camera position (mm) and a scaled-axis rotation
//! applied on top of the seed orientation:
//!
//! ```text
//! position    = x[0..3]
//! orientation = q_seed * exp(x[3..6])
//! ```
//!
//! Every match contributes its weighted, loss-reshaped residuals. The
//! Jacobian is computed by central differences.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use nalgebra::{DMatrix, DVector, Dyn, Matrix6, Owned, UnitQuaternion, Vector3};
use tracing::debug;

use crate::config::SolverConfig;
use crate::error::OptimizationError;
use crate::geometry::Pose;
use crate::geometry::so3::scaled_axis_to_quaternion;
use crate::optimizer::features::{FeatureScoring, OptimizationFeature};
use crate::optimizer::matches::{MatchContainer, PlaneMatch, Point2dMatch, PointMatch};

const PARAMETER_COUNT: usize = 6;

/// Relative step of the central differences.
const DIFFERENCE_STEP: f64 = 1e-6;

/// Residual, in inlier threshold units, of a feature that cannot be
/// evaluated for a candidate pose.
const FAILED_FEATURE_RESIDUAL: f64 = 10.0;

/// Outcome of a solver run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverStatus {
    Converged,
    ResidualsZero,
    Orthogonal,
    NoImprovementPossible,
    TooManyFunctionEvaluation,
    ImproperInputParameters,
    NumericalFailure,
}

impl SolverStatus {
    /// Whether the solution must be discarded.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            SolverStatus::TooManyFunctionEvaluation | SolverStatus::ImproperInputParameters | SolverStatus::NumericalFailure
        )
    }
}

impl From<&TerminationReason> for SolverStatus {
    fn from(reason: &TerminationReason) -> Self {
        match reason {
            TerminationReason::Converged { .. } => SolverStatus::Converged,
            TerminationReason::ResidualsZero => SolverStatus::ResidualsZero,
            TerminationReason::Orthogonal => SolverStatus::Orthogonal,
            TerminationReason::NoImprovementPossible(_) => SolverStatus::NoImprovementPossible,
            TerminationReason::LostPatience => SolverStatus::TooManyFunctionEvaluation,
            TerminationReason::NoParameters | TerminationReason::NoResiduals | TerminationReason::WrongDimensions(_) => {
                SolverStatus::ImproperInputParameters
            }
            TerminationReason::Numerical(_) | TerminationReason::User(_) => SolverStatus::NumericalFailure,
        }
    }
}

impl std::fmt::Display for SolverStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SolverStatus::Converged => "converged",
            SolverStatus::ResidualsZero => "residuals are zero",
            SolverStatus::Orthogonal => "residuals orthogonal to the Jacobian",
            SolverStatus::NoImprovementPossible => "no further improvement possible",
            SolverStatus::TooManyFunctionEvaluation => "too many function evaluations",
            SolverStatus::ImproperInputParameters => "improper input parameters",
            SolverStatus::NumericalFailure => "numerical failure",
        };
        f.write_str(text)
    }
}

/// Number of residuals the matches produce.
pub fn residual_count(matches: &MatchContainer) -> usize {
    matches.points.len() * PointMatch::RESIDUAL_COUNT
        + matches.points_2d.len() * Point2dMatch::RESIDUAL_COUNT
        + matches.planes.len() * PlaneMatch::RESIDUAL_COUNT
}

struct PoseProblem<'a> {
    seed_orientation: UnitQuaternion<f64>,
    matches: &'a MatchContainer,
    scoring: &'a FeatureScoring,
    residual_count: usize,
    params: DVector<f64>,
}

impl PoseProblem<'_> {
    fn orientation_at(&self, params: &DVector<f64>) -> UnitQuaternion<f64> {
        let delta = Vector3::new(params[3], params[4], params[5]);
        self.seed_orientation * scaled_axis_to_quaternion(&delta)
    }

    fn pose_at(&self, params: &DVector<f64>) -> Pose {
        Pose::new(
            Vector3::new(params[0], params[1], params[2]),
            self.orientation_at(params),
            Matrix6::zeros(),
        )
    }

    fn write_kind<F: OptimizationFeature>(&self, features: &[F], pose: &Pose, out: &mut [f64], mut cursor: usize) -> usize {
        let w2c = pose.world_to_camera();
        let failed = self.scoring.loss.apply(self.scoring.weight::<F>().sqrt() * FAILED_FEATURE_RESIDUAL);
        for feature in features {
            let slot = &mut out[cursor..cursor + F::RESIDUAL_COUNT];
            if self.scoring.write_residuals(feature, &w2c, slot).is_err() {
                slot.fill(failed);
            }
            cursor += F::RESIDUAL_COUNT;
        }
        cursor
    }

    fn residuals_at(&self, params: &DVector<f64>) -> DVector<f64> {
        let pose = self.pose_at(params);
        let mut residuals = DVector::zeros(self.residual_count);
        let out = residuals.as_mut_slice();
        let cursor = self.write_kind(&self.matches.points, &pose, out, 0);
        let cursor = self.write_kind(&self.matches.points_2d, &pose, out, cursor);
        self.write_kind(&self.matches.planes, &pose, out, cursor);
        residuals
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for PoseProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.clone_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.residuals_at(&self.params))
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut jacobian = DMatrix::zeros(self.residual_count, PARAMETER_COUNT);
        let mut shifted = self.params.clone();
        for column in 0..PARAMETER_COUNT {
            let value = self.params[column];
            let step = DIFFERENCE_STEP * value.abs().max(1.0);

            shifted[column] = value + step;
            let forward = self.residuals_at(&shifted);
            shifted[column] = value - step;
            let backward = self.residuals_at(&shifted);
            shifted[column] = value;

            jacobian.set_column(column, &((forward - backward) / (2.0 * step)));
        }
        Some(jacobian)
    }
}

/// Refine `seed` on every match of the container. The returned pose keeps
/// the seed covariance.
pub fn optimize_pose(
    seed: &Pose,
    matches: &MatchContainer,
    scoring: &FeatureScoring,
    solver: &SolverConfig,
) -> Result<Pose, OptimizationError> {
    let residual_count = residual_count(matches);
    if residual_count < PARAMETER_COUNT {
        return Err(OptimizationError::SolverFailed(format!(
            "{} residuals cannot constrain {} parameters",
            residual_count, PARAMETER_COUNT
        )));
    }

    let problem = PoseProblem {
        seed_orientation: seed.orientation,
        matches,
        scoring,
        residual_count,
        params: DVector::from_vec(vec![seed.position.x, seed.position.y, seed.position.z, 0.0, 0.0, 0.0]),
    };

    let patience = (solver.maximum_function_evaluations / (PARAMETER_COUNT + 1)).max(1);
    let lm = LevenbergMarquardt::new()
        .with_ftol(solver.ftol)
        .with_xtol(solver.xtol)
        .with_gtol(solver.gtol)
        .with_stepbound(solver.step_bound)
        .with_patience(patience);

    let (problem, report) = lm.minimize(problem);
    let status = SolverStatus::from(&report.termination);
    if status.is_error() {
        return Err(OptimizationError::SolverFailed(format!(
            "{} after {} evaluations",
            status, report.number_of_evaluations
        )));
    }
    if !problem.params.iter().all(|v| v.is_finite()) {
        return Err(OptimizationError::SolverFailed("non finite pose parameters".to_string()));
    }
    debug!(
        "[PoseOptimizer] LM {} after {} evaluations, cost {:.3e}",
        status, report.number_of_evaluations, report.objective_function
    );

    let optimized = problem.pose_at(&problem.params);
    Ok(Pose::new(optimized.position, optimized.orientation, seed.covariance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlamConfig;
    use crate::optimizer::test_scene::{self, TestScene};

    #[test]
    fn test_refines_perturbed_pose_on_perfect_points() {
        let scene = TestScene::new(20, 0, 0);
        let scoring = FeatureScoring::new(&scene.config);
        let seed = test_scene::perturbed(&scene.true_pose, 20.0, 0.02);

        let optimized = optimize_pose(&seed, &scene.matches, &scoring, &scene.config.optimization.solver).unwrap();

        assert!(optimized.position_error(&scene.true_pose) < 1e-3);
        assert!(optimized.angle_error(&scene.true_pose) < 1e-6);
        assert_eq!(optimized.covariance, seed.covariance);
    }

    #[test]
    fn test_refines_with_mixed_features() {
        let scene = TestScene::new(6, 8, 3);
        let scoring = FeatureScoring::new(&scene.config);
        let seed = test_scene::perturbed(&scene.true_pose, 15.0, 0.01);

        let optimized = optimize_pose(&seed, &scene.matches, &scoring, &scene.config.optimization.solver).unwrap();

        assert!(optimized.position_error(&scene.true_pose) < 1e-2);
        assert!(optimized.angle_error(&scene.true_pose) < 1e-5);
    }

    #[test]
    fn test_rejects_underconstrained_problem() {
        let config = SlamConfig::default();
        let scene = TestScene::new(2, 0, 0);
        let scoring = FeatureScoring::new(&config);

        let result = optimize_pose(&scene.true_pose, &scene.matches, &scoring, &config.optimization.solver);
        assert!(matches!(result, Err(OptimizationError::SolverFailed(_))));
    }

    #[test]
    fn test_status_mapping() {
        assert!(!SolverStatus::from(&TerminationReason::Converged { ftol: true, xtol: false }).is_error());
        assert!(!SolverStatus::from(&TerminationReason::NoImprovementPossible("gtol")).is_error());
        assert!(SolverStatus::from(&TerminationReason::LostPatience).is_error());
        assert_eq!(
            SolverStatus::from(&TerminationReason::NoResiduals),
            SolverStatus::ImproperInputParameters
        );
    }
}

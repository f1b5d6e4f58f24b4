//! Pose covariance by perturbation trials.
//!
//! Every trial displaces the inlier landmarks by their own uncertainty and
//! refines the pose again. The sample covariance of the refined poses,
//! expressed as `(position, scaled-axis rotation)` relative to the
//! optimized pose, is the pose covariance.

use std::thread;

use nalgebra::{Matrix6, Vector6};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::{debug, warn};

use crate::error::OptimizationError;
use crate::geometry::so3::quaternion_to_scaled_axis;
use crate::geometry::{Pose, check_covariance};
use crate::optimizer::features::OptimizationFeature;
use crate::optimizer::matches::MatchContainer;
use crate::optimizer::pose_functor::optimize_pose;
use crate::optimizer::pose_optimizer::OptimizerSettings;

fn vary<F: OptimizationFeature, R: Rng + ?Sized>(features: &[F], rng: &mut R) -> Vec<F> {
    features.iter().map(|feature| feature.random_variation(rng)).collect()
}

/// Pose offset of one trial, or None when its refinement failed.
fn run_trial<R: Rng + ?Sized>(
    optimized: &Pose,
    inliers: &MatchContainer,
    settings: &OptimizerSettings,
    rng: &mut R,
) -> Option<Vector6<f64>> {
    let varied = MatchContainer {
        points: vary(&inliers.points, rng),
        points_2d: vary(&inliers.points_2d, rng),
        planes: vary(&inliers.planes, rng),
    };
    let pose = optimize_pose(optimized, &varied, &settings.scoring, &settings.solver).ok()?;
    let position = pose.position - optimized.position;
    let rotation = quaternion_to_scaled_axis(&(optimized.orientation.inverse() * pose.orientation));
    Some(Vector6::new(position.x, position.y, position.z, rotation.x, rotation.y, rotation.z))
}

fn run_sequential<R: Rng + ?Sized>(
    optimized: &Pose,
    inliers: &MatchContainer,
    settings: &OptimizerSettings,
    rng: &mut R,
) -> Vec<Vector6<f64>> {
    (0..settings.variance_iterations)
        .filter_map(|_| run_trial(optimized, inliers, settings, rng))
        .collect()
}

fn run_parallel<R: Rng + ?Sized>(
    optimized: &Pose,
    inliers: &MatchContainer,
    settings: &OptimizerSettings,
    rng: &mut R,
) -> Vec<Vector6<f64>> {
    let iterations = settings.variance_iterations;
    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, iterations.max(1));
    let samples = Mutex::new(Vec::with_capacity(iterations));

    thread::scope(|scope| {
        for worker in 0..workers {
            let trials = iterations / workers + usize::from(worker < iterations % workers);
            let mut worker_rng = SmallRng::seed_from_u64(rng.next_u64());
            let samples = &samples;
            scope.spawn(move || {
                let local: Vec<Vector6<f64>> = (0..trials)
                    .filter_map(|_| run_trial(optimized, inliers, settings, &mut worker_rng))
                    .collect();
                samples.lock().extend(local);
            });
        }
    });
    samples.into_inner()
}

/// Sample covariance, normalized by `n - 1`.
fn sample_covariance(samples: &[Vector6<f64>]) -> Matrix6<f64> {
    let count = samples.len() as f64;
    let mean = samples.iter().sum::<Vector6<f64>>() / count;
    let scatter = samples
        .iter()
        .map(|sample| {
            let centered = sample - mean;
            centered * centered.transpose()
        })
        .sum::<Matrix6<f64>>();
    scatter / (count - 1.0).max(1.0)
}

/// Covariance of `optimized` given the inlier matches it was refined on.
pub fn compute_pose_variance<R: RngCore>(
    optimized: &Pose,
    inliers: &MatchContainer,
    settings: &OptimizerSettings,
    rng: &mut R,
) -> Result<Matrix6<f64>, OptimizationError> {
    let iterations = settings.variance_iterations;
    let samples = if settings.deterministic || cfg!(feature = "deterministic") {
        run_sequential(optimized, inliers, settings, rng)
    } else {
        run_parallel(optimized, inliers, settings, rng)
    };

    let required = iterations.div_ceil(2).max(2);
    if samples.len() < required {
        warn!("[PoseOptimizer] Only {} of {} variance trials succeeded", samples.len(), iterations);
        return Err(OptimizationError::VarianceFailed {
            succeeded: samples.len(),
            required,
        });
    }

    let covariance = sample_covariance(&samples) + Matrix6::identity() * settings.variance_regularization;
    check_covariance(&covariance)?;
    debug!(
        "[PoseOptimizer] Pose variance from {} trials, position std [{:.2}, {:.2}, {:.2}] mm",
        samples.len(),
        covariance[(0, 0)].sqrt(),
        covariance[(1, 1)].sqrt(),
        covariance[(2, 2)].sqrt()
    );
    Ok(covariance)
}

//! RANSAC over the frame matches.
//!
//! Each iteration refines the pose on a random minimal subset and scores it
//! on every match. A feature scores `weight * min(distance, 1)` where the
//! distance is in inlier threshold units, so the lowest total score is the
//! best candidate. Kind weights are `1 / minimum_for_optimization`: a
//! minimal subset of any mix of kinds weighs 1.

use rand::Rng;
use rand_distr::StandardNormal;
use tracing::{debug, warn};

use crate::config::RansacConfig;
use crate::error::OptimizationError;
use crate::geometry::{Pose, WorldToCamera};
use crate::map::{FeatureKind, PerKind};
use crate::optimizer::features::{FeatureScoring, OptimizationFeature};
use crate::optimizer::matches::{MatchContainer, MatchSets};
use crate::optimizer::pose_functor::optimize_pose;
use crate::optimizer::pose_optimizer::OptimizerSettings;

/// Tolerance on the score of a minimal subset.
const SCORE_EPSILON: f64 = 1e-9;

/// Relative jitter of the kind selection weights.
const KIND_SELECTION_JITTER: f64 = 0.25;

/// Score of a pose over a full match set.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseScore {
    /// Sum of `weight * min(distance, 1)`. Lower is better.
    pub score: f64,
    /// Sum of the weights of the inliers.
    pub inlier_score: f64,
    pub sets: MatchSets,
}

/// Result of a RANSAC run.
#[derive(Debug, Clone)]
pub struct RansacOutcome {
    pub pose: Pose,
    pub score: PoseScore,
    pub iterations: usize,
    /// Score of each refined candidate, in sampling order.
    pub candidate_scores: Vec<f64>,
    /// Best score kept after each refined candidate.
    pub best_scores: Vec<f64>,
}

/// Maximum reachable score: every match counted at full weight.
pub fn available_score(matches: &MatchContainer, scoring: &FeatureScoring) -> f64 {
    FeatureKind::ALL
        .iter()
        .map(|kind| matches.count(*kind) as f64 * scoring.weights.get(*kind))
        .sum()
}

/// Smallest subset able to constrain a pose with the kinds present in
/// `matches`.
pub fn minimal_sample_size(matches: &MatchContainer, minimum_for_optimization: &PerKind<usize>) -> usize {
    minimum_for_optimization
        .iter()
        .filter(|(kind, _)| matches.count(*kind) > 0)
        .map(|(_, minimum)| *minimum)
        .min()
        .unwrap_or(1)
}

/// Iterations needed to draw one outlier free subset with the configured
/// probability, capped by the configured maximum.
pub fn iteration_budget(config: &RansacConfig, minimum_set: usize) -> usize {
    let all_inliers = config.inlier_proportion.powi(minimum_set.min(i32::MAX as usize) as i32);
    let budget = ((1.0 - config.probability_of_success).ln() / (1.0 - all_inliers).ln()).ceil();
    if budget.is_finite() && budget > 0.0 {
        (budget as usize).min(config.maximum_iterations)
    } else {
        0
    }
}

fn score_kind<F: OptimizationFeature>(
    features: &[F],
    w2c: &WorldToCamera,
    scoring: &FeatureScoring,
    inliers: &mut Vec<F>,
    outliers: &mut Vec<F>,
) -> (f64, f64) {
    let mut score = 0.0;
    let mut inlier_score = 0.0;
    for feature in features {
        let (feature_score, is_inlier) = scoring.score(feature, w2c);
        score += feature_score;
        if is_inlier {
            inlier_score += scoring.weight::<F>();
            inliers.push(feature.clone());
        } else {
            outliers.push(feature.clone());
        }
    }
    (score, inlier_score)
}

/// Score `pose` on every match and partition them.
pub fn score_pose(pose: &Pose, matches: &MatchContainer, scoring: &FeatureScoring) -> PoseScore {
    let w2c = pose.world_to_camera();
    let mut sets = MatchSets::default();
    let (inliers, outliers) = (&mut sets.inliers, &mut sets.outliers);
    let points = score_kind(&matches.points, &w2c, scoring, &mut inliers.points, &mut outliers.points);
    let points_2d = score_kind(&matches.points_2d, &w2c, scoring, &mut inliers.points_2d, &mut outliers.points_2d);
    let planes = score_kind(&matches.planes, &w2c, scoring, &mut inliers.planes, &mut outliers.planes);
    PoseScore {
        score: points.0 + points_2d.0 + planes.0,
        inlier_score: points.1 + points_2d.1 + planes.1,
        sets,
    }
}

fn take_random<F: Clone, R: Rng + ?Sized>(pool: &mut Vec<usize>, features: &[F], rng: &mut R, out: &mut Vec<F>) {
    if pool.is_empty() {
        return;
    }
    let index = pool.swap_remove(rng.gen_range(0..pool.len()));
    if let Some(feature) = features.get(index) {
        out.push(feature.clone());
    }
}

/// Draw a random subset weighing at least 1, without replacement. Kinds are
/// picked with a probability proportional to their remaining score, jittered
/// by a normal sample, so mixed subsets stay possible.
pub fn random_subset<R: Rng + ?Sized>(
    matches: &MatchContainer,
    scoring: &FeatureScoring,
    maximum_draws: usize,
    rng: &mut R,
) -> Result<MatchContainer, OptimizationError> {
    let mut pools = PerKind::new(
        (0..matches.points.len()).collect::<Vec<_>>(),
        (0..matches.points_2d.len()).collect::<Vec<_>>(),
        (0..matches.planes.len()).collect::<Vec<_>>(),
    );
    let mut subset = MatchContainer::default();
    let mut score = 0.0;

    for _ in 0..maximum_draws {
        if score >= 1.0 - SCORE_EPSILON {
            return Ok(subset);
        }
        let selection = pools.map(|kind, pool| {
            let jitter: f64 = rng.sample(StandardNormal);
            (pool.len() as f64 * scoring.weights.get(kind) * (1.0 + KIND_SELECTION_JITTER * jitter)).max(0.0)
        });
        let total: f64 = selection.iter().map(|(_, weight)| *weight).sum();
        if total <= 0.0 {
            continue;
        }

        let mut target = rng.gen_range(0.0..total);
        let mut chosen = FeatureKind::Plane;
        for (kind, weight) in selection.iter() {
            if target < *weight {
                chosen = kind;
                break;
            }
            target -= weight;
        }
        if pools.get(chosen).is_empty() {
            continue;
        }

        match chosen {
            FeatureKind::Point => take_random(&mut pools.point, &matches.points, rng, &mut subset.points),
            FeatureKind::Point2D => take_random(&mut pools.point_2d, &matches.points_2d, rng, &mut subset.points_2d),
            FeatureKind::Plane => take_random(&mut pools.plane, &matches.planes, rng, &mut subset.planes),
        }
        score += scoring.weights.get(chosen);
    }

    if score >= 1.0 - SCORE_EPSILON {
        Ok(subset)
    } else {
        Err(OptimizationError::SamplingExhausted {
            draws: maximum_draws,
            score,
        })
    }
}

/// Run RANSAC then refine on the winning inliers.
pub fn compute_pose_with_ransac<R: Rng + ?Sized>(
    seed: &Pose,
    matches: &MatchContainer,
    settings: &OptimizerSettings,
    rng: &mut R,
) -> Result<RansacOutcome, OptimizationError> {
    let scoring = &settings.scoring;
    let maximum_score = available_score(matches, scoring);
    if maximum_score < 1.0 - SCORE_EPSILON {
        return Err(OptimizationError::NotEnoughFeatures { score: maximum_score });
    }

    let minimum_set = minimal_sample_size(matches, &settings.minimum_for_optimization);
    let budget = iteration_budget(&settings.ransac, minimum_set);
    if budget == 0 {
        return Err(OptimizationError::NoIterationBudget);
    }
    let early_stop_score = settings.ransac.early_stop_score_ratio * maximum_score;

    let mut best: Option<(Pose, PoseScore)> = None;
    let mut iterations = 0;
    let mut candidate_scores = Vec::with_capacity(budget);
    let mut best_scores = Vec::with_capacity(budget);
    for iteration in 0..budget {
        iterations = iteration + 1;
        let subset = random_subset(matches, scoring, settings.ransac.maximum_sampling_draws, rng)?;
        let candidate = match optimize_pose(seed, &subset, scoring, &settings.solver) {
            Ok(candidate) => candidate,
            Err(e) => {
                debug!("[Ransac] Iteration {}: subset refinement failed: {}", iteration, e);
                continue;
            }
        };

        let candidate_score = score_pose(&candidate, matches, scoring);
        let reached_early_stop = candidate_score.inlier_score >= early_stop_score;
        candidate_scores.push(candidate_score.score);
        if best.as_ref().is_none_or(|(_, best_score)| candidate_score.score < best_score.score) {
            best = Some((candidate, candidate_score));
        }
        if let Some((_, best_score)) = &best {
            best_scores.push(best_score.score);
        }
        if reached_early_stop {
            debug!("[Ransac] Early stop after {} iterations", iterations);
            break;
        }
    }

    let Some((best_pose, best_score)) = best else {
        return Err(OptimizationError::NoConsensus { score: 0.0 });
    };
    if best_score.inlier_score < 1.0 - SCORE_EPSILON {
        return Err(OptimizationError::NoConsensus {
            score: best_score.inlier_score,
        });
    }

    let (pose, score) = match optimize_pose(&best_pose, &best_score.sets.inliers, scoring, &settings.solver) {
        Ok(refined) => {
            let refined_score = score_pose(&refined, matches, scoring);
            if refined_score.score <= best_score.score {
                (refined, refined_score)
            } else {
                debug!(
                    "[Ransac] Inlier refinement degraded the score ({:.4} > {:.4}), keeping the candidate",
                    refined_score.score, best_score.score
                );
                (best_pose, best_score)
            }
        }
        Err(e) => {
            warn!("[Ransac] Inlier refinement failed: {}", e);
            (best_pose, best_score)
        }
    };

    debug!(
        "[Ransac] {} iterations, score {:.4} / {:.4}, {} inliers, {} outliers",
        iterations,
        score.score,
        maximum_score,
        score.sets.inliers.len(),
        score.sets.outliers.len()
    );
    Ok(RansacOutcome {
        pose,
        score,
        iterations,
        candidate_scores,
        best_scores,
    })
}

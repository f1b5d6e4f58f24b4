//! Run-time configuration.
//!
//! Every numeric constant used by the matching, mapping and optimization
//! stages lives here. Each section implements `Default` with the values the
//! system is tuned for, and every field is optional in YAML files.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::geometry::CameraModel;
use crate::map::PerKind;

/// Top level configuration of the SLAM core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlamConfig {
    pub camera: CameraModel,
    pub detection: DetectionConfig,
    pub matching: MatchingConfig,
    pub mapping: MappingConfig,
    pub optimization: OptimizationConfig,
    pub ransac: RansacConfig,
    pub kalman: KalmanConfig,
    pub tracking: TrackingConfig,
}

impl SlamConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("Failed to parse SLAM configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config: Self = serde_yaml::from_reader(
            File::open(path).with_context(|| format!("Failed to open {:?}", path))?,
        )
        .with_context(|| format!("Failed to parse {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would make the pipeline ill-posed.
    pub fn validate(&self) -> Result<()> {
        if self.camera.fx <= 0.0 || self.camera.fy <= 0.0 {
            bail!("camera focal lengths must be positive");
        }
        if self.detection.min_depth_mm >= self.detection.max_depth_mm {
            bail!(
                "invalid depth range ({} >= {})",
                self.detection.min_depth_mm,
                self.detection.max_depth_mm
            );
        }
        if self.detection.inverse_depth_baseline <= 0.0 {
            bail!("inverse depth baseline must be strictly positive");
        }
        for (kind, minimum) in self.optimization.minimum_for_optimization.iter() {
            if *minimum == 0 {
                bail!("minimum {} count for optimization must be at least 1", kind);
            }
        }
        let p = self.ransac.probability_of_success;
        let w = self.ransac.inlier_proportion;
        if !(0.0..1.0).contains(&p) || !(0.0..1.0).contains(&w) || w == 0.0 {
            bail!("RANSAC probabilities must be inside (0, 1)");
        }
        if self.optimization.variance_iterations < 2 {
            bail!("pose variance needs at least two trials");
        }
        Ok(())
    }
}

/// Sensor limits and initial uncertainties of fresh observations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Depth below (or equal to) this value is invalid (mm).
    pub min_depth_mm: f64,
    /// Depth above this value is invalid (mm).
    pub max_depth_mm: f64,
    /// Quadratic depth quantization coefficient: sigma_z = k * z².
    pub depth_sigma_error: f64,
    /// Lower bound of the depth standard deviation (mm).
    pub min_depth_sigma_mm: f64,
    /// Standard deviation of a detected keypoint position (px).
    pub keypoint_sigma_px: f64,
    /// Initial inverse depth of a point observed without depth (1/mm).
    pub inverse_depth_baseline: f64,
    /// Initial bearing angle standard deviation (degrees).
    pub inverse_depth_angle_baseline_deg: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_depth_mm: 40.0,
            max_depth_mm: 6000.0,
            depth_sigma_error: 1.425e-6,
            min_depth_sigma_mm: 1.0,
            keypoint_sigma_px: 1.0,
            inverse_depth_baseline: 1.0 / 1500.0,
            inverse_depth_angle_baseline_deg: 1.0,
        }
    }
}

impl DetectionConfig {
    pub fn is_depth_valid(&self, depth: f64) -> bool {
        depth.is_finite() && depth > self.min_depth_mm && depth <= self.max_depth_mm
    }
}

/// Landmark to detection association parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Projection search radius (px). Doubled in advanced search.
    pub match_search_radius_px: f64,
    /// Maximum Hamming distance between two matched descriptors.
    pub maximum_descriptor_distance: u32,
    /// Minimum cosine between two matched plane normals.
    pub plane_maximum_cos_angle: f64,
    /// Maximum offset difference between two matched planes (mm).
    pub plane_maximum_merge_distance_mm: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            match_search_radius_px: 30.0,
            maximum_descriptor_distance: 64,
            plane_maximum_cos_angle: (std::f64::consts::PI / 10.0).cos(),
            plane_maximum_merge_distance_mm: 100.0,
        }
    }
}

/// Staged -> local -> lost transition constants of one landmark kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Successive matches needed for a staged landmark to reach confidence 1.
    pub staged_age_confidence: u32,
    /// Age needed for a local landmark to reach confidence 1.
    pub age_confidence: u32,
    /// Staged landmarks above this confidence are promoted.
    pub minimum_confidence_for_map: f64,
    /// Local landmarks missed more than this many frames in a row are lost.
    pub unmatched_count_to_lose: u32,
    /// Matches removed from a staged landmark per missed frame.
    pub remove_n_matches: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            staged_age_confidence: 10,
            age_confidence: 15,
            minimum_confidence_for_map: 0.9,
            unmatched_count_to_lose: 3,
            remove_n_matches: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    pub lifecycle: PerKind<LifecycleConfig>,
    /// 2D points with a linearity score below this value become 3D points.
    pub upgrade_linearity_threshold: f64,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            lifecycle: PerKind::default(),
            upgrade_linearity_threshold: 0.1,
        }
    }
}

/// Inlier thresholds, one per distance metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InlierThresholds {
    /// Retroprojection error of a 3D point (px).
    pub point_px: f64,
    /// Lateral error of a 2D point at its estimated depth (mm).
    pub point_2d_mm: f64,
    /// Angle between plane normals (rad).
    pub plane_angle_rad: f64,
    /// Plane offset difference (mm).
    pub plane_distance_mm: f64,
}

impl Default for InlierThresholds {
    fn default() -> Self {
        Self {
            point_px: 10.0,
            point_2d_mm: 50.0,
            plane_angle_rad: 0.1,
            plane_distance_mm: 50.0,
        }
    }
}

/// Levenberg-Marquardt stopping criteria.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub maximum_function_evaluations: usize,
    /// Relative tolerance on the solution vector norm.
    pub xtol: f64,
    /// Relative tolerance on the residual vector norm.
    pub ftol: f64,
    /// Tolerance on the orthogonality between residuals and the Jacobian.
    pub gtol: f64,
    /// Initial step bound factor.
    pub step_bound: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            maximum_function_evaluations: 1024,
            xtol: 1e-10,
            ftol: 1e-10,
            gtol: 0.0,
            step_bound: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    /// Matches of one kind needed to constrain a pose on their own.
    pub minimum_for_optimization: PerKind<usize>,
    pub inlier_thresholds: InlierThresholds,
    /// Shape of the generalized robust loss (2 is L2, 0 Cauchy, below -100 Welsch).
    pub loss_alpha: f64,
    /// Scale of the robust loss, in inlier threshold units.
    pub loss_scale: f64,
    pub solver: SolverConfig,
    /// Perturbation trials used to estimate the pose covariance.
    pub variance_iterations: usize,
    /// Added to the pose covariance diagonal.
    pub variance_regularization: f64,
    /// Run variance trials sequentially with a seeded generator.
    pub deterministic: bool,
    pub random_seed: u64,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            minimum_for_optimization: PerKind::new(5, 6, 3),
            inlier_thresholds: InlierThresholds::default(),
            loss_alpha: 1.0,
            loss_scale: 1.0,
            solver: SolverConfig::default(),
            variance_iterations: 100,
            variance_regularization: 0.001,
            deterministic: cfg!(feature = "deterministic"),
            random_seed: 0x5eed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacConfig {
    /// Probability that at least one sampled subset is outlier free.
    pub probability_of_success: f64,
    /// Assumed proportion of inliers among the matches.
    pub inlier_proportion: f64,
    /// Hard cap on the iteration budget.
    pub maximum_iterations: usize,
    /// Stop once the inlier score reaches this share of the maximum score.
    pub early_stop_score_ratio: f64,
    /// Upper bound on random draws used to build one subset.
    pub maximum_sampling_draws: usize,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            probability_of_success: 0.99,
            inlier_proportion: 0.6,
            maximum_iterations: 200,
            early_stop_score_ratio: 0.9,
            maximum_sampling_draws: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanConfig {
    /// Diagonal process noise of the static landmark filter.
    pub process_noise: f64,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            process_noise: 1e-4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Tracking is lost after more than this many failed frames in a row.
    pub maximum_consecutive_failures: u32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            maximum_consecutive_failures: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SlamConfig::default().validate().is_ok());
    }

    #[test]
    fn test_depth_validity_bounds() {
        let detection = DetectionConfig::default();

        assert!(!detection.is_depth_valid(40.0));
        assert!(detection.is_depth_valid(40.1));
        assert!(detection.is_depth_valid(6000.0));
        assert!(!detection.is_depth_valid(6000.1));
        assert!(!detection.is_depth_valid(f64::NAN));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "
ransac:
  inlier_proportion: 0.5
mapping:
  lifecycle:
    point:
      unmatched_count_to_lose: 10
";
        let config = SlamConfig::from_yaml_str(yaml).unwrap();

        assert_relative_eq!(config.ransac.inlier_proportion, 0.5);
        assert_relative_eq!(config.ransac.probability_of_success, 0.99);
        assert_eq!(config.mapping.lifecycle.point.unmatched_count_to_lose, 10);
        assert_eq!(config.mapping.lifecycle.point.staged_age_confidence, 10);
        assert_eq!(config.optimization.minimum_for_optimization.point, 5);
    }

    #[test]
    fn test_invalid_depth_range_is_rejected() {
        let yaml = "
detection:
  min_depth_mm: 100.0
  max_depth_mm: 50.0
";
        assert!(SlamConfig::from_yaml_str(yaml).is_err());
    }
}

//! Frame level driver.
//!
//! `RgbdSlam` owns the current pose, the local map and the pose optimizer.
//! Each frame is matched against the map from the predicted pose, the pose
//! is optimized, and the map is updated with the optimized pose. When no
//! pose can be found the predicted pose is kept and the failure counter
//! grows; after too many failures in a row tracking is lost, matching uses
//! the advanced search and the map is reseeded from the next frames.

use std::time::Instant;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::config::SlamConfig;
use crate::error::{CovarianceError, SlamError};
use crate::features::{DetectedFeatures, KeypointDetector, PlaneDetector, detect_features};
use crate::geometry::{Pose, is_covariance_valid};
use crate::map::{FeatureKind, LocalMap, MapWriter, PerKind};
use crate::optimizer::{MatchContainer, MatchSets, PoseOptimizer};
use crate::tracking::{FrameResult, KindStatistics, TimingStats, TrackingState};

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// RGB-D SLAM core.
pub struct RgbdSlam {
    config: SlamConfig,
    local_map: LocalMap,
    optimizer: PoseOptimizer,
    current_pose: Pose,
    state: TrackingState,
    is_first_call: bool,
    failed_tracking_count: u32,
    frame_index: usize,
    /// Set once the stored pose covariance was found invalid.
    corrupted: Option<CovarianceError>,
}

impl RgbdSlam {
    pub fn new(config: SlamConfig) -> Result<Self> {
        Self::with_initial_pose(config, Pose::default())
    }

    /// Start tracking from a known pose.
    pub fn with_initial_pose(config: SlamConfig, initial_pose: Pose) -> Result<Self> {
        config.validate()?;
        info!(
            "[RgbdSlam] Starting at [{:.1}, {:.1}, {:.1}] mm, camera {}x{}",
            initial_pose.position.x,
            initial_pose.position.y,
            initial_pose.position.z,
            config.camera.width,
            config.camera.height
        );
        Ok(Self {
            local_map: LocalMap::new(&config),
            optimizer: PoseOptimizer::new(&config),
            config,
            current_pose: initial_pose,
            state: TrackingState::NotInitialized,
            is_first_call: true,
            failed_tracking_count: 0,
            frame_index: 0,
            corrupted: None,
        })
    }

    pub fn config(&self) -> &SlamConfig {
        &self.config
    }

    pub fn current_pose(&self) -> &Pose {
        &self.current_pose
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn local_map(&self) -> &LocalMap {
        &self.local_map
    }

    pub fn failed_tracking_count(&self) -> u32 {
        self.failed_tracking_count
    }

    /// Number of frames processed so far.
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// Detect the features of `frame` then process them.
    ///
    /// The keypoint detector receives the screen positions of the landmarks
    /// tracked last frame, seen from the predicted pose.
    pub fn track<I, K, P>(
        &mut self,
        frame: &I,
        keypoint_detector: &mut K,
        plane_detector: &mut P,
    ) -> Result<FrameResult, SlamError>
    where
        I: Sync + ?Sized,
        K: KeypointDetector<I>,
        P: PlaneDetector<I>,
    {
        let start = Instant::now();
        self.check_current_pose()?;

        let hints = self.local_map.tracking_hints(&self.current_pose);
        let features = detect_features(frame, &hints, keypoint_detector, plane_detector)?;
        let detection_ms = elapsed_ms(start);
        Ok(self.run_frame(&features, start, detection_ms))
    }

    /// Process the features detected in one frame.
    pub fn process_frame(&mut self, features: &DetectedFeatures) -> Result<FrameResult, SlamError> {
        let start = Instant::now();
        self.check_current_pose()?;
        Ok(self.run_frame(features, start, 0.0))
    }

    /// Export the local map.
    pub fn write_map(&self, writer: &mut dyn MapWriter) -> Result<()> {
        self.local_map.write_map(writer)
    }

    /// Forget the map and restart tracking from `pose`.
    pub fn reset(&mut self, pose: Pose) {
        info!("[RgbdSlam] Reset after {} frames", self.frame_index);
        self.local_map.reset();
        self.current_pose = pose;
        self.state = TrackingState::NotInitialized;
        self.is_first_call = true;
        self.failed_tracking_count = 0;
        self.corrupted = None;
    }

    fn check_current_pose(&mut self) -> Result<(), SlamError> {
        if let Some(corruption) = &self.corrupted {
            return Err(SlamError::CorruptedPose(corruption.clone()));
        }
        if let Err(corruption) = self.current_pose.check_covariance() {
            error!(
                "[RgbdSlam] The stored pose has an invalid covariance, refusing to track: {}",
                corruption
            );
            self.corrupted = Some(corruption.clone());
            return Err(SlamError::CorruptedPose(corruption));
        }
        Ok(())
    }

    fn run_frame(&mut self, features: &DetectedFeatures, start: Instant, detection_ms: f64) -> FrameResult {
        let frame_index = self.frame_index;
        let predicted = self.current_pose;
        let use_advanced_search = self.state.is_lost();

        let matching_start = Instant::now();
        let matches = self
            .local_map
            .find_feature_matches(&predicted, features, use_advanced_search);
        let matching_ms = elapsed_ms(matching_start);

        // the first frame has nothing to optimize against
        let optimization_start = Instant::now();
        let optimized = if self.is_first_call {
            None
        } else {
            match self.optimizer.compute_optimized_pose(&predicted, &matches) {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!("[RgbdSlam] Frame {}: could not find an optimized pose: {}", frame_index, e);
                    None
                }
            }
        };
        let optimization_ms = elapsed_ms(optimization_start);

        let update_start = Instant::now();
        let (pose, sets) = match optimized {
            Some((pose, sets)) => {
                self.local_map.update(&pose, features, &sets);
                self.current_pose = pose;
                self.failed_tracking_count = 0;
                self.state = TrackingState::Ok;
                (pose, Some(sets))
            }
            None => {
                self.local_map.update_no_pose();
                if self.state.is_lost() && is_covariance_valid(&predicted.position_covariance()) {
                    self.local_map.add_features_to_map(&predicted, features, true);
                }
                if !self.is_first_call {
                    self.failed_tracking_count += 1;
                    self.state = if self.failed_tracking_count > self.config.tracking.maximum_consecutive_failures {
                        TrackingState::Lost
                    } else {
                        TrackingState::RecentlyLost
                    };
                }
                (predicted, None)
            }
        };
        let map_update_ms = elapsed_ms(update_start);

        self.is_first_call = false;
        self.frame_index += 1;

        let result = FrameResult {
            frame_index,
            state: self.state,
            pose,
            pose_optimized: sets.is_some(),
            statistics: self.frame_statistics(features, &matches, sets.as_ref()),
            timing: TimingStats {
                total_ms: elapsed_ms(start),
                detection_ms,
                matching_ms,
                optimization_ms,
                map_update_ms,
            },
        };
        info!(
            "[RgbdSlam] Frame {} {}: {} / {} inliers, position [{:.1}, {:.1}, {:.1}] mm",
            frame_index,
            result.state,
            result.total_inliers(),
            result.total_matched(),
            pose.position.x,
            pose.position.y,
            pose.position.z
        );
        debug!(
            "[RgbdSlam] Frame {} timing: match {:.2} ms, optimize {:.2} ms, update {:.2} ms",
            frame_index, matching_ms, optimization_ms, map_update_ms
        );
        result
    }

    fn frame_statistics(
        &self,
        features: &DetectedFeatures,
        matches: &MatchContainer,
        sets: Option<&MatchSets>,
    ) -> PerKind<KindStatistics> {
        let detection = &self.local_map.context().detection;
        let with_depth = features
            .keypoints
            .iter()
            .filter(|keypoint| detection.is_depth_valid(keypoint.coordinates.depth))
            .count();
        let detected = PerKind::new(with_depth, features.keypoints.len() - with_depth, features.planes.len());
        let local_sizes = self.local_map.local_sizes();
        let staged_sizes = self.local_map.staged_sizes();

        detected.map(|kind: FeatureKind, detected| KindStatistics {
            detected: *detected,
            matched: matches.count(kind),
            inliers: sets.map_or(0, |sets| sets.inliers.count(kind)),
            outliers: sets.map_or(0, |sets| sets.outliers.count(kind)),
            local_map_size: *local_sizes.get(kind),
            staged_size: *staged_sizes.get(kind),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{DetectedKeyPoint, DetectedKeypoints, DetectedPlane, Descriptor, TrackingHint};
    use crate::geometry::{PlaneWorldCoordinates, ScreenCoordinate, WorldCoordinate};
    use crate::map::YamlMapWriter;
    use nalgebra::{Matrix4, Matrix6, UnitQuaternion, Vector3, Vector4};
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use std::collections::HashMap;

    /// Static world observed by a camera moving along +X.
    struct World {
        points: Vec<(Vector3<f64>, Descriptor)>,
        /// Planes with a world point of their visible region.
        planes: Vec<(PlaneWorldCoordinates, Vector3<f64>)>,
    }

    impl World {
        fn new() -> Self {
            let mut rng = SmallRng::seed_from_u64(21);
            let points = (0..24)
                .map(|i| {
                    let column = (i % 6) as f64;
                    let row = (i / 6) as f64;
                    let position = Vector3::new(-500.0 + 200.0 * column, -300.0 + 200.0 * row, 1800.0 + 60.0 * i as f64);
                    (position, Descriptor::random(&mut rng))
                })
                .collect();
            let planes = vec![
                (
                    PlaneWorldCoordinates::new(Vector3::new(0.0, 0.0, -1.0), 4000.0).unwrap(),
                    Vector3::new(0.0, 0.0, 4000.0),
                ),
                (
                    PlaneWorldCoordinates::new(Vector3::new(0.0, -1.0, 0.0), 900.0).unwrap(),
                    Vector3::new(0.0, 900.0, 2500.0),
                ),
            ];
            Self { points, planes }
        }

        fn observe(&self, config: &SlamConfig, pose: &Pose) -> DetectedFeatures {
            let w2c = pose.world_to_camera();
            let keypoints = self
                .points
                .iter()
                .filter_map(|(position, descriptor)| {
                    let camera = WorldCoordinate(*position).to_camera(&w2c);
                    let screen = camera.to_screen(&config.camera).ok()?;
                    Some(DetectedKeyPoint::new(
                        ScreenCoordinate::new(screen.u, screen.v, camera.0.z),
                        Some(*descriptor),
                    ))
                })
                .collect();
            let planes = self
                .planes
                .iter()
                .map(|(plane, centroid)| {
                    DetectedPlane::new(
                        plane.to_camera(&w2c),
                        Matrix4::from_diagonal(&Vector4::new(1e-4, 1e-4, 1e-4, 25.0)),
                        WorldCoordinate(*centroid).to_camera(&w2c),
                    )
                })
                .collect();
            DetectedFeatures {
                keypoints: DetectedKeypoints::new(keypoints, HashMap::new()),
                planes,
            }
        }
    }

    fn pose_at(x: f64) -> Pose {
        Pose::new(Vector3::new(x, 0.0, 0.0), UnitQuaternion::identity(), Matrix6::zeros())
    }

    fn test_config() -> SlamConfig {
        let mut config = SlamConfig::default();
        config.optimization.deterministic = true;
        config.optimization.variance_iterations = 20;
        config
    }

    #[test]
    fn test_first_frame_seeds_the_local_map() {
        let config = test_config();
        let world = World::new();
        let mut slam = RgbdSlam::new(config.clone()).unwrap();

        let result = slam.process_frame(&world.observe(&config, &pose_at(0.0))).unwrap();

        assert_eq!(result.frame_index, 0);
        assert_eq!(result.state, TrackingState::NotInitialized);
        assert!(!result.pose_optimized);
        assert_eq!(result.statistics.point.detected, 24);
        assert_eq!(result.statistics.point.local_map_size, 24);
        assert_eq!(result.statistics.plane.local_map_size, 2);
        assert_eq!(slam.failed_tracking_count(), 0);
    }

    #[test]
    fn test_tracks_a_moving_camera() {
        let config = test_config();
        let world = World::new();
        let mut slam = RgbdSlam::new(config.clone()).unwrap();

        slam.process_frame(&world.observe(&config, &pose_at(0.0))).unwrap();
        for step in 1..4 {
            let true_pose = pose_at(10.0 * step as f64);
            let result = slam.process_frame(&world.observe(&config, &true_pose)).unwrap();

            assert!(result.pose_optimized, "frame {step}");
            assert_eq!(result.state, TrackingState::Ok);
            assert!(result.pose.position_error(&true_pose) < 1.0, "frame {step}");
            assert!(result.pose.angle_error(&true_pose) < 1e-3, "frame {step}");
            assert!(result.statistics.point.inliers >= 20);
            assert_eq!(result.statistics.point.outliers, 0);
        }
        assert!(is_covariance_valid(&slam.current_pose().covariance));
        assert_eq!(slam.frame_index(), 4);
    }

    #[test]
    fn test_consecutive_failures_lose_tracking() {
        let config = test_config();
        let mut slam = RgbdSlam::new(config).unwrap();
        let empty = DetectedFeatures::default();

        slam.process_frame(&empty).unwrap();
        assert_eq!(slam.failed_tracking_count(), 0);

        for failures in 1..=3 {
            let result = slam.process_frame(&empty).unwrap();
            assert_eq!(result.state, TrackingState::RecentlyLost);
            assert_eq!(slam.failed_tracking_count(), failures);
            assert_eq!(result.pose, Pose::default());
        }
        let result = slam.process_frame(&empty).unwrap();
        assert_eq!(result.state, TrackingState::Lost);
        assert!(slam.state().is_lost());
    }

    #[test]
    fn test_lost_tracking_reseeds_the_map() {
        let config = test_config();
        let world = World::new();
        let mut slam = RgbdSlam::new(config.clone()).unwrap();
        let empty = DetectedFeatures::default();

        for _ in 0..5 {
            slam.process_frame(&empty).unwrap();
        }
        assert_eq!(slam.state(), TrackingState::Lost);
        assert_eq!(slam.local_map().local_sizes(), PerKind::new(0, 0, 0));

        slam.process_frame(&world.observe(&config, &pose_at(0.0))).unwrap();
        assert_eq!(slam.local_map().local_sizes().point, 24);

        let result = slam.process_frame(&world.observe(&config, &pose_at(8.0))).unwrap();
        assert_eq!(result.state, TrackingState::Ok);
        assert_eq!(slam.failed_tracking_count(), 0);
    }

    #[test]
    fn test_corrupted_pose_is_fatal() {
        let mut covariance = Matrix6::identity();
        covariance[(0, 0)] = f64::NAN;
        let pose = Pose::new(Vector3::zeros(), UnitQuaternion::identity(), covariance);
        let mut slam = RgbdSlam::with_initial_pose(test_config(), pose).unwrap();

        let first = slam.process_frame(&DetectedFeatures::default());
        assert!(matches!(first, Err(SlamError::CorruptedPose(CovarianceError::NonFinite))));
        let second = slam.process_frame(&DetectedFeatures::default());
        assert!(matches!(second, Err(SlamError::CorruptedPose(_))));
        assert_eq!(slam.frame_index(), 0);
    }

    struct WorldKeypoints<'a> {
        world: &'a World,
        config: &'a SlamConfig,
        received_hints: Vec<usize>,
        /// Keypoints reported per frame.
        limit: usize,
    }

    impl KeypointDetector<Pose> for WorldKeypoints<'_> {
        fn detect_keypoints(&mut self, frame: &Pose, hints: &[TrackingHint]) -> Result<DetectedKeypoints, SlamError> {
            self.received_hints.push(hints.len());
            let keypoints = self.world.observe(self.config, frame).keypoints;
            Ok(DetectedKeypoints::new(
                keypoints.iter().take(self.limit).copied().collect(),
                HashMap::new(),
            ))
        }
    }

    struct WorldPlanes<'a> {
        world: &'a World,
        config: &'a SlamConfig,
        limit: usize,
    }

    impl PlaneDetector<Pose> for WorldPlanes<'_> {
        fn detect_planes(&mut self, frame: &Pose) -> Result<Vec<DetectedPlane>, SlamError> {
            let mut planes = self.world.observe(self.config, frame).planes;
            planes.truncate(self.limit);
            Ok(planes)
        }
    }

    #[test]
    fn test_track_runs_the_detectors() {
        let config = test_config();
        let world = World::new();
        let mut slam = RgbdSlam::new(config.clone()).unwrap();
        let mut keypoints = WorldKeypoints {
            world: &world,
            config: &config,
            received_hints: Vec::new(),
            limit: usize::MAX,
        };
        let mut planes = WorldPlanes {
            world: &world,
            config: &config,
            limit: usize::MAX,
        };

        slam.track(&pose_at(0.0), &mut keypoints, &mut planes).unwrap();
        let result = slam.track(&pose_at(5.0), &mut keypoints, &mut planes).unwrap();

        assert_eq!(result.state, TrackingState::Ok);
        // the second frame is told where the seeded points should be
        assert_eq!(keypoints.received_hints, vec![0, 24]);
        assert!(result.timing.detection_ms >= 0.0);
    }

    #[test]
    fn test_too_few_matches_keep_the_current_pose() {
        let config = test_config();
        let world = World::new();
        let mut slam = RgbdSlam::new(config.clone()).unwrap();
        let mut keypoints = WorldKeypoints {
            world: &world,
            config: &config,
            received_hints: Vec::new(),
            limit: usize::MAX,
        };
        let mut planes = WorldPlanes {
            world: &world,
            config: &config,
            limit: usize::MAX,
        };
        slam.track(&pose_at(0.0), &mut keypoints, &mut planes).unwrap();
        let before = *slam.current_pose();

        // two points and no plane: below the point minimum of 5
        keypoints.limit = 2;
        planes.limit = 0;
        let result = slam.track(&pose_at(5.0), &mut keypoints, &mut planes).unwrap();

        assert!(!result.pose_optimized);
        assert_eq!(result.statistics.point.matched, 2);
        assert_eq!(result.statistics.plane.matched, 0);
        assert_eq!(result.pose, before);
        assert_eq!(*slam.current_pose(), before);
        assert_eq!(result.state, TrackingState::RecentlyLost);
        assert_eq!(slam.failed_tracking_count(), 1);
    }

    #[test]
    fn test_write_map_after_tracking() {
        let config = test_config();
        let world = World::new();
        let mut slam = RgbdSlam::new(config.clone()).unwrap();
        slam.process_frame(&world.observe(&config, &pose_at(0.0))).unwrap();

        let mut writer = YamlMapWriter::new(Vec::new());
        slam.write_map(&mut writer).unwrap();
        let yaml = String::from_utf8(writer.into_inner()).unwrap();
        assert!(yaml.contains("kind: Point"));
        assert!(yaml.contains("type: plane"));

        slam.reset(Pose::default());
        assert_eq!(slam.state(), TrackingState::NotInitialized);
        assert_eq!(slam.local_map().local_sizes(), PerKind::new(0, 0, 0));
    }
}

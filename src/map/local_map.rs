//! The local map: every landmark kind, matched and updated together.
//!
//! Keypoints are shared by 3D and 2D points, so both kinds match against a
//! single keypoint mask. Local landmarks are searched before staged ones,
//! and only local matches are handed to the pose optimizer.

use anyhow::Result;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use tracing::{debug, info};

use crate::config::SlamConfig;
use crate::features::{DetectedFeatures, TrackingHint};
use crate::geometry::Pose;
use crate::map::feature::{MapFeature, MatchSearch};
use crate::map::feature_map::{FeatureMap, MapUpdateStats};
use crate::map::map_plane::MapPlane;
use crate::map::map_point::MapPoint;
use crate::map::map_point2d::MapPoint2D;
use crate::map::types::PerKind;
use crate::map::writer::{Landmark, MapWriter};
use crate::optimizer::matches::{MatchContainer, MatchSets};
use crate::tracking::TrackingContext;

pub struct LocalMap {
    context: TrackingContext,
    points: FeatureMap<MapPoint>,
    points_2d: FeatureMap<MapPoint2D>,
    planes: FeatureMap<MapPlane>,
    rng: SmallRng,
}

impl LocalMap {
    pub fn new(config: &SlamConfig) -> Self {
        let lifecycle = &config.mapping.lifecycle;
        Self {
            context: TrackingContext::new(config),
            points: FeatureMap::new(lifecycle.point),
            points_2d: FeatureMap::new(lifecycle.point_2d),
            planes: FeatureMap::new(lifecycle.plane),
            rng: SmallRng::seed_from_u64(config.optimization.random_seed),
        }
    }

    pub fn context(&self) -> &TrackingContext {
        &self.context
    }

    pub fn points(&self) -> &FeatureMap<MapPoint> {
        &self.points
    }

    pub fn points_2d(&self) -> &FeatureMap<MapPoint2D> {
        &self.points_2d
    }

    pub fn planes(&self) -> &FeatureMap<MapPlane> {
        &self.planes
    }

    pub fn local_sizes(&self) -> PerKind<usize> {
        PerKind::new(self.points.local_len(), self.points_2d.local_len(), self.planes.local_len())
    }

    pub fn staged_sizes(&self) -> PerKind<usize> {
        PerKind::new(self.points.staged_len(), self.points_2d.staged_len(), self.planes.staged_len())
    }

    /// Every landmark of the local map, staged ones excluded.
    pub fn landmarks(&self) -> impl Iterator<Item = Landmark<'_>> {
        self.points
            .local()
            .map(Landmark::Point)
            .chain(self.points_2d.local().map(Landmark::Point2D))
            .chain(self.planes.local().map(Landmark::Plane))
    }

    pub fn reset(&mut self) {
        self.points.clear();
        self.points_2d.clear();
        self.planes.clear();
    }

    /// Match the detections of a frame against the map, seen from `pose`.
    pub fn find_feature_matches(
        &mut self,
        pose: &Pose,
        features: &DetectedFeatures,
        use_advanced_search: bool,
    ) -> MatchContainer {
        self.points.reset_matches();
        self.points_2d.reset_matches();
        self.planes.reset_matches();

        let search = MatchSearch::new(pose, &self.context.camera, &self.context.matching, use_advanced_search);
        let keypoints = &features.keypoints;
        let mut is_keypoint_matched = vec![false; keypoints.len()];
        let mut is_plane_matched = vec![false; features.planes.len()];

        let matches = MatchContainer {
            points: self.points.match_local(keypoints, &search, &mut is_keypoint_matched),
            points_2d: self.points_2d.match_local(keypoints, &search, &mut is_keypoint_matched),
            planes: self.planes.match_local(&features.planes, &search, &mut is_plane_matched),
        };

        let staged_points = self.points.match_staged(keypoints, &search, &mut is_keypoint_matched);
        let staged_points_2d = self.points_2d.match_staged(keypoints, &search, &mut is_keypoint_matched);
        let staged_planes = self.planes.match_staged(&features.planes, &search, &mut is_plane_matched);

        debug!(
            "[LocalMap] Matched {} points, {} 2D points, {} planes (staged {} / {} / {})",
            matches.points.len(),
            matches.points_2d.len(),
            matches.planes.len(),
            staged_points,
            staged_points_2d,
            staged_planes
        );
        matches
    }

    /// Update every landmark with the optimized pose. Outliers count as
    /// unmatched, resolved 2D points move to the 3D map and the detections
    /// left over seed new staged landmarks.
    pub fn update(&mut self, pose: &Pose, features: &DetectedFeatures, matches: &MatchSets) -> PerKind<MapUpdateStats> {
        let keypoints = &features.keypoints;
        // detections claimed this frame, outliers included, never seed new landmarks
        let mut is_keypoint_matched = vec![false; keypoints.len()];
        self.points.mark_matched(&mut is_keypoint_matched);
        self.points_2d.mark_matched(&mut is_keypoint_matched);
        let mut is_plane_matched = vec![false; features.planes.len()];
        self.planes.mark_matched(&mut is_plane_matched);

        let outliers = matches.outlier_ids();
        let mut stats = PerKind::new(
            self.points.update(keypoints, pose, &outliers, &self.context, &mut self.rng),
            self.points_2d.update(keypoints, pose, &outliers, &self.context, &mut self.rng),
            self.planes.update(&features.planes, pose, &outliers, &self.context, &mut self.rng),
        );

        let c2w = pose.camera_to_world();
        let threshold = self.context.mapping.upgrade_linearity_threshold;
        let upgraded = self.points_2d.drain_upgrades(|point| point.compute_upgraded(&c2w, threshold));
        if !upgraded.is_empty() {
            debug!("[LocalMap] Upgraded {} 2D points", upgraded.len());
        }
        for (bucket, entry) in upgraded {
            self.points.insert(bucket, entry);
        }

        stats.point.added = self.points.add_features(
            keypoints,
            pose,
            &mut is_keypoint_matched,
            false,
            &self.context,
            &mut self.rng,
        );
        stats.point_2d.added = self.points_2d.add_features(
            keypoints,
            pose,
            &mut is_keypoint_matched,
            false,
            &self.context,
            &mut self.rng,
        );
        stats.plane.added = self.planes.add_features(
            &features.planes,
            pose,
            &mut is_plane_matched,
            false,
            &self.context,
            &mut self.rng,
        );

        for (kind, kind_stats) in stats.iter() {
            if kind_stats.lost > 0 || kind_stats.promoted > 0 {
                debug!(
                    "[LocalMap] {}: {} lost, {} promoted, {} discarded, {} added",
                    kind, kind_stats.lost, kind_stats.promoted, kind_stats.discarded, kind_stats.added
                );
            }
        }
        stats
    }

    /// No pose this frame: drop the matches and let staged landmarks decay.
    pub fn update_no_pose(&mut self) -> PerKind<MapUpdateStats> {
        PerKind::new(
            self.points.update_no_pose(),
            self.points_2d.update_no_pose(),
            self.planes.update_no_pose(),
        )
    }

    /// Seed landmarks from every free detection, straight into the local map
    /// when `add_to_local` is set.
    pub fn add_features_to_map(&mut self, pose: &Pose, features: &DetectedFeatures, add_to_local: bool) -> PerKind<usize> {
        let keypoints = &features.keypoints;
        let mut is_keypoint_matched = vec![false; keypoints.len()];
        self.points.mark_matched(&mut is_keypoint_matched);
        self.points_2d.mark_matched(&mut is_keypoint_matched);
        let mut is_plane_matched = vec![false; features.planes.len()];
        self.planes.mark_matched(&mut is_plane_matched);

        let added = PerKind::new(
            self.points.add_features(
                keypoints,
                pose,
                &mut is_keypoint_matched,
                add_to_local,
                &self.context,
                &mut self.rng,
            ),
            self.points_2d.add_features(
                keypoints,
                pose,
                &mut is_keypoint_matched,
                add_to_local,
                &self.context,
                &mut self.rng,
            ),
            self.planes.add_features(
                &features.planes,
                pose,
                &mut is_plane_matched,
                add_to_local,
                &self.context,
                &mut self.rng,
            ),
        );
        info!(
            "[LocalMap] Seeded {} points, {} 2D points, {} planes (local: {})",
            added.point, added.point_2d, added.plane, add_to_local
        );
        added
    }

    /// Screen positions of the point landmarks tracked last frame, seen from
    /// `pose`, for detectors following keypoints between frames.
    pub fn tracking_hints(&self, pose: &Pose) -> Vec<TrackingHint> {
        let w2c = pose.world_to_camera();
        let camera = &self.context.camera;
        let points = self
            .points
            .local()
            .filter(|entry| entry.counters.failed_tracking_count == 0)
            .filter_map(|entry| Some((entry.feature.id(), entry.feature.screen_footprint(&w2c, camera)?)));
        let points_2d = self
            .points_2d
            .local()
            .filter(|entry| entry.counters.failed_tracking_count == 0)
            .filter_map(|entry| Some((entry.feature.id(), entry.feature.screen_footprint(&w2c, camera)?)));
        points
            .chain(points_2d)
            .map(|(id, footprint)| TrackingHint {
                id,
                position: footprint.center(),
            })
            .collect()
    }

    /// Export every local landmark.
    pub fn write_map(&self, writer: &mut dyn MapWriter) -> Result<()> {
        for landmark in self.landmarks() {
            writer.write_landmark(&landmark.to_record())?;
        }
        writer.flush()
    }
}

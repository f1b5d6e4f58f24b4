//! Per-frame associations between detections and local map landmarks.

use std::collections::HashSet;

use nalgebra::{Matrix3, Matrix4, Vector6};

use crate::geometry::{InverseDepthWorldPoint, PlaneCameraCoordinates, PlaneWorldCoordinates, ScreenCoordinate2D, WorldCoordinate};
use crate::map::{FeatureId, FeatureKind, PerKind};

/// Resolved 3D landmark matched with a keypoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointMatch {
    pub id: FeatureId,
    pub detection_index: usize,
    pub observation: ScreenCoordinate2D,
    pub world_point: WorldCoordinate,
    pub world_covariance: Matrix3<f64>,
    pub descriptor_distance: Option<u32>,
}

/// Inverse-depth landmark matched with a keypoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point2dMatch {
    pub id: FeatureId,
    pub detection_index: usize,
    pub observation: ScreenCoordinate2D,
    pub point: InverseDepthWorldPoint,
    /// Square roots of the landmark covariance diagonal.
    pub standard_deviations: Vector6<f64>,
    pub descriptor_distance: Option<u32>,
}

/// Plane landmark matched with a detected plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneMatch {
    pub id: FeatureId,
    pub detection_index: usize,
    pub observation: PlaneCameraCoordinates,
    pub world_plane: PlaneWorldCoordinates,
    pub world_covariance: Matrix4<f64>,
}

/// All matches of a frame, grouped by landmark kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchContainer {
    pub points: Vec<PointMatch>,
    pub points_2d: Vec<Point2dMatch>,
    pub planes: Vec<PlaneMatch>,
}

impl MatchContainer {
    pub fn len(&self) -> usize {
        self.points.len() + self.points_2d.len() + self.planes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counts(&self) -> PerKind<usize> {
        PerKind::new(self.points.len(), self.points_2d.len(), self.planes.len())
    }

    pub fn count(&self, kind: FeatureKind) -> usize {
        *self.counts().get(kind)
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.points_2d.clear();
        self.planes.clear();
    }

    pub fn ids(&self) -> HashSet<FeatureId> {
        self.points
            .iter()
            .map(|m| m.id)
            .chain(self.points_2d.iter().map(|m| m.id))
            .chain(self.planes.iter().map(|m| m.id))
            .collect()
    }
}

/// Inlier/outlier partition of a [`MatchContainer`] for one pose.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchSets {
    pub inliers: MatchContainer,
    pub outliers: MatchContainer,
}

impl MatchSets {
    /// Ids the map update must treat as unmatched.
    pub fn outlier_ids(&self) -> HashSet<FeatureId> {
        self.outliers.ids()
    }
}

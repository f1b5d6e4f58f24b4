//! Kalman tracking of a point with a resolved world position.

use nalgebra::Matrix3;

use crate::error::TrackingError;
use crate::geometry::{WorldCoordinate, check_covariance};
use crate::tracking::kalman::PointKalmanFilter;

/// Outcome of a successful tracking update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingUpdate {
    /// Distance between the previous and the merged estimate (mm).
    pub displacement: f64,
    /// The estimate moved by more than one merged standard deviation on at
    /// least one axis.
    pub is_moving: bool,
}

impl TrackingUpdate {
    pub(crate) fn between(
        previous: &WorldCoordinate,
        merged: &WorldCoordinate,
        merged_covariance: &Matrix3<f64>,
    ) -> Self {
        let delta = merged.0 - previous.0;
        let is_moving = (0..3).any(|i| delta[i].abs() > merged_covariance[(i, i)].max(0.0).sqrt());
        Self {
            displacement: delta.norm(),
            is_moving,
        }
    }
}

/// World point estimate with its covariance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackedPoint {
    coordinates: WorldCoordinate,
    covariance: Matrix3<f64>,
}

impl TrackedPoint {
    pub fn new(coordinates: WorldCoordinate, covariance: Matrix3<f64>) -> Result<Self, TrackingError> {
        check_covariance(&covariance)?;
        Ok(Self {
            coordinates,
            covariance,
        })
    }

    pub fn coordinates(&self) -> &WorldCoordinate {
        &self.coordinates
    }

    pub fn covariance(&self) -> &Matrix3<f64> {
        &self.covariance
    }

    /// Merge a world observation. On error the estimate is unchanged.
    pub fn track(
        &mut self,
        observation: &WorldCoordinate,
        observation_covariance: &Matrix3<f64>,
        filter: &PointKalmanFilter,
    ) -> Result<TrackingUpdate, TrackingError> {
        let (state, covariance) = filter.get_new_state(
            &self.coordinates.0,
            &self.covariance,
            &observation.0,
            observation_covariance,
        )?;
        let merged = WorldCoordinate(state);
        let update = TrackingUpdate::between(&self.coordinates, &merged, &covariance);

        self.coordinates = merged;
        self.covariance = covariance;
        Ok(update)
    }
}

//! Linear Kalman filter used to fuse landmark observations.
//!
//! Landmarks are static, so the filter has identity dynamics and a small
//! process noise. Its matrices never change after construction: one
//! instance is built at system start and shared by reference with every
//! landmark update.
//!
//! One update step:
//!
//! ```text
//! x⁻ = F x              P⁻ = F P Fᵀ + Q
//! S  = H P⁻ Hᵀ + R      K  = P⁻ Hᵀ S⁻¹
//! x⁺ = x⁻ + K (z - H x⁻)
//! P⁺ = (I - K H) P⁻ (I - K H)ᵀ + K R Kᵀ     (Joseph form)
//! ```

use nalgebra::{SMatrix, SVector};

use crate::error::TrackingError;
use crate::geometry::check_covariance;

/// Filter with `S` state dimensions and `M` measurement dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct KalmanFilter<const S: usize, const M: usize> {
    state_transition: SMatrix<f64, S, S>,
    observation_model: SMatrix<f64, M, S>,
    process_noise: SMatrix<f64, S, S>,
}

/// Filter tracking a static 3D point observed directly.
pub type PointKalmanFilter = KalmanFilter<3, 3>;

/// Filter tracking a static plane `(n, d)`.
pub type PlaneKalmanFilter = KalmanFilter<4, 4>;

impl<const S: usize, const M: usize> KalmanFilter<S, M> {
    pub fn new(
        state_transition: SMatrix<f64, S, S>,
        observation_model: SMatrix<f64, M, S>,
        process_noise: SMatrix<f64, S, S>,
    ) -> Self {
        Self {
            state_transition,
            observation_model,
            process_noise,
        }
    }

    pub fn process_noise(&self) -> &SMatrix<f64, S, S> {
        &self.process_noise
    }

    /// Fuse one measurement into `(state, covariance)`.
    ///
    /// Returns the new state and covariance; the inputs are left untouched so
    /// a failed update never corrupts the caller's estimate.
    pub fn get_new_state(
        &self,
        state: &SVector<f64, S>,
        covariance: &SMatrix<f64, S, S>,
        measurement: &SVector<f64, M>,
        measurement_noise: &SMatrix<f64, M, M>,
    ) -> Result<(SVector<f64, S>, SMatrix<f64, S, S>), TrackingError> {
        check_covariance(covariance)?;
        check_covariance(measurement_noise)?;

        let f = &self.state_transition;
        let h = &self.observation_model;

        let predicted_state = f * state;
        let predicted_covariance = f * covariance * f.transpose() + self.process_noise;

        let innovation = measurement - h * predicted_state;
        let innovation_covariance = h * predicted_covariance * h.transpose() + measurement_noise;
        let innovation_inverse = innovation_covariance
            .try_inverse()
            .ok_or(TrackingError::SingularInnovation)?;
        let gain = predicted_covariance * h.transpose() * innovation_inverse;

        let new_state = predicted_state + gain * innovation;

        let correction = SMatrix::<f64, S, S>::identity() - gain * h;
        let new_covariance = correction * predicted_covariance * correction.transpose()
            + gain * measurement_noise * gain.transpose();
        let new_covariance = (new_covariance + new_covariance.transpose()) * 0.5;

        check_covariance(&new_covariance)?;
        Ok((new_state, new_covariance))
    }
}

impl<const S: usize> KalmanFilter<S, S> {
    /// Identity dynamics, identity observation and `q I` process noise.
    pub fn static_state(process_noise: f64) -> Self {
        Self::new(
            SMatrix::identity(),
            SMatrix::identity(),
            SMatrix::identity() * process_noise,
        )
    }
}

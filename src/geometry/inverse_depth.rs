//! Inverse-depth parametrization of a world point.
//!
//! A point first seen without reliable depth is stored as the camera center
//! of its first observation `c`, two bearing angles and the inverse of its
//! distance along the bearing:
//!
//! ```text
//! m(θ, φ) = (sin θ sin φ, cos θ, sin θ cos φ)
//! X       = c + m(θ, φ) / ρ
//! ```
//!
//! `θ ∈ [0, π]` is measured from the world +Y axis and `φ ∈ (-π, π]` is the
//! azimuth `atan2(x, z)`. With the usual camera convention (y down, z
//! forward) the singular directions are straight up and straight down,
//! which a handheld or wheeled sensor almost never looks at.

use std::f64::consts::PI;

use nalgebra::{Matrix3x6, Matrix6x3, Vector3};

use crate::error::GeometryError;
use crate::geometry::{CameraModel, CameraToWorld, ScreenCoordinate2D, WorldCoordinate};

/// Row/column of the first observation center in the 6x6 covariance.
pub const FIRST_POSE_INDEX: usize = 0;
pub const THETA_INDEX: usize = 3;
pub const PHI_INDEX: usize = 4;
pub const INVERSE_DEPTH_INDEX: usize = 5;

/// Bearings closer than this (relative) to the singular axis are rejected.
const MIN_RELATIVE_AZIMUTH_RADIUS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InverseDepthWorldPoint {
    first_observation: Vector3<f64>,
    theta: f64,
    phi: f64,
    inverse_depth: f64,
}

impl InverseDepthWorldPoint {
    pub fn new(first_observation: Vector3<f64>, theta: f64, phi: f64, inverse_depth: f64) -> Result<Self, GeometryError> {
        if !(inverse_depth > 0.0 && inverse_depth.is_finite()) {
            return Err(GeometryError::NonPositiveInverseDepth(inverse_depth));
        }
        if !theta.is_finite() || !phi.is_finite() || !first_observation.iter().all(|v| v.is_finite()) {
            return Err(GeometryError::DegenerateBearing);
        }
        Ok(Self {
            first_observation,
            theta: theta.clamp(0.0, PI),
            phi: wrap_angle(phi),
            inverse_depth,
        })
    }

    /// Point on the viewing ray of a pixel, at the given inverse depth.
    pub fn from_screen(
        observation: &ScreenCoordinate2D,
        c2w: &CameraToWorld,
        camera: &CameraModel,
        inverse_depth: f64,
    ) -> Result<Self, GeometryError> {
        let ray = observation.to_world_ray(camera, c2w);
        let (theta, phi) = bearing_angles(&ray)?;
        Self::new(c2w.camera_position(), theta, phi, inverse_depth)
    }

    /// Inverse-depth form of a cartesian point seen from `first_observation`,
    /// with the Jacobian `∂(c, θ, φ, ρ)/∂X`.
    ///
    /// The first three rows of the Jacobian are zero: the first observation
    /// center does not depend on the point.
    pub fn from_cartesian(
        point: &WorldCoordinate,
        first_observation: &Vector3<f64>,
    ) -> Result<(Self, Matrix6x3<f64>), GeometryError> {
        let v = point.0 - first_observation;
        let r_squared = v.norm_squared();
        let r = r_squared.sqrt();
        let azimuth_radius_squared = v.x * v.x + v.z * v.z;
        let azimuth_radius = azimuth_radius_squared.sqrt();
        if !r.is_finite() || r == 0.0 || azimuth_radius <= MIN_RELATIVE_AZIMUTH_RADIUS * r {
            return Err(GeometryError::DegenerateBearing);
        }

        let coordinates = Self::new(
            *first_observation,
            azimuth_radius.atan2(v.y),
            v.x.atan2(v.z),
            1.0 / r,
        )?;

        let mut jacobian = Matrix6x3::zeros();
        let theta_denominator = r_squared * azimuth_radius;
        jacobian[(THETA_INDEX, 0)] = v.y * v.x / theta_denominator;
        jacobian[(THETA_INDEX, 1)] = -azimuth_radius / r_squared;
        jacobian[(THETA_INDEX, 2)] = v.y * v.z / theta_denominator;

        jacobian[(PHI_INDEX, 0)] = v.z / azimuth_radius_squared;
        jacobian[(PHI_INDEX, 2)] = -v.x / azimuth_radius_squared;

        let r_cubed = r_squared * r;
        jacobian[(INVERSE_DEPTH_INDEX, 0)] = -v.x / r_cubed;
        jacobian[(INVERSE_DEPTH_INDEX, 1)] = -v.y / r_cubed;
        jacobian[(INVERSE_DEPTH_INDEX, 2)] = -v.z / r_cubed;

        Ok((coordinates, jacobian))
    }

    pub fn first_observation(&self) -> &Vector3<f64> {
        &self.first_observation
    }

    pub fn theta(&self) -> f64 {
        self.theta
    }

    pub fn phi(&self) -> f64 {
        self.phi
    }

    pub fn inverse_depth(&self) -> f64 {
        self.inverse_depth
    }

    /// Unit bearing vector m(θ, φ).
    pub fn bearing_vector(&self) -> Vector3<f64> {
        bearing_vector(self.theta, self.phi)
    }

    pub fn to_cartesian(&self) -> WorldCoordinate {
        WorldCoordinate(self.first_observation + self.bearing_vector() / self.inverse_depth)
    }

    /// Cartesian point at another inverse depth along the same bearing.
    pub fn to_cartesian_at(&self, inverse_depth: f64) -> Result<WorldCoordinate, GeometryError> {
        if !(inverse_depth > 0.0) {
            return Err(GeometryError::NonPositiveInverseDepth(inverse_depth));
        }
        Ok(WorldCoordinate(self.first_observation + self.bearing_vector() / inverse_depth))
    }

    /// Cartesian point with the Jacobian `∂X/∂(c, θ, φ, ρ)`.
    pub fn to_cartesian_with_jacobian(&self) -> (WorldCoordinate, Matrix3x6<f64>) {
        let (sin_theta, cos_theta) = self.theta.sin_cos();
        let (sin_phi, cos_phi) = self.phi.sin_cos();
        let depth = 1.0 / self.inverse_depth;
        let m = self.bearing_vector();

        let mut jacobian = Matrix3x6::zeros();
        jacobian.fixed_view_mut::<3, 3>(0, FIRST_POSE_INDEX).fill_with_identity();
        jacobian.set_column(
            THETA_INDEX,
            &(Vector3::new(cos_theta * sin_phi, -sin_theta, cos_theta * cos_phi) * depth),
        );
        jacobian.set_column(
            PHI_INDEX,
            &(Vector3::new(sin_theta * cos_phi, 0.0, -sin_theta * sin_phi) * depth),
        );
        jacobian.set_column(INVERSE_DEPTH_INDEX, &(-m * depth * depth));

        (self.to_cartesian(), jacobian)
    }
}

pub fn bearing_vector(theta: f64, phi: f64) -> Vector3<f64> {
    let (sin_theta, cos_theta) = theta.sin_cos();
    let (sin_phi, cos_phi) = phi.sin_cos();
    Vector3::new(sin_theta * sin_phi, cos_theta, sin_theta * cos_phi)
}

/// Bearing angles `(θ, φ)` of a direction.
pub fn bearing_angles(direction: &Vector3<f64>) -> Result<(f64, f64), GeometryError> {
    let azimuth_radius = (direction.x * direction.x + direction.z * direction.z).sqrt();
    let norm = direction.norm();
    if !norm.is_finite() || norm == 0.0 {
        return Err(GeometryError::DegenerateBearing);
    }
    Ok((azimuth_radius.atan2(direction.y), wrap_angle(direction.x.atan2(direction.z))))
}

/// Wrap an angle to `(-π, π]`.
fn wrap_angle(angle: f64) -> f64 {
    if angle > -PI && angle <= PI {
        return angle;
    }
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped <= -PI { wrapped + 2.0 * PI } else { wrapped }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    #[test]
    fn test_round_trip_cartesian() {
        let centers = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(-350.0, 120.0, 800.0),
        ];
        let points = [
            Vector3::new(100.0, -50.0, 2000.0),
            Vector3::new(-3000.0, 400.0, -150.0),
            Vector3::new(15.0, 1200.0, -2500.0),
            Vector3::new(-0.5, -700.0, 3.0),
        ];
        for center in &centers {
            for point in &points {
                let world = WorldCoordinate(*point);
                let (inverse_depth, _) = InverseDepthWorldPoint::from_cartesian(&world, center).unwrap();

                assert!(inverse_depth.inverse_depth() > 0.0);
                assert!((0.0..=PI).contains(&inverse_depth.theta()));
                assert!(inverse_depth.phi() > -PI && inverse_depth.phi() <= PI);

                let back = inverse_depth.to_cartesian().0;
                assert!((back - point).norm() <= 1e-9 * point.norm().max(1.0));
            }
        }
    }

    #[test]
    fn test_from_cartesian_jacobian_matches_finite_differences() {
        let center = Vector3::new(10.0, -20.0, 30.0);
        let point = Vector3::new(400.0, 250.0, 1800.0);
        let (_, jacobian) = InverseDepthWorldPoint::from_cartesian(&WorldCoordinate(point), &center).unwrap();

        let h = 1e-4;
        for axis in 0..3 {
            let mut delta = Vector3::zeros();
            delta[axis] = h;
            let (plus, _) = InverseDepthWorldPoint::from_cartesian(&WorldCoordinate(point + delta), &center).unwrap();
            let (minus, _) = InverseDepthWorldPoint::from_cartesian(&WorldCoordinate(point - delta), &center).unwrap();

            assert_relative_eq!(jacobian[(THETA_INDEX, axis)], (plus.theta - minus.theta) / (2.0 * h), epsilon = 1e-9);
            assert_relative_eq!(jacobian[(PHI_INDEX, axis)], (plus.phi - minus.phi) / (2.0 * h), epsilon = 1e-9);
            assert_relative_eq!(
                jacobian[(INVERSE_DEPTH_INDEX, axis)],
                (plus.inverse_depth - minus.inverse_depth) / (2.0 * h),
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn test_to_cartesian_jacobian_matches_finite_differences() {
        let point = InverseDepthWorldPoint::new(Vector3::new(5.0, 6.0, 7.0), 1.2, -0.7, 1.0 / 1500.0).unwrap();
        let (_, jacobian) = point.to_cartesian_with_jacobian();

        let steps = [1e-3, 1e-3, 1e-3, 1e-7, 1e-7, 1e-10];
        for (column, h) in steps.iter().enumerate() {
            let shifted = |sign: f64| {
                let mut c = point.first_observation;
                let (mut theta, mut phi, mut rho) = (point.theta, point.phi, point.inverse_depth);
                match column {
                    0..=2 => c[column] += sign * h,
                    THETA_INDEX => theta += sign * h,
                    PHI_INDEX => phi += sign * h,
                    _ => rho += sign * h,
                }
                InverseDepthWorldPoint::new(c, theta, phi, rho).unwrap().to_cartesian().0
            };
            let numeric = (shifted(1.0) - shifted(-1.0)) / (2.0 * h);
            let analytic = jacobian.column(column).into_owned();
            assert!((numeric - analytic).norm() <= 1e-4 * analytic.norm().max(1.0));
        }
    }

    #[test]
    fn test_from_screen_follows_viewing_ray() {
        let camera = CameraModel::default();
        let c2w = CameraToWorld(SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.3, 0.0),
            Vector3::new(100.0, 0.0, -50.0),
        ));
        let observation = ScreenCoordinate2D::new(200.0, 150.0);

        let point = InverseDepthWorldPoint::from_screen(&observation, &c2w, &camera, 1.0 / 2000.0).unwrap();
        let projected = point.to_cartesian().to_screen(&c2w.inverse(), &camera).unwrap();
        assert_relative_eq!(projected.u, observation.u, epsilon = 1e-6);
        assert_relative_eq!(projected.v, observation.v, epsilon = 1e-6);
        assert_relative_eq!(point.to_cartesian().distance(&WorldCoordinate(c2w.camera_position())), 2000.0, epsilon = 1e-6);
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(InverseDepthWorldPoint::new(Vector3::zeros(), 0.5, 0.5, 0.0).is_err());
        assert!(InverseDepthWorldPoint::new(Vector3::zeros(), 0.5, 0.5, -1.0).is_err());
        assert!(InverseDepthWorldPoint::from_cartesian(&WorldCoordinate(Vector3::zeros()), &Vector3::zeros()).is_err());
        // straight up: on the singular axis
        assert!(
            InverseDepthWorldPoint::from_cartesian(&WorldCoordinate(Vector3::new(0.0, 100.0, 0.0)), &Vector3::zeros())
                .is_err()
        );
    }

    #[test]
    fn test_wrap_angle() {
        assert_relative_eq!(wrap_angle(-PI), PI, epsilon = 1e-12);
        assert_relative_eq!(wrap_angle(3.0 * PI / 2.0), -PI / 2.0, epsilon = 1e-12);
        assert_relative_eq!(wrap_angle(0.25), 0.25, epsilon = 1e-12);
    }
}

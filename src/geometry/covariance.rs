//! Gaussian uncertainty propagation between the screen, camera and world frames.
//!
//! Every function returns a validated covariance: finite, symmetric and
//! positive semi-definite within [`COVARIANCE_TOLERANCE`]. An invalid input or
//! output is an error, never silently used.
//!
//! Propagation through a transform `y = f(x)` with Jacobian `J = ∂f/∂x`:
//!
//! ```text
//! Σ_y = J Σ_x Jᵀ
//! ```

use nalgebra::{DMatrix, Matrix2, Matrix2x3, Matrix3, Matrix4, SMatrix, Vector3};

use crate::config::DetectionConfig;
use crate::error::{CovarianceError, GeometryError};
use crate::geometry::{
    CameraCoordinate, CameraModel, CameraToWorld, PlaneCameraCoordinates, ScreenCoordinate,
    WorldToCamera,
};

/// Relative tolerance of the symmetry and eigenvalue checks.
pub const COVARIANCE_TOLERANCE: f64 = 1e-9;

/// Check that a covariance can be used for propagation.
pub fn check_covariance<const N: usize>(covariance: &SMatrix<f64, N, N>) -> Result<(), CovarianceError> {
    if covariance.iter().any(|v| !v.is_finite()) {
        return Err(CovarianceError::NonFinite);
    }

    let tolerance = COVARIANCE_TOLERANCE * covariance.amax().max(1.0);

    let asymmetry = (covariance - covariance.transpose()).amax();
    if asymmetry > tolerance {
        return Err(CovarianceError::NotSymmetric(asymmetry));
    }

    for i in 0..N {
        let variance = covariance[(i, i)];
        if variance < -tolerance {
            return Err(CovarianceError::NegativeVariance(variance));
        }
    }

    let dynamic = DMatrix::from_iterator(N, N, covariance.iter().copied());
    let symmetric = (&dynamic + dynamic.transpose()) * 0.5;
    let min_eigenvalue = symmetric.symmetric_eigenvalues().min();
    if min_eigenvalue < -tolerance {
        return Err(CovarianceError::NotPositiveSemiDefinite(min_eigenvalue));
    }
    Ok(())
}

pub fn is_covariance_valid<const N: usize>(covariance: &SMatrix<f64, N, N>) -> bool {
    check_covariance(covariance).is_ok()
}

/// Compute `J Σ Jᵀ`, validating both the input and the output.
pub fn propagate_covariance<const N: usize, const M: usize>(
    covariance: &SMatrix<f64, N, N>,
    jacobian: &SMatrix<f64, M, N>,
) -> Result<SMatrix<f64, M, M>, CovarianceError> {
    check_covariance(covariance)?;

    let propagated = jacobian * covariance * jacobian.transpose();
    // remove the rounding asymmetry of the triple product
    let propagated = (propagated + propagated.transpose()) * 0.5;

    check_covariance(&propagated)?;
    Ok(propagated)
}

/// Covariance of an RGB-D observation `(u, v, depth)`.
///
/// Pixel noise is isotropic; the depth noise grows quadratically with the
/// distance (structured light quantization).
pub fn screen_point_covariance(depth: f64, detection: &DetectionConfig) -> Matrix3<f64> {
    let pixel_variance = detection.keypoint_sigma_px.powi(2);
    let depth_sigma = (detection.depth_sigma_error * depth * depth).max(detection.min_depth_sigma_mm);
    Matrix3::from_diagonal(&Vector3::new(pixel_variance, pixel_variance, depth_sigma.powi(2)))
}

/// Covariance of a pixel observation without depth.
pub fn screen_2d_covariance(detection: &DetectionConfig) -> Matrix2<f64> {
    Matrix2::identity() * detection.keypoint_sigma_px.powi(2)
}

/// Jacobian of the back projection `(u, v, d) -> (x, y, z)`.
pub fn screen_to_camera_jacobian(screen: &ScreenCoordinate, camera: &CameraModel) -> Matrix3<f64> {
    Matrix3::new(
        screen.depth / camera.fx, 0.0, (screen.u - camera.cx) / camera.fx,
        0.0, screen.depth / camera.fy, (screen.v - camera.cy) / camera.fy,
        0.0, 0.0, 1.0,
    )
}

pub fn screen_to_camera_covariance(
    screen: &ScreenCoordinate,
    covariance: &Matrix3<f64>,
    camera: &CameraModel,
) -> Result<Matrix3<f64>, CovarianceError> {
    propagate_covariance(covariance, &screen_to_camera_jacobian(screen, camera))
}

/// Rotate a camera frame covariance to the world frame and add the
/// uncertainty of the camera position.
pub fn camera_to_world_covariance(
    covariance: &Matrix3<f64>,
    c2w: &CameraToWorld,
    pose_position_covariance: &Matrix3<f64>,
) -> Result<Matrix3<f64>, CovarianceError> {
    check_covariance(pose_position_covariance)?;
    let rotated = propagate_covariance(covariance, &c2w.rotation_matrix())?;
    let world = rotated + pose_position_covariance;
    check_covariance(&world)?;
    Ok(world)
}

/// Express a world covariance in the camera frame, including the camera
/// position uncertainty.
pub fn world_to_camera_covariance(
    covariance: &Matrix3<f64>,
    w2c: &WorldToCamera,
    pose_position_covariance: &Matrix3<f64>,
) -> Result<Matrix3<f64>, CovarianceError> {
    check_covariance(pose_position_covariance)?;
    propagate_covariance(&(covariance + pose_position_covariance), &w2c.rotation_matrix())
}

/// Image plane covariance of a camera point.
pub fn camera_to_screen_covariance(
    point: &CameraCoordinate,
    covariance: &Matrix3<f64>,
    camera: &CameraModel,
) -> Result<Matrix2<f64>, GeometryError> {
    let p = point.0;
    if p.z <= 0.0 {
        return Err(GeometryError::BehindCamera(p.z));
    }
    let inv_z = 1.0 / p.z;
    let jacobian = Matrix2x3::new(
        camera.fx * inv_z, 0.0, -camera.fx * p.x * inv_z * inv_z,
        0.0, camera.fy * inv_z, -camera.fy * p.y * inv_z * inv_z,
    );
    Ok(propagate_covariance(covariance, &jacobian)?)
}

/// World covariance of an RGB-D observation made from an uncertain pose.
pub fn world_point_covariance(
    screen: &ScreenCoordinate,
    c2w: &CameraToWorld,
    pose_position_covariance: &Matrix3<f64>,
    camera: &CameraModel,
    detection: &DetectionConfig,
) -> Result<Matrix3<f64>, GeometryError> {
    if !detection.is_depth_valid(screen.depth) {
        return Err(GeometryError::InvalidDepth(screen.depth));
    }
    let screen_covariance = screen_point_covariance(screen.depth, detection);
    let camera_covariance = screen_to_camera_covariance(screen, &screen_covariance, camera)?;
    Ok(camera_to_world_covariance(&camera_covariance, c2w, pose_position_covariance)?)
}

/// World covariance of a camera plane `(n, d)`.
///
/// ```text
/// n_w = R n_c
/// d_w = d_c - n_wᵀ p
/// ```
///
/// The camera position `p` contributes `n_wᵀ Σ_p n_w` to the offset variance.
pub fn plane_camera_to_world_covariance(
    plane: &PlaneCameraCoordinates,
    covariance: &Matrix4<f64>,
    c2w: &CameraToWorld,
    pose_position_covariance: &Matrix3<f64>,
) -> Result<Matrix4<f64>, CovarianceError> {
    check_covariance(pose_position_covariance)?;
    let rotation = c2w.rotation_matrix();
    let position = c2w.camera_position();

    let mut jacobian = Matrix4::zeros();
    jacobian.fixed_view_mut::<3, 3>(0, 0).copy_from(&rotation);
    let offset_row = -(position.transpose() * rotation);
    jacobian.fixed_view_mut::<1, 3>(3, 0).copy_from(&offset_row);
    jacobian[(3, 3)] = 1.0;

    let mut world = propagate_covariance(covariance, &jacobian)?;
    let normal_w = rotation * plane.normal;
    world[(3, 3)] += (normal_w.transpose() * pose_position_covariance * normal_w)[(0, 0)];
    check_covariance(&world)?;
    Ok(world)
}

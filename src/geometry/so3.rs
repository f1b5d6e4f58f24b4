//! SO(3) helpers for the pose parametrization used by the optimizer.
//!
//! The optimizer works on a scaled-axis rotation vector (axis times angle),
//! a minimal 3 parameter chart of the rotation group that avoids the
//! redundancy of a quaternion and the gimbal lock of Euler angles.

use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3};

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Converts a quaternion to its scaled-axis vector.
///
/// The quaternion is flipped to `w >= 0` first, so the returned angle is in
/// `[0, π]`:
///
/// ```text
/// angle = 2 atan2(|v|, w)
/// axis  = v / |v|
/// ```
pub fn quaternion_to_scaled_axis(quaternion: &UnitQuaternion<f64>) -> Vector3<f64> {
    let q = quaternion.quaternion();
    let (w, v) = if q.w >= 0.0 {
        (q.w, q.imag())
    } else {
        (-q.w, -q.imag())
    };

    let sin_half_angle = v.norm();
    if sin_half_angle > 0.0 {
        let angle = 2.0 * sin_half_angle.atan2(w);
        v * (angle / sin_half_angle)
    } else {
        // |v| underflowed: w ~ 1 and the angle is ~ 2|v|
        v * (2.0 / w)
    }
}

/// Converts a scaled-axis vector to a unit quaternion.
///
/// ```text
/// ha = |a| / 2
/// q  = (cos ha, a sin(ha) / |a|)
/// ```
pub fn scaled_axis_to_quaternion(scaled_axis: &Vector3<f64>) -> UnitQuaternion<f64> {
    let angle = scaled_axis.norm();
    let half_angle = angle / 2.0;
    let scale = if angle > 0.0 {
        half_angle.sin() / angle
    } else {
        0.5
    };
    let v = scaled_axis * scale;
    UnitQuaternion::from_quaternion(Quaternion::new(half_angle.cos(), v.x, v.y, v.z))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_skew_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(4.0, 5.0, 6.0);

        assert_relative_eq!(v.cross(&u), skew(&v) * u, epsilon = 1e-12);
        assert_relative_eq!(skew(&v), -skew(&v).transpose(), epsilon = 1e-12);
    }

    #[test]
    fn test_scaled_axis_round_trip() {
        let axis = Vector3::new(0.3, -0.5, 0.8).normalize();
        for angle in [1e-9, 0.01, 0.5, 2.0, 3.1] {
            let a = axis * angle;
            let q = scaled_axis_to_quaternion(&a);
            assert_relative_eq!(quaternion_to_scaled_axis(&q), a, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_scaled_axis_matches_nalgebra() {
        let a = Vector3::new(0.2, 0.1, -0.4);
        let expected = UnitQuaternion::from_scaled_axis(a);

        assert_relative_eq!(scaled_axis_to_quaternion(&a).angle_to(&expected), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_negative_w_is_flipped() {
        let q = UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.0, 0.4));
        let flipped = UnitQuaternion::new_unchecked(-q.into_inner());

        assert_relative_eq!(quaternion_to_scaled_axis(&flipped), Vector3::new(0.0, 0.0, 0.4), epsilon = 1e-12);
    }

    #[test]
    fn test_zero_rotation() {
        let q = scaled_axis_to_quaternion(&Vector3::zeros());
        assert_relative_eq!(q.w, 1.0);
        assert_relative_eq!(quaternion_to_scaled_axis(&q), Vector3::zeros());
    }
}

//! Rigid board-to-camera transform.

use nalgebra::{Matrix3, Matrix3x4, Matrix4, Point3, Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Pose of the board in the camera frame: `X_cam = R · X_board + t`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn new(rotation: Rotation3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build from an axis-angle (Rodrigues) vector and a translation.
    pub fn from_rvec_tvec(rvec: &Vector3<f64>, tvec: &Vector3<f64>) -> Self {
        Self::new(Rotation3::new(*rvec), *tvec)
    }

    /// Axis-angle (Rodrigues) vector of the rotation.
    ///
    /// Goes through the quaternion so matrices a few ulps off orthonormal
    /// (trace slightly above 3) still give a finite vector.
    pub fn rvec(&self) -> Vector3<f64> {
        UnitQuaternion::from_rotation_matrix(&self.rotation).scaled_axis()
    }

    /// Rotation as a plain 3×3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        *self.rotation.matrix()
    }

    /// `[R | t]`.
    pub fn extrinsic(&self) -> Matrix3x4<f64> {
        let mut m = Matrix3x4::zeros();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(self.rotation.matrix());
        m.set_column(3, &self.translation);
        m
    }

    /// `[R | t ; 0 0 0 1]`.
    pub fn homogeneous(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 4>(0, 0).copy_from(&self.extrinsic());
        m
    }

    #[inline]
    pub fn transform_point(&self, p: &Point3<f64>) -> Point3<f64> {
        self.rotation.transform_point(p) + self.translation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn homogeneous_has_fixed_bottom_row() {
        let pose =
            Pose::from_rvec_tvec(&Vector3::new(0.1, -0.2, 0.3), &Vector3::new(1.0, 2.0, 3.0));
        let m = pose.homogeneous();
        assert_eq!(m.row(3).iter().copied().collect::<Vec<_>>(), vec![0.0, 0.0, 0.0, 1.0]);
        let r = m.fixed_view::<3, 3>(0, 0).clone_owned();
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-12);
        assert_eq!(m[(0, 3)], 1.0);
        assert_eq!(m[(2, 3)], 3.0);
    }

    #[test]
    fn rvec_round_trips() {
        let rvec = Vector3::new(0.4, 0.1, -0.7);
        let pose = Pose::from_rvec_tvec(&rvec, &Vector3::zeros());
        assert_relative_eq!(pose.rvec(), rvec, epsilon = 1e-12);
    }

    #[test]
    fn rvec_of_slightly_inflated_identity_is_zero() {
        let mut m = Matrix3::identity();
        m[(0, 0)] += 4.0 * f64::EPSILON;
        m[(1, 1)] += 4.0 * f64::EPSILON;
        let pose = Pose::new(Rotation3::from_matrix_unchecked(m), Vector3::new(0.0, 0.0, 1.0));
        let rvec = pose.rvec();
        assert!(rvec.iter().all(|v| v.is_finite()), "{rvec:?}");
        assert!(rvec.norm() < 1e-7, "{rvec:?}");
    }

    #[test]
    fn rvec_of_half_turn_has_length_pi() {
        let pose = Pose::new(
            Rotation3::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI),
            Vector3::zeros(),
        );
        assert_relative_eq!(pose.rvec().norm(), std::f64::consts::PI, epsilon = 1e-9);
    }

    #[test]
    fn transform_matches_extrinsic_product() {
        let pose = Pose::from_rvec_tvec(&Vector3::new(0.0, 0.5, 0.0), &Vector3::new(0.0, 0.0, 2.0));
        let p = Point3::new(0.1, 0.2, 0.0);
        let q = pose.transform_point(&p);
        let h = pose.extrinsic() * p.to_homogeneous();
        assert_relative_eq!(q.coords, h, epsilon = 1e-12);
    }
}

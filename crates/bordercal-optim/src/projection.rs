//! Flat parameter blocks and reprojection with forward-mode Jacobians.
//!
//! Camera block: `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`.
//! Pose block: `[rx, ry, rz, tx, ty, tz]` (axis-angle + translation).

use bordercal_core::{BrownConrady, CameraModel, PinholeIntrinsics, Pose, MIN_DEPTH};
use nalgebra::{Point3, SMatrix, Vector2, Vector3};
use num_dual::{Dual64, DualNum};
use std::ops::Range;

pub(crate) const CAMERA_PARAMS: usize = 9;
pub(crate) const POSE_PARAMS: usize = 6;
pub(crate) const POINT_PARAMS: usize = CAMERA_PARAMS + POSE_PARAMS;

pub(crate) type PointJacobian = SMatrix<f64, 2, POINT_PARAMS>;

pub(crate) fn camera_params(camera: &CameraModel) -> [f64; CAMERA_PARAMS] {
    let k = &camera.intrinsics;
    let d = camera.distortion.to_array();
    [k.fx, k.fy, k.cx, k.cy, d[0], d[1], d[2], d[3], d[4]]
}

pub(crate) fn camera_from_params(p: &[f64]) -> CameraModel {
    CameraModel::new(
        PinholeIntrinsics {
            fx: p[0],
            fy: p[1],
            cx: p[2],
            cy: p[3],
        },
        BrownConrady::from_array([p[4], p[5], p[6], p[7], p[8]]),
    )
}

pub(crate) fn pose_params(pose: &Pose) -> [f64; POSE_PARAMS] {
    let r = pose.rvec();
    let t = pose.translation;
    [r.x, r.y, r.z, t.x, t.y, t.z]
}

pub(crate) fn pose_from_params(p: &[f64]) -> Pose {
    Pose::from_rvec_tvec(
        &Vector3::new(p[0], p[1], p[2]),
        &Vector3::new(p[3], p[4], p[5]),
    )
}

/// Rotate the board point `p` by the axis-angle vector `r` (Rodrigues).
fn rotate<D: DualNum<f64> + Copy>(r: [D; 3], p: [f64; 3]) -> [D; 3] {
    let cross = [
        r[1] * p[2] - r[2] * p[1],
        r[2] * p[0] - r[0] * p[2],
        r[0] * p[1] - r[1] * p[0],
    ];
    let theta2 = r[0] * r[0] + r[1] * r[1] + r[2] * r[2];
    if theta2.re() < 1e-16 {
        // First order; exact in value and derivative at r = 0.
        return [0, 1, 2].map(|i| cross[i] + p[i]);
    }
    let theta = theta2.sqrt();
    let a = theta.sin() / theta;
    let b = (-theta.cos() + 1.0) / theta2;
    let dot = r[0] * p[0] + r[1] * p[1] + r[2] * p[2];
    [0, 1, 2].map(|i| theta.cos() * p[i] + cross[i] * a + r[i] * dot * b)
}

/// Pinhole + Brown–Conrady projection of a board point, generic over the
/// scalar so the same code yields values (`f64`) and derivatives (duals).
fn project_generic<D: DualNum<f64> + Copy>(
    params: &[D; POINT_PARAMS],
    object: &Point3<f64>,
) -> Option<[D; 2]> {
    let [fx, fy, cx, cy, k1, k2, p1, p2, k3] = [0, 1, 2, 3, 4, 5, 6, 7, 8].map(|i| params[i]);
    let pose = &params[CAMERA_PARAMS..];

    let rotated = rotate([pose[0], pose[1], pose[2]], [object.x, object.y, object.z]);
    let pc = [rotated[0] + pose[3], rotated[1] + pose[4], rotated[2] + pose[5]];
    if !(pc[2].re() > MIN_DEPTH) {
        return None;
    }

    let x = pc[0] / pc[2];
    let y = pc[1] / pc[2];
    let r2 = x * x + y * y;
    let radial = (k1 + (k2 + k3 * r2) * r2) * r2 + 1.0;
    let xy = x * y;
    let xd = x * radial + p1 * xy * 2.0 + p2 * (r2 + x * x * 2.0);
    let yd = y * radial + p1 * (r2 + y * y * 2.0) + p2 * xy * 2.0;
    Some([fx * xd + cx, fy * yd + cy])
}

/// Project a board point through `camera_block ++ pose_block`.
pub(crate) fn project(params: &[f64; POINT_PARAMS], object: &Point3<f64>) -> Option<Vector2<f64>> {
    project_generic(params, object).map(|[u, v]| Vector2::new(u, v))
}

/// Projection and its Jacobian w.r.t. the parameters in `columns`, one
/// forward-mode dual pass per column. Other columns are left at zero.
pub(crate) fn project_with_jacobian(
    params: &[f64; POINT_PARAMS],
    object: &Point3<f64>,
    columns: Range<usize>,
) -> Option<(Vector2<f64>, PointJacobian)> {
    let value = project(params, object)?;
    let mut jac = PointJacobian::zeros();
    for j in columns {
        let seeded: [Dual64; POINT_PARAMS] =
            std::array::from_fn(|i| Dual64::new(params[i], if i == j { 1.0 } else { 0.0 }));
        let [u, v] = project_generic(&seeded, object)?;
        jac[(0, j)] = u.eps;
        jac[(1, j)] = v.eps;
    }
    Some((value, jac))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn params() -> [f64; POINT_PARAMS] {
        [
            800.0, 780.0, 640.0, 360.0, -0.1, 0.01, 0.001, -0.002, 0.0, //
            0.1, -0.2, 0.05, 0.02, -0.03, 0.8,
        ]
    }

    #[test]
    fn blocks_round_trip() {
        let p = params();
        let camera = camera_from_params(&p[..CAMERA_PARAMS]);
        assert_eq!(camera_params(&camera), p[..CAMERA_PARAMS]);
        let pose = pose_from_params(&p[CAMERA_PARAMS..]);
        let back = pose_params(&pose);
        for (a, b) in back.iter().zip(&p[CAMERA_PARAMS..]) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn matches_camera_model_projection() {
        let p = params();
        let x = Point3::new(0.05, 0.02, 0.0);
        let camera = camera_from_params(&p[..CAMERA_PARAMS]);
        let pose = pose_from_params(&p[CAMERA_PARAMS..]);
        let expected = camera.project(&pose.transform_point(&x)).expect("in front");
        let got = project(&p, &x).expect("in front");
        assert_relative_eq!(got, expected.coords, epsilon = 1e-9);
    }

    #[test]
    fn focal_length_column_matches_normalized_coordinate() {
        let p = params();
        let x = Point3::new(0.05, 0.02, 0.0);
        let (value, jac) = project_with_jacobian(&p, &x, 0..POINT_PARAMS).expect("projectable");
        // u = fx * xd + cx  =>  du/dfx = xd = (u - cx) / fx
        assert_relative_eq!(jac[(0, 0)], (value.x - p[2]) / p[0], epsilon = 1e-12);
        assert_relative_eq!(jac[(0, 2)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(jac[(1, 0)], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn pose_columns_match_finite_differences() {
        let p = params();
        let x = Point3::new(-0.07, 0.11, 0.0);
        let (_, jac) =
            project_with_jacobian(&p, &x, CAMERA_PARAMS..POINT_PARAMS).expect("projectable");
        for j in CAMERA_PARAMS..POINT_PARAMS {
            let h = 1e-6;
            let mut plus = p;
            let mut minus = p;
            plus[j] += h;
            minus[j] -= h;
            let fd = (project(&plus, &x).unwrap() - project(&minus, &x).unwrap()) / (2.0 * h);
            assert_relative_eq!(jac[(0, j)], fd.x, epsilon = 1e-4, max_relative = 1e-6);
            assert_relative_eq!(jac[(1, j)], fd.y, epsilon = 1e-4, max_relative = 1e-6);
        }
        assert_eq!(jac[(0, 0)], 0.0);
    }

    #[test]
    fn rotation_derivative_is_finite_at_zero() {
        let mut p = params();
        p[CAMERA_PARAMS..CAMERA_PARAMS + 3].copy_from_slice(&[0.0; 3]);
        let x = Point3::new(0.1, 0.0, 0.0);
        let (_, jac) =
            project_with_jacobian(&p, &x, CAMERA_PARAMS..POINT_PARAMS).expect("projectable");
        assert!(jac.iter().all(|v| v.is_finite()));
        // A small rotation about y moves a point on +x towards -z; u grows.
        assert!(jac[(0, CAMERA_PARAMS + 1)] > 0.0);
    }

    #[test]
    fn behind_camera_is_not_projectable() {
        let mut p = params();
        p[CAMERA_PARAMS + 5] = -1.0;
        assert!(project(&p, &Point3::new(0.0, 0.0, 0.0)).is_none());
    }
}

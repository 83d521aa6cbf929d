//! Closed-form initialisation: Zhang intrinsics and planar pose from `H`.

use bordercal_core::{PinholeIntrinsics, Pose};
use nalgebra::{DMatrix, Matrix3, Rotation3, SVector, UnitQuaternion, Vector3};

/// `v_ij(H)` from Zhang's method.
fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> SVector<f64, 6> {
    let hi = h.column(i);
    let hj = h.column(j);
    SVector::<f64, 6>::from_row_slice(&[
        hi[0] * hj[0],
        hi[0] * hj[1] + hi[1] * hj[0],
        hi[1] * hj[1],
        hi[2] * hj[0] + hi[0] * hj[2],
        hi[2] * hj[1] + hi[1] * hj[2],
        hi[2] * hj[2],
    ])
}

/// Zhang's closed-form intrinsics from plane homographies (board → pixels).
///
/// Needs at least 3 homographies of non-parallel board orientations. Skew is
/// estimated by the linear system but dropped from the result. Returns
/// `None` for degenerate configurations.
pub fn zhang_intrinsics(homographies: &[Matrix3<f64>]) -> Option<PinholeIntrinsics> {
    if homographies.len() < 3 {
        return None;
    }

    let m = homographies.len();
    let mut v = DMatrix::<f64>::zeros(2 * m, 6);
    for (k, h) in homographies.iter().enumerate() {
        // columns scaled to unit norm keep rows comparable across views
        let h = h / h.column(0).norm().max(1e-12);
        let v11 = v_ij(&h, 0, 0);
        let v22 = v_ij(&h, 1, 1);
        let v12 = v_ij(&h, 0, 1);
        v.row_mut(2 * k).copy_from(&v12.transpose());
        v.row_mut(2 * k + 1).copy_from(&(v11 - v22).transpose());
    }

    let svd = v.svd(false, true);
    let v_t = svd.v_t?;
    let b = v_t.row(v_t.nrows().checked_sub(1)?);
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let denom = b11 * b22 - b12 * b12;
    let denom_norm = b11 * b11 + b22 * b22;
    if denom_norm <= 0.0 || denom.abs() / denom_norm <= 1e-9 {
        return None;
    }

    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    if lambda / b11 <= 0.0 || lambda * b11 / denom <= 0.0 {
        return None;
    }

    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / denom).sqrt();
    let gamma = -b12 * alpha * alpha * beta / lambda;
    let u0 = gamma * v0 / beta - b13 * alpha * alpha / lambda;

    let k = PinholeIntrinsics {
        fx: alpha,
        fy: beta,
        cx: u0,
        cy: v0,
    };
    k.is_valid().then_some(k)
}

/// Decompose a board-plane homography into the board pose, given `K`.
///
/// `H ~ K [r1 r2 t]`; the scale sign is chosen so the board lies in front of
/// the camera and the rotation is projected onto SO(3).
pub fn pose_from_homography(k: &Matrix3<f64>, h: &Matrix3<f64>) -> Option<Pose> {
    let k_inv = k.try_inverse()?;
    let a1 = k_inv * h.column(0);
    let a2 = k_inv * h.column(1);
    let a3 = k_inv * h.column(2);

    let norm = 0.5 * (a1.norm() + a2.norm());
    if !(norm.is_finite() && norm > 1e-12) {
        return None;
    }
    let mut lambda = 1.0 / norm;
    if a3.z * lambda < 0.0 {
        lambda = -lambda;
    }

    let r1 = a1 * lambda;
    let r2 = a2 * lambda;
    let r3 = r1.cross(&r2);
    let t: Vector3<f64> = a3 * lambda;

    let r = Matrix3::from_columns(&[r1, r2, r3]);
    let svd = r.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut r_orth = u * v_t;
    if r_orth.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r_orth = u_flipped * v_t;
    }

    // The SVD product can sit a few ulps off SO(3); rebuild it exactly.
    let q = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r_orth));
    Some(Pose::new(q.to_rotation_matrix(), t))
}

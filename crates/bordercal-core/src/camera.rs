//! Pinhole camera with Brown–Conrady lens distortion.
//!
//! Projection chain: `X_cam -> (x/z, y/z) -> distort -> (fx·x + cx, fy·y + cy)`.

use nalgebra::{Matrix3, Point2, Point3, Vector2};
use serde::{Deserialize, Serialize};

/// Camera points closer than this to the image plane are not projectable.
pub const MIN_DEPTH: f64 = 1e-9;

/// Pinhole intrinsics without skew.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PinholeIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl PinholeIntrinsics {
    /// The 3×3 camera matrix `K`.
    pub fn k_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Read `fx, fy, cx, cy` from a camera matrix. Skew is ignored.
    pub fn from_k_matrix(k: &Matrix3<f64>) -> Self {
        Self {
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
        }
    }

    #[inline]
    pub fn to_pixel(&self, n: &Vector2<f64>) -> Point2<f64> {
        Point2::new(self.fx * n.x + self.cx, self.fy * n.y + self.cy)
    }

    #[inline]
    pub fn to_normalized(&self, p: &Point2<f64>) -> Vector2<f64> {
        Vector2::new((p.x - self.cx) / self.fx, (p.y - self.cy) / self.fy)
    }

    pub fn is_valid(&self) -> bool {
        [self.fx, self.fy, self.cx, self.cy]
            .iter()
            .all(|v| v.is_finite())
            && self.fx > 0.0
            && self.fy > 0.0
    }
}

/// Radial (`k1, k2, k3`) + tangential (`p1, p2`) distortion.
///
/// The array form follows the OpenCV coefficient order `[k1, k2, p1, p2, k3]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BrownConrady {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

/// Number of coefficients in the distortion vector.
pub const DISTORTION_LEN: usize = 5;

/// Distortion vector with an unsupported number of coefficients.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("distortion vector must have 4 or 5 coefficients, got {0}")]
pub struct DistortionLenError(pub usize);

impl BrownConrady {
    pub fn to_array(&self) -> [f64; DISTORTION_LEN] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    pub fn from_array(d: [f64; DISTORTION_LEN]) -> Self {
        Self {
            k1: d[0],
            k2: d[1],
            p1: d[2],
            p2: d[3],
            k3: d[4],
        }
    }

    /// Accepts `[k1, k2, p1, p2]` or `[k1, k2, p1, p2, k3]`.
    pub fn from_slice(d: &[f64]) -> Result<Self, DistortionLenError> {
        match d.len() {
            4 => Ok(Self::from_array([d[0], d[1], d[2], d[3], 0.0])),
            5 => Ok(Self::from_array([d[0], d[1], d[2], d[3], d[4]])),
            n => Err(DistortionLenError(n)),
        }
    }

    /// Apply distortion to an undistorted normalized point.
    pub fn distort(&self, n: &Vector2<f64>) -> Vector2<f64> {
        let (x, y) = (n.x, n.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
        let xy = x * y;
        let dx = 2.0 * self.p1 * xy + self.p2 * (r2 + 2.0 * x * x);
        let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * xy;
        Vector2::new(x * radial + dx, y * radial + dy)
    }

    /// Invert [`Self::distort`] by fixed-point iteration.
    pub fn undistort(&self, d: &Vector2<f64>, iters: usize) -> Vector2<f64> {
        let mut u = *d;
        for _ in 0..iters.max(1) {
            let e = self.distort(&u) - d;
            u -= e;
            if e.norm_squared() < 1e-28 {
                break;
            }
        }
        u
    }
}

/// Intrinsics plus distortion.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub intrinsics: PinholeIntrinsics,
    #[serde(default)]
    pub distortion: BrownConrady,
}

impl CameraModel {
    pub fn new(intrinsics: PinholeIntrinsics, distortion: BrownConrady) -> Self {
        Self {
            intrinsics,
            distortion,
        }
    }

    /// Project a camera-frame point to pixels. `None` behind the camera.
    pub fn project(&self, p: &Point3<f64>) -> Option<Point2<f64>> {
        if p.z.is_nan() || p.z <= MIN_DEPTH {
            return None;
        }
        let n = Vector2::new(p.x / p.z, p.y / p.z);
        Some(self.intrinsics.to_pixel(&self.distortion.distort(&n)))
    }

    /// Pixel to undistorted normalized image coordinates.
    pub fn normalize(&self, p: &Point2<f64>) -> Vector2<f64> {
        let d = self.intrinsics.to_normalized(p);
        self.distortion.undistort(&d, 20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> CameraModel {
        CameraModel::new(
            PinholeIntrinsics {
                fx: 800.0,
                fy: 790.0,
                cx: 640.0,
                cy: 360.0,
            },
            BrownConrady {
                k1: -0.12,
                k2: 0.03,
                p1: 0.001,
                p2: -0.0005,
                k3: 0.0,
            },
        )
    }

    #[test]
    fn k_matrix_round_trips() {
        let cam = camera();
        let k = cam.intrinsics.k_matrix();
        assert_eq!(k[(2, 2)], 1.0);
        assert_eq!(PinholeIntrinsics::from_k_matrix(&k), cam.intrinsics);
    }

    #[test]
    fn normalize_inverts_project() {
        let cam = camera();
        let p = Point3::new(0.12, -0.08, 0.9);
        let px = cam.project(&p).expect("in front");
        let n = cam.normalize(&px);
        assert_relative_eq!(n.x, p.x / p.z, epsilon = 1e-9);
        assert_relative_eq!(n.y, p.y / p.z, epsilon = 1e-9);
    }

    #[test]
    fn points_behind_camera_are_not_projected() {
        assert!(camera().project(&Point3::new(0.0, 0.0, -1.0)).is_none());
        assert!(camera().project(&Point3::new(0.0, 0.0, 0.0)).is_none());
    }

    #[test]
    fn zero_distortion_is_identity() {
        let d = BrownConrady::default();
        let n = Vector2::new(0.3, -0.2);
        assert_eq!(d.distort(&n), n);
    }

    #[test]
    fn distortion_slice_lengths() {
        let d = BrownConrady::from_slice(&[0.1, 0.2, 0.3, 0.4]).unwrap();
        assert_eq!(d.to_array(), [0.1, 0.2, 0.3, 0.4, 0.0]);
        assert_eq!(
            BrownConrady::from_slice(&[0.0; 8]).unwrap_err(),
            DistortionLenError(8)
        );
    }
}

//! Per-image marker detections and their board correspondences.

use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

/// One decoded marker with its refined pixel corners (TL, TR, BR, BL).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectedMarker {
    pub id: u32,
    pub corners: [Point2<f64>; 4],
}

/// Detector output for one image. An empty marker list is a valid result.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Image identity (usually the file name); used to name pose artifacts.
    pub image_id: String,
    /// `[width, height]` in pixels, when the detector knows it.
    #[serde(default)]
    pub image_size: Option<[u32; 2]>,
    #[serde(default)]
    pub markers: Vec<DetectedMarker>,
}

impl Detection {
    pub fn new(image_id: impl Into<String>, markers: Vec<DetectedMarker>) -> Self {
        Self {
            image_id: image_id.into(),
            image_size: None,
            markers,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

/// 3D board points paired with observed pixels for one image.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Correspondences {
    pub object: Vec<Point3<f64>>,
    pub image: Vec<Point2<f64>>,
    /// Board markers that contributed, in detection order.
    pub marker_ids: Vec<u32>,
    /// Detected ids that are not on the board.
    pub unknown_ids: Vec<u32>,
}

impl Correspondences {
    /// Number of point pairs.
    #[inline]
    pub fn len(&self) -> usize {
        self.object.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.object.is_empty()
    }

    /// Board-plane `(x, y)` of every object point.
    pub fn object_xy(&self) -> Vec<Point2<f64>> {
        self.object.iter().map(|p| Point2::new(p.x, p.y)).collect()
    }

    /// True when the board points span a plane region rather than a line.
    ///
    /// `rel_tol` bounds the ratio between the smaller and larger eigenvalue
    /// of the 2D point scatter.
    pub fn spans_plane(&self, rel_tol: f64) -> bool {
        if self.object.len() < 4 {
            return false;
        }
        let n = self.object.len() as f64;
        let (mx, my) = self
            .object
            .iter()
            .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
        let (mx, my) = (mx / n, my / n);
        let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
        for p in &self.object {
            let dx = p.x - mx;
            let dy = p.y - my;
            sxx += dx * dx;
            syy += dy * dy;
            sxy += dx * dy;
        }
        let tr = sxx + syy;
        if tr <= 0.0 {
            return false;
        }
        let det = sxx * syy - sxy * sxy;
        let disc = (tr * tr * 0.25 - det).max(0.0).sqrt();
        let l_max = tr * 0.5 + disc;
        let l_min = tr * 0.5 - disc;
        l_min > rel_tol * l_max
    }
}

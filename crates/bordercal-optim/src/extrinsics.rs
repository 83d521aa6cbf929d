//! Per-image board pose (PnP) with the intrinsics held fixed.

use crate::init::pose_from_homography;
use crate::intrinsics::IntrinsicResult;
use crate::lm::{self, NllsProblem, SolverOptions};
use crate::projection::{
    camera_params, pose_from_params, pose_params, project, project_with_jacobian, CAMERA_PARAMS,
    POINT_PARAMS, POSE_PARAMS,
};
use bordercal_core::{
    estimate_homography, BoardModel, CameraModel, Correspondences, Detection, Pose, MIN_DEPTH,
};
use nalgebra::{DMatrix, DVector, Matrix3, Point2};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Pose estimation settings.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseOptions {
    /// Fewest board markers that make a pose. A single marker's four
    /// corners are too ambiguous to trust.
    pub min_markers: usize,
    /// Minimum eigenvalue ratio of the board-point scatter; below it the
    /// points are treated as collinear.
    pub planar_tol: f64,
    pub solver: SolverOptions,
}

impl Default for PoseOptions {
    fn default() -> Self {
        Self {
            min_markers: 2,
            planar_tol: 1e-6,
            solver: SolverOptions::default(),
        }
    }
}

/// Why an image produced no pose.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PoseFailure {
    #[error("only {markers} board markers ({points} corners) detected")]
    InsufficientCorrespondences { markers: usize, points: usize },
    #[error("detected corners are degenerate (collinear or non-invertible)")]
    Degenerate,
    #[error("pose refinement failed: {reason}")]
    Diverged { reason: String },
}

/// Result of estimating one image's pose.
#[derive(Clone, Debug, PartialEq)]
pub enum PoseOutcome {
    /// The detector found no marker at all.
    NoDetections,
    Failed(PoseFailure),
    Found(Pose),
}

impl PoseOutcome {
    pub fn pose(&self) -> Option<&Pose> {
        match self {
            PoseOutcome::Found(p) => Some(p),
            _ => None,
        }
    }

    #[inline]
    pub fn is_found(&self) -> bool {
        matches!(self, PoseOutcome::Found(_))
    }
}

/// A found pose tagged with the image it came from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimatedPose {
    pub image_id: String,
    pub pose: Pose,
}

/// Reprojection problem over the six pose parameters only.
struct PoseProblem<'a> {
    camera: [f64; CAMERA_PARAMS],
    corr: &'a Correspondences,
}

impl PoseProblem<'_> {
    fn params(&self, x: &DVector<f64>) -> [f64; POINT_PARAMS] {
        let mut p = [0.0; POINT_PARAMS];
        p[..CAMERA_PARAMS].copy_from_slice(&self.camera);
        p[CAMERA_PARAMS..].copy_from_slice(x.as_slice());
        p
    }
}

impl NllsProblem for PoseProblem<'_> {
    fn residuals(&self, x: &DVector<f64>) -> Option<DVector<f64>> {
        let params = self.params(x);
        let mut r = DVector::zeros(2 * self.corr.len());
        for (i, (obj, img)) in self.corr.object.iter().zip(&self.corr.image).enumerate() {
            let p = project(&params, obj)?;
            r[2 * i] = p.x - img.x;
            r[2 * i + 1] = p.y - img.y;
        }
        Some(r)
    }

    fn jacobian(&self, x: &DVector<f64>) -> Option<DMatrix<f64>> {
        let params = self.params(x);
        let mut jac = DMatrix::zeros(2 * self.corr.len(), POSE_PARAMS);
        for (i, obj) in self.corr.object.iter().enumerate() {
            let (_, j) = project_with_jacobian(&params, obj, CAMERA_PARAMS..POINT_PARAMS)?;
            jac.view_mut((2 * i, 0), (2, POSE_PARAMS))
                .copy_from(&j.fixed_columns::<POSE_PARAMS>(CAMERA_PARAMS));
        }
        Some(jac)
    }
}

/// Board pose estimator for calibrated cameras.
#[derive(Clone, Debug, Default)]
pub struct ExtrinsicEstimator {
    options: PoseOptions,
}

impl ExtrinsicEstimator {
    pub fn new(options: PoseOptions) -> Self {
        Self { options }
    }

    #[inline]
    pub fn options(&self) -> &PoseOptions {
        &self.options
    }

    /// Estimate the board pose in one image.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip_all, fields(image = %detection.image_id))
    )]
    pub fn estimate_pose(
        &self,
        board: &BoardModel,
        detection: &Detection,
        intrinsics: &IntrinsicResult,
    ) -> PoseOutcome {
        if detection.is_empty() {
            return PoseOutcome::NoDetections;
        }
        let corr = board.correspondences(detection);
        match self.solve(&corr, &intrinsics.camera()) {
            Ok(pose) => PoseOutcome::Found(pose),
            Err(failure) => PoseOutcome::Failed(failure),
        }
    }

    /// Estimate every image's pose, keeping only the found ones (input order).
    pub fn estimate_batch(
        &self,
        board: &BoardModel,
        detections: &[Detection],
        intrinsics: &IntrinsicResult,
    ) -> Vec<EstimatedPose> {
        let mut out = Vec::with_capacity(detections.len());
        for detection in detections {
            match self.estimate_pose(board, detection, intrinsics) {
                PoseOutcome::Found(pose) => out.push(EstimatedPose {
                    image_id: detection.image_id.clone(),
                    pose,
                }),
                PoseOutcome::NoDetections => {
                    log::info!("{}: no markers detected, no pose", detection.image_id)
                }
                PoseOutcome::Failed(failure) => {
                    log::warn!("{}: {failure}", detection.image_id)
                }
            }
        }
        log::info!("estimated {} of {} poses", out.len(), detections.len());
        out
    }

    fn solve(&self, corr: &Correspondences, camera: &CameraModel) -> Result<Pose, PoseFailure> {
        let markers = corr.marker_ids.len();
        if markers < self.options.min_markers.max(1) || corr.len() < 4 {
            return Err(PoseFailure::InsufficientCorrespondences {
                markers,
                points: corr.len(),
            });
        }
        if !corr.spans_plane(self.options.planar_tol) {
            return Err(PoseFailure::Degenerate);
        }

        // Homography to undistorted normalised coordinates, so K = I.
        let normalized: Vec<Point2<f64>> = corr
            .image
            .iter()
            .map(|p| Point2::from(camera.normalize(p)))
            .collect();
        let h = estimate_homography(&corr.object_xy(), &normalized)
            .ok_or(PoseFailure::Degenerate)?;
        let initial =
            pose_from_homography(&Matrix3::identity(), &h.h).ok_or(PoseFailure::Degenerate)?;

        let problem = PoseProblem {
            camera: camera_params(camera),
            corr,
        };
        let x0 = DVector::from_row_slice(&pose_params(&initial));
        let (x, report) = lm::solve(&problem, x0, &self.options.solver);
        if !report.termination.was_successful() {
            return Err(PoseFailure::Diverged {
                reason: format!(
                    "{:?} after {} evaluations",
                    report.termination, report.evaluations
                ),
            });
        }

        let pose = pose_from_params(x.as_slice());
        if !(pose.translation.iter().all(|v| v.is_finite()) && pose.translation.z > 0.0) {
            return Err(PoseFailure::Diverged {
                reason: "board ends up behind the camera".into(),
            });
        }
        if corr
            .object
            .iter()
            .any(|p| pose.transform_point(p).z <= MIN_DEPTH)
        {
            return Err(PoseFailure::Diverged {
                reason: "board points behind the camera".into(),
            });
        }

        let rms = (report.final_cost * 2.0 / corr.len() as f64).sqrt();
        log::debug!(
            "pose from {markers} markers, rms {rms:.4} px, {} evaluations",
            report.evaluations
        );
        Ok(pose)
    }
}

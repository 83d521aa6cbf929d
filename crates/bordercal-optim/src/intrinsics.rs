//! Batch intrinsic calibration from many views of the board.
//!
//! All views are pooled into one joint problem over the shared camera
//! (`fx, fy, cx, cy`, Brown–Conrady distortion) and one pose per view.

use crate::init::{pose_from_homography, zhang_intrinsics};
use crate::lm::{self, NllsProblem, SolverOptions, Termination};
use crate::projection::{
    camera_from_params, camera_params, pose_from_params, pose_params, project,
    project_with_jacobian, CAMERA_PARAMS, POINT_PARAMS, POSE_PARAMS,
};
use bordercal_core::{
    estimate_homography, BoardModel, BrownConrady, CameraModel, Correspondences, Detection,
    PinholeIntrinsics, Pose, DISTORTION_LEN,
};
use nalgebra::{DMatrix, DVector, Matrix3};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Which distortion coefficients are estimated. The rest stay at zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistortionFit {
    /// Pure pinhole.
    None,
    /// `k1, k2, k3`; no tangential terms.
    Radial,
    /// `k1, k2, p1, p2`.
    RadialTangential,
    /// `k1, k2, p1, p2, k3`.
    #[default]
    Full,
}

impl DistortionFit {
    /// Indices (within the camera block) of the estimated distortion terms.
    fn free_terms(self) -> &'static [usize] {
        match self {
            DistortionFit::None => &[],
            DistortionFit::Radial => &[4, 5, 8],
            DistortionFit::RadialTangential => &[4, 5, 6, 7],
            DistortionFit::Full => &[4, 5, 6, 7, 8],
        }
    }
}

/// Intrinsic calibration settings.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntrinsicOptions {
    pub distortion: DistortionFit,
    pub solver: SolverOptions,
}

impl Default for IntrinsicOptions {
    fn default() -> Self {
        Self {
            distortion: DistortionFit::Full,
            solver: SolverOptions {
                max_iterations: 200,
                ..SolverOptions::default()
            },
        }
    }
}

/// Errors that abort a calibration run.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("no image yielded a usable marker correspondence ({images} images examined)")]
    InsufficientData { images: usize },
    #[error("invalid image size {width}x{height}")]
    InvalidImageSize { width: u32, height: u32 },
    #[error("joint optimisation diverged: {0}")]
    Diverged(String),
}

/// Fit of one contributing view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewReport {
    pub image_id: String,
    pub pose: Pose,
    pub points: usize,
    pub rms_error: f64,
}

/// Calibrated camera.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicResult {
    pub camera_matrix: Matrix3<f64>,
    /// `[k1, k2, p1, p2, k3]`.
    pub distortion: [f64; DISTORTION_LEN],
    /// RMS pixel reprojection error over all correspondences.
    pub rms_error: f64,
    #[serde(default)]
    pub image_size: Option<[u32; 2]>,
    /// Per-view fits; empty when loaded from an artifact.
    #[serde(default)]
    pub views: Vec<ViewReport>,
    /// Images that contributed nothing.
    #[serde(default)]
    pub excluded_images: Vec<String>,
    /// Residual evaluations spent by the joint solve.
    #[serde(default)]
    pub evaluations: usize,
}

impl IntrinsicResult {
    /// Wrap known intrinsics (e.g. from an artifact) without view data.
    pub fn from_camera(camera: &CameraModel, rms_error: f64, image_size: Option<[u32; 2]>) -> Self {
        Self {
            camera_matrix: camera.intrinsics.k_matrix(),
            distortion: camera.distortion.to_array(),
            rms_error,
            image_size,
            views: Vec::new(),
            excluded_images: Vec::new(),
            evaluations: 0,
        }
    }

    pub fn camera(&self) -> CameraModel {
        CameraModel::new(
            PinholeIntrinsics::from_k_matrix(&self.camera_matrix),
            BrownConrady::from_array(self.distortion),
        )
    }
}

struct View {
    image_id: String,
    corr: Correspondences,
}

/// Joint reprojection problem over the free subset of the full parameter
/// vector `[camera(9), pose_0(6), pose_1(6), ...]`.
struct JointProblem<'a> {
    views: &'a [View],
    template: DVector<f64>,
    free: Vec<usize>,
    column_of: Vec<Option<usize>>,
    residual_count: usize,
}

impl<'a> JointProblem<'a> {
    fn new(views: &'a [View], template: DVector<f64>, distortion: DistortionFit) -> Self {
        let mut free: Vec<usize> = (0..4).collect();
        free.extend_from_slice(distortion.free_terms());
        free.extend(CAMERA_PARAMS..template.len());

        let mut column_of = vec![None; template.len()];
        for (col, &idx) in free.iter().enumerate() {
            column_of[idx] = Some(col);
        }
        let residual_count = 2 * views.iter().map(|v| v.corr.len()).sum::<usize>();

        Self {
            views,
            template,
            free,
            column_of,
            residual_count,
        }
    }

    fn expand(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut full = self.template.clone();
        for (i, &idx) in self.free.iter().enumerate() {
            full[idx] = x[i];
        }
        full
    }

    fn restrict(&self, full: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(self.free.len(), self.free.iter().map(|&idx| full[idx]))
    }

    fn point_params(full: &DVector<f64>, view: usize) -> [f64; POINT_PARAMS] {
        let mut p = [0.0; POINT_PARAMS];
        p[..CAMERA_PARAMS].copy_from_slice(&full.as_slice()[..CAMERA_PARAMS]);
        let off = CAMERA_PARAMS + POSE_PARAMS * view;
        p[CAMERA_PARAMS..].copy_from_slice(&full.as_slice()[off..off + POSE_PARAMS]);
        p
    }
}

impl NllsProblem for JointProblem<'_> {
    fn residuals(&self, x: &DVector<f64>) -> Option<DVector<f64>> {
        let full = self.expand(x);
        let mut r = DVector::zeros(self.residual_count);
        let mut row = 0;
        for (v, view) in self.views.iter().enumerate() {
            let params = Self::point_params(&full, v);
            for (obj, img) in view.corr.object.iter().zip(&view.corr.image) {
                let p = project(&params, obj)?;
                r[row] = p.x - img.x;
                r[row + 1] = p.y - img.y;
                row += 2;
            }
        }
        Some(r)
    }

    fn jacobian(&self, x: &DVector<f64>) -> Option<DMatrix<f64>> {
        let full = self.expand(x);
        let mut jac = DMatrix::zeros(self.residual_count, self.free.len());
        let mut row = 0;
        for (v, view) in self.views.iter().enumerate() {
            let params = Self::point_params(&full, v);
            let pose_off = CAMERA_PARAMS + POSE_PARAMS * v;
            for obj in &view.corr.object {
                let (_, j) = project_with_jacobian(&params, obj, 0..POINT_PARAMS)?;
                for local in 0..POINT_PARAMS {
                    let global = if local < CAMERA_PARAMS {
                        local
                    } else {
                        pose_off + local - CAMERA_PARAMS
                    };
                    if let Some(col) = self.column_of[global] {
                        jac[(row, col)] = j[(0, local)];
                        jac[(row + 1, col)] = j[(1, local)];
                    }
                }
                row += 2;
            }
        }
        Some(jac)
    }
}

/// Batch intrinsic calibrator.
#[derive(Clone, Debug, Default)]
pub struct IntrinsicCalibrator {
    options: IntrinsicOptions,
}

impl IntrinsicCalibrator {
    pub fn new(options: IntrinsicOptions) -> Self {
        Self { options }
    }

    #[inline]
    pub fn options(&self) -> &IntrinsicOptions {
        &self.options
    }

    /// Calibrate from every view of `board` in `detections`.
    ///
    /// Views without a usable correspondence are excluded and listed in
    /// [`IntrinsicResult::excluded_images`]; the run only fails when no view
    /// remains.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self, board, detections), fields(images = detections.len()))
    )]
    pub fn calibrate(
        &self,
        board: &BoardModel,
        detections: Vec<Detection>,
        image_size: [u32; 2],
    ) -> Result<IntrinsicResult, CalibrationError> {
        let [width, height] = image_size;
        if width == 0 || height == 0 {
            return Err(CalibrationError::InvalidImageSize { width, height });
        }
        let images = detections.len();

        let mut views = Vec::new();
        let mut excluded_images = Vec::new();
        for detection in detections {
            let corr = board.correspondences(&detection);
            if corr.is_empty() {
                log::info!(
                    "{}: no usable markers, excluded from calibration",
                    detection.image_id
                );
                excluded_images.push(detection.image_id);
                continue;
            }
            views.push(View {
                image_id: detection.image_id,
                corr,
            });
        }

        let init = initial_guess(views, image_size, &mut excluded_images);
        if init.views.is_empty() {
            return Err(CalibrationError::InsufficientData { images });
        }
        let views = init.views;
        log::info!(
            "calibrating from {} of {} images ({} correspondences)",
            views.len(),
            images,
            views.iter().map(|v| v.corr.len()).sum::<usize>()
        );

        let mut template = DVector::zeros(CAMERA_PARAMS + POSE_PARAMS * views.len());
        let camera0 = CameraModel::new(init.intrinsics, BrownConrady::default());
        template.as_mut_slice()[..CAMERA_PARAMS].copy_from_slice(&camera_params(&camera0));
        for (v, pose) in init.poses.iter().enumerate() {
            let off = CAMERA_PARAMS + POSE_PARAMS * v;
            template.as_mut_slice()[off..off + POSE_PARAMS].copy_from_slice(&pose_params(pose));
        }

        let problem = JointProblem::new(&views, template, self.options.distortion);
        let x0 = problem.restrict(&problem.template);
        let (x, report) = lm::solve(&problem, x0, &self.options.solver);
        match report.termination {
            Termination::InvalidStart => {
                return Err(CalibrationError::Diverged(
                    "initial estimate places the board behind the camera".into(),
                ))
            }
            Termination::MaxIterations => log::warn!(
                "calibration stopped at the evaluation limit ({})",
                report.evaluations
            ),
            t => log::debug!(
                "calibration finished: {t:?} after {} evaluations",
                report.evaluations
            ),
        }

        let full = problem.expand(&x);
        let camera = camera_from_params(&full.as_slice()[..CAMERA_PARAMS]);
        if !camera.intrinsics.is_valid() || !full.iter().all(|v| v.is_finite()) {
            return Err(CalibrationError::Diverged(format!(
                "non-physical camera estimate {:?}",
                camera.intrinsics
            )));
        }

        let residuals = problem
            .residuals(&x)
            .ok_or_else(|| CalibrationError::Diverged("final estimate is not projectable".into()))?;

        let mut offset = 0;
        let mut reports = Vec::with_capacity(views.len());
        for (v, view) in views.iter().enumerate() {
            let n = view.corr.len();
            let sq = residuals.rows(offset, 2 * n).norm_squared();
            offset += 2 * n;
            let off = CAMERA_PARAMS + POSE_PARAMS * v;
            reports.push(ViewReport {
                image_id: view.image_id.clone(),
                pose: pose_from_params(&full.as_slice()[off..off + POSE_PARAMS]),
                points: n,
                rms_error: (sq / n as f64).sqrt(),
            });
        }
        let total_points: usize = views.iter().map(|v| v.corr.len()).sum();
        let rms_error = (residuals.norm_squared() / total_points as f64).sqrt();
        log::info!("RMS reprojection error: {rms_error:.4} px");

        Ok(IntrinsicResult {
            camera_matrix: camera.intrinsics.k_matrix(),
            distortion: camera.distortion.to_array(),
            rms_error,
            image_size: Some(image_size),
            views: reports,
            excluded_images,
            evaluations: report.evaluations,
        })
    }
}

struct InitialGuess {
    intrinsics: PinholeIntrinsics,
    views: Vec<View>,
    poses: Vec<Pose>,
}

/// Zhang's closed form when it is well posed, else a centred principal point
/// and `f = max(width, height)`. Views whose homography or pose cannot be
/// initialised are moved to `excluded`.
fn initial_guess(
    views: Vec<View>,
    image_size: [u32; 2],
    excluded: &mut Vec<String>,
) -> InitialGuess {
    let mut kept = Vec::with_capacity(views.len());
    let mut homographies = Vec::with_capacity(views.len());
    for view in views {
        match estimate_homography(&view.corr.object_xy(), &view.corr.image) {
            Some(h) => {
                homographies.push(h.h);
                kept.push(view);
            }
            None => {
                log::warn!("{}: degenerate marker layout, excluded", view.image_id);
                excluded.push(view.image_id);
            }
        }
    }

    let (w, h) = (image_size[0] as f64, image_size[1] as f64);
    let fallback = PinholeIntrinsics {
        fx: w.max(h),
        fy: w.max(h),
        cx: 0.5 * w,
        cy: 0.5 * h,
    };
    let intrinsics = zhang_intrinsics(&homographies)
        .filter(|k| {
            let inside = k.cx > 0.0 && k.cx < w && k.cy > 0.0 && k.cy < h;
            let aspect = k.fx / k.fy;
            inside && (0.2..5.0).contains(&aspect)
        })
        .unwrap_or_else(|| {
            log::debug!("closed-form intrinsics unavailable, using image-size guess");
            fallback
        });
    log::debug!("initial intrinsics {intrinsics:?}");

    let k = intrinsics.k_matrix();
    let mut views = Vec::with_capacity(kept.len());
    let mut poses = Vec::with_capacity(kept.len());
    for (view, hmat) in kept.into_iter().zip(&homographies) {
        match pose_from_homography(&k, hmat) {
            Some(pose) => {
                views.push(view);
                poses.push(pose);
            }
            None => {
                log::warn!("{}: pose initialisation failed, excluded", view.image_id);
                excluded.push(view.image_id);
            }
        }
    }

    InitialGuess {
        intrinsics,
        views,
        poses,
    }
}

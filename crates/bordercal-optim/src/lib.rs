//! Calibration solvers for border-only fiducial boards.
//!
//! - [`IntrinsicCalibrator`]: joint Levenberg–Marquardt over the camera
//!   matrix, Brown–Conrady distortion and one pose per view, initialised
//!   with Zhang's method.
//! - [`ExtrinsicEstimator`]: per-image PnP with the intrinsics held fixed.
//!
//! ```
//! use bordercal_core::synthetic::{render_views, tilted_poses};
//! use bordercal_core::{BoardModel, BoardSpec, BrownConrady, CameraModel, PinholeIntrinsics};
//! use bordercal_optim::{ExtrinsicEstimator, IntrinsicCalibrator};
//!
//! let board = BoardModel::new(BoardSpec {
//!     markers_x: 5,
//!     markers_y: 7,
//!     marker_length: 0.04,
//!     marker_separation: 0.01,
//!     dictionary: Default::default(),
//! })?;
//! let camera = CameraModel::new(
//!     PinholeIntrinsics { fx: 800.0, fy: 800.0, cx: 640.0, cy: 480.0 },
//!     BrownConrady::default(),
//! );
//! let views = render_views(&board, &camera, &tilted_poses(&board, 6, 0.35, 0.7));
//!
//! let calib = IntrinsicCalibrator::default().calibrate(&board, views.clone(), [1280, 960])?;
//! assert!(calib.rms_error < 1e-3);
//!
//! let poses = ExtrinsicEstimator::default().estimate_batch(&board, &views, &calib);
//! assert_eq!(poses.len(), 6);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod extrinsics;
mod init;
mod intrinsics;
mod lm;
mod projection;

pub use extrinsics::{EstimatedPose, ExtrinsicEstimator, PoseFailure, PoseOptions, PoseOutcome};
pub use init::{pose_from_homography, zhang_intrinsics};
pub use intrinsics::{
    CalibrationError, DistortionFit, IntrinsicCalibrator, IntrinsicOptions, IntrinsicResult,
    ViewReport,
};
pub use lm::{solve, NllsProblem, SolveReport, SolverOptions, Termination};

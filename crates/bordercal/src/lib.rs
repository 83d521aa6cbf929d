//! Camera calibration against border-only fiducial boards.
//!
//! This crate provides:
//! - re-exports of the board/camera model (`bordercal-core`) and the solvers
//!   (`bordercal-optim`)
//! - the [`detect::MarkerDetector`] boundary and a sidecar-file detector
//! - calibration artifacts ([`io`]) and folder pipelines ([`pipeline`])
//! - the `bordercal` command line tool (feature `cli`)
//!
//! ## Quickstart
//!
//! ```no_run
//! use bordercal::{io, pipeline, BoardModel, BoardSpec, DictionaryId};
//! use bordercal::{IntrinsicOptions, PoseOptions};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let board = BoardModel::new(BoardSpec {
//!     markers_x: 5,
//!     markers_y: 7,
//!     marker_length: 0.04,
//!     marker_separation: 0.01,
//!     dictionary: DictionaryId::Dict6x6_250,
//! })?;
//!
//! let calib = pipeline::calibrate_intrinsics_folder(
//!     &board,
//!     Path::new("calib_images"),
//!     None,
//!     IntrinsicOptions::default(),
//! )?;
//! io::write_intrinsics(&calib, Path::new("intrinsics.json"))?;
//!
//! let poses = pipeline::estimate_extrinsics_folder(
//!     &board,
//!     Path::new("scene_images"),
//!     &calib,
//!     PoseOptions::default(),
//! )?;
//! io::write_batch(&poses, Path::new("poses.json"))?;
//! # Ok(())
//! # }
//! ```
//!
//! ## API map
//! - `bordercal::core`: board model, dictionaries, detections, camera model.
//! - `bordercal::optim`: LM solver, intrinsic calibration, pose estimation.
//! - `bordercal::detect`: detector trait and JSON sidecar reader.
//! - `bordercal::io`: intrinsics and pose artifacts.
//! - `bordercal::pipeline`: end-to-end runs over an image folder.

pub use bordercal_core as core;
pub use bordercal_optim as optim;

pub use bordercal_core::{
    BoardError, BoardModel, BoardSpec, BrownConrady, CameraModel, DetectedMarker, Detection,
    DictionaryId, PinholeIntrinsics, Pose,
};
pub use bordercal_optim::{
    CalibrationError, DistortionFit, EstimatedPose, ExtrinsicEstimator, IntrinsicCalibrator,
    IntrinsicOptions, IntrinsicResult, PoseFailure, PoseOptions, PoseOutcome,
};

pub mod detect;
pub mod io;
pub mod pipeline;

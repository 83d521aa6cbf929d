//! Core types for border-only fiducial board calibration.
//!
//! This crate is purely geometric: the board model, detections and their
//! board correspondences, the camera model and homographies. It does *not*
//! detect markers or read images.

mod board;
mod camera;
mod detection;
mod dictionary;
mod homography;
mod logger;
mod pose;
pub mod synthetic;

pub use board::{BoardError, BoardModel, BoardSpec, Marker};
pub use camera::{
    BrownConrady, CameraModel, DistortionLenError, PinholeIntrinsics, DISTORTION_LEN, MIN_DEPTH,
};
pub use detection::{Correspondences, DetectedMarker, Detection};
pub use dictionary::{DictionaryId, UnknownDictionary};
pub use homography::{estimate_homography, homography_from_4pt, Homography};
pub use pose::Pose;

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::{init_with_level, init_with_verbosity, level_from_verbosity};

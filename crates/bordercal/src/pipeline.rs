//! Folder-level calibration runs: detections from sidecars, then the
//! solvers, then artifacts.

use crate::detect::{detect_folder, DetectError, SidecarDetector};
use crate::io::{IoError, PoseRecord};
use bordercal_core::{BoardModel, Detection};
use bordercal_optim::{
    CalibrationError, ExtrinsicEstimator, IntrinsicCalibrator, IntrinsicOptions, IntrinsicResult,
    PoseOptions,
};
use std::path::{Path, PathBuf};

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Detect(#[from] DetectError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Io(#[from] IoError),

    #[error("no images found in {}", .0.display())]
    NoImages(PathBuf),

    #[error("none of the {images} images has marker detections")]
    NoDetections { images: usize },

    #[error("image size unknown: no detection reports it and none was given")]
    UnknownImageSize,

    #[error("no pose could be estimated in any of the {images} images")]
    NoPoses { images: usize },
}

/// Detections of every image in `dir`, checked against the board dictionary.
pub fn load_detections(board: &BoardModel, dir: &Path) -> Result<Vec<Detection>, PipelineError> {
    let detector = SidecarDetector::new(board.spec().dictionary);
    let detections = detect_folder(&detector, dir)?;
    if detections.is_empty() {
        return Err(PipelineError::NoImages(dir.to_path_buf()));
    }
    Ok(detections)
}

/// Calibrate intrinsics from the images in `dir`.
///
/// The image size is `image_size` when given, else the first size reported
/// by a detection. Views reporting a different size are dropped.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip(board, dir, options), fields(dir = %dir.display()))
)]
pub fn calibrate_intrinsics_folder(
    board: &BoardModel,
    dir: &Path,
    image_size: Option<[u32; 2]>,
    options: IntrinsicOptions,
) -> Result<IntrinsicResult, PipelineError> {
    let detections = load_detections(board, dir)?;
    let images = detections.len();
    if detections.iter().all(Detection::is_empty) {
        return Err(PipelineError::NoDetections { images });
    }

    let size = image_size
        .or_else(|| detections.iter().find_map(|d| d.image_size))
        .ok_or(PipelineError::UnknownImageSize)?;
    let detections: Vec<Detection> = detections
        .into_iter()
        .filter(|d| match d.image_size {
            Some(s) if s != size => {
                log::warn!(
                    "{}: image size {}x{} differs from {}x{}, skipped",
                    d.image_id,
                    s[0],
                    s[1],
                    size[0],
                    size[1]
                );
                false
            }
            _ => true,
        })
        .collect();

    let result = IntrinsicCalibrator::new(options).calibrate(board, detections, size)?;
    Ok(result)
}

/// Estimate the board pose in every image of `dir`; images without a pose
/// are left out of the returned records.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip(board, dir, intrinsics, options), fields(dir = %dir.display()))
)]
pub fn estimate_extrinsics_folder(
    board: &BoardModel,
    dir: &Path,
    intrinsics: &IntrinsicResult,
    options: PoseOptions,
) -> Result<Vec<PoseRecord>, PipelineError> {
    let detections = load_detections(board, dir)?;
    let poses = ExtrinsicEstimator::new(options).estimate_batch(board, &detections, intrinsics);
    if poses.is_empty() {
        return Err(PipelineError::NoPoses {
            images: detections.len(),
        });
    }
    Ok(poses.iter().map(PoseRecord::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{sidecar_path, Sidecar};
    use bordercal_core::synthetic::{render_views, tilted_poses};
    use bordercal_core::{BoardSpec, BrownConrady, CameraModel, DictionaryId, PinholeIntrinsics};
    use std::fs;
    use tempfile::tempdir;

    fn board() -> BoardModel {
        BoardModel::new(BoardSpec {
            markers_x: 5,
            markers_y: 7,
            marker_length: 0.04,
            marker_separation: 0.01,
            dictionary: DictionaryId::Dict6x6_250,
        })
        .unwrap()
    }

    fn write_views(dir: &Path, board: &BoardModel, views: &[Detection]) {
        for (i, view) in views.iter().enumerate() {
            let image = dir.join(format!("img_{i:02}.png"));
            fs::write(&image, b"").unwrap();
            let mut view = view.clone();
            view.image_size = Some([1280, 960]);
            let sidecar = Sidecar::from_detection(&view, board.spec().dictionary);
            fs::write(sidecar_path(&image), serde_json::to_string(&sidecar).unwrap()).unwrap();
        }
    }

    #[test]
    fn folder_runs_both_stages() {
        let board = board();
        let camera = CameraModel::new(
            PinholeIntrinsics {
                fx: 800.0,
                fy: 800.0,
                cx: 640.0,
                cy: 480.0,
            },
            BrownConrady::default(),
        );
        let mut views = render_views(&board, &camera, &tilted_poses(&board, 8, 0.35, 0.7));
        views[2].markers.clear();
        let dir = tempdir().unwrap();
        write_views(dir.path(), &board, &views);

        let calib =
            calibrate_intrinsics_folder(&board, dir.path(), None, IntrinsicOptions::default())
                .unwrap();
        assert_eq!(calib.image_size, Some([1280, 960]));
        assert_eq!(calib.views.len(), 7);

        let records =
            estimate_extrinsics_folder(&board, dir.path(), &calib, PoseOptions::default()).unwrap();
        assert_eq!(records.len(), 7);
        assert!(records.iter().all(|r| r.image != "img_02.png"));
        assert_eq!(records[0].image, "img_00.png");
    }

    #[test]
    fn folder_without_detections_fails() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.png"), b"").unwrap();
        let err = calibrate_intrinsics_folder(
            &board(),
            dir.path(),
            Some([640, 480]),
            IntrinsicOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::NoDetections { images: 1 }));
    }

    #[test]
    fn empty_folder_fails() {
        let dir = tempdir().unwrap();
        let err = estimate_extrinsics_folder(
            &board(),
            dir.path(),
            &IntrinsicResult::from_camera(
                &CameraModel::new(
                    PinholeIntrinsics {
                        fx: 1.0,
                        fy: 1.0,
                        cx: 0.0,
                        cy: 0.0,
                    },
                    BrownConrady::default(),
                ),
                0.0,
                None,
            ),
            PoseOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::NoImages(_)));
    }
}

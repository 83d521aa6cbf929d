//! Marker detection boundary.
//!
//! Pixel-level marker detection lives outside this workspace. A detector is
//! anything implementing [`MarkerDetector`]; the bundled [`SidecarDetector`]
//! reads the JSON an external detector wrote next to each image.

use bordercal_core::{DetectedMarker, Detection, DictionaryId};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// File extensions treated as images when scanning a folder.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// Errors produced while obtaining detections.
#[derive(thiserror::Error, Debug)]
pub enum DetectError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed detection file {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("{} was detected with {found}, board uses {expected}", path.display())]
    DictionaryMismatch {
        path: PathBuf,
        expected: DictionaryId,
        found: DictionaryId,
    },
}

/// Produces the marker detections of one input (usually an image).
///
/// Finding no marker is a valid, non-error outcome: return an empty
/// [`Detection`].
pub trait MarkerDetector {
    type Input: ?Sized;

    fn detect(&self, input: &Self::Input) -> Result<Detection, DetectError>;
}

/// On-disk form of one detected marker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SidecarMarker {
    pub id: u32,
    /// `[x, y]` pixels, TL, TR, BR, BL.
    pub corners: [[f64; 2]; 4],
}

/// Detection sidecar written by an external detector for one image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sidecar {
    /// File name of the image the detections belong to.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub image_size: Option<[u32; 2]>,
    #[serde(default)]
    pub dictionary: Option<DictionaryId>,
    #[serde(default)]
    pub markers: Vec<SidecarMarker>,
}

impl Sidecar {
    pub fn from_detection(detection: &Detection, dictionary: DictionaryId) -> Self {
        Self {
            image: Some(detection.image_id.clone()),
            image_size: detection.image_size,
            dictionary: Some(dictionary),
            markers: detection
                .markers
                .iter()
                .map(|m| SidecarMarker {
                    id: m.id,
                    corners: m.corners.map(|c| [c.x, c.y]),
                })
                .collect(),
        }
    }

    fn into_detection(self, image_id: String) -> Detection {
        Detection {
            image_id,
            image_size: self.image_size,
            markers: self
                .markers
                .into_iter()
                .map(|m| DetectedMarker {
                    id: m.id,
                    corners: m.corners.map(|[x, y]| Point2::new(x, y)),
                })
                .collect(),
        }
    }
}

/// Sidecar path of an image: `board_01.png` → `board_01.json`.
pub fn sidecar_path(image: &Path) -> PathBuf {
    image.with_extension("json")
}

/// Reads detections from per-image JSON sidecars.
#[derive(Clone, Copy, Debug)]
pub struct SidecarDetector {
    dictionary: DictionaryId,
}

impl SidecarDetector {
    pub fn new(dictionary: DictionaryId) -> Self {
        Self { dictionary }
    }

    pub fn dictionary(&self) -> DictionaryId {
        self.dictionary
    }
}

impl MarkerDetector for SidecarDetector {
    type Input = Path;

    /// A missing sidecar means the detector found nothing in that image.
    fn detect(&self, image: &Path) -> Result<Detection, DetectError> {
        let image_id = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| image.display().to_string());
        let path = sidecar_path(image);
        if !path.exists() {
            log::warn!("{image_id}: no detection sidecar, treating as empty");
            return Ok(Detection::new(image_id, Vec::new()));
        }

        let text = fs::read_to_string(&path).map_err(|source| DetectError::Io {
            path: path.clone(),
            source,
        })?;
        let sidecar: Sidecar = serde_json::from_str(&text).map_err(|source| DetectError::Json {
            path: path.clone(),
            source,
        })?;
        if let Some(found) = sidecar.dictionary {
            if found != self.dictionary {
                return Err(DetectError::DictionaryMismatch {
                    path,
                    expected: self.dictionary,
                    found,
                });
            }
        }

        if let Some(recorded) = sidecar.image.as_deref() {
            if recorded != image_id {
                log::warn!(
                    "{image_id}: sidecar {} was written for `{recorded}`",
                    path.display()
                );
            }
        }

        let detection = sidecar.into_detection(image_id);
        log::debug!("{}: {} markers", detection.image_id, detection.markers.len());
        Ok(detection)
    }
}

/// Image files directly inside `dir`, sorted by file name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, DetectError> {
    let io_err = |source: std::io::Error| DetectError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut images = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)));
        if is_image && path.is_file() {
            images.push(path);
        }
    }
    images.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(images)
}

/// Run `detector` over every image in `dir`, in file-name order.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip(detector, dir), fields(dir = %dir.display()))
)]
pub fn detect_folder<D>(detector: &D, dir: &Path) -> Result<Vec<Detection>, DetectError>
where
    D: MarkerDetector<Input = Path>,
{
    list_images(dir)?
        .iter()
        .map(|image| detector.detect(image))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_sidecar(dir: &Path, image: &str, sidecar: &str) {
        fs::write(dir.join(image), b"").unwrap();
        fs::write(sidecar_path(&dir.join(image)), sidecar).unwrap();
    }

    #[test]
    fn reads_sidecar_markers() {
        let dir = tempdir().unwrap();
        write_sidecar(
            dir.path(),
            "a.png",
            r#"{"image": "a.png", "image_size": [640, 480], "dictionary": "DICT_6X6_250",
                "markers": [{"id": 3, "corners": [[1, 2], [3, 2], [3, 4], [1, 4]]}]}"#,
        );

        let det = SidecarDetector::new(DictionaryId::Dict6x6_250)
            .detect(&dir.path().join("a.png"))
            .unwrap();
        assert_eq!(det.image_id, "a.png");
        assert_eq!(det.image_size, Some([640, 480]));
        assert_eq!(det.markers.len(), 1);
        assert_eq!(det.markers[0].id, 3);
        assert_eq!(det.markers[0].corners[2], Point2::new(3.0, 4.0));
    }

    #[test]
    fn detection_is_named_after_the_image_file() {
        let dir = tempdir().unwrap();
        write_sidecar(
            dir.path(),
            "renamed.png",
            r#"{"image": "original.png", "markers": []}"#,
        );
        let det = SidecarDetector::new(DictionaryId::default())
            .detect(&dir.path().join("renamed.png"))
            .unwrap();
        assert_eq!(det.image_id, "renamed.png");
    }

    #[test]
    fn missing_sidecar_is_an_empty_detection() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.jpg"), b"").unwrap();
        let det = SidecarDetector::new(DictionaryId::default())
            .detect(&dir.path().join("b.jpg"))
            .unwrap();
        assert!(det.is_empty());
    }

    #[test]
    fn dictionary_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        write_sidecar(
            dir.path(),
            "c.png",
            r#"{"dictionary": "DICT_4X4_50", "markers": []}"#,
        );
        let err = SidecarDetector::new(DictionaryId::Dict6x6_250)
            .detect(&dir.path().join("c.png"))
            .unwrap_err();
        assert!(matches!(err, DetectError::DictionaryMismatch { .. }));
    }

    #[test]
    fn folder_scan_is_sorted_and_skips_non_images() {
        let dir = tempdir().unwrap();
        for name in ["img_10.png", "img_02.PNG", "notes.txt", "img_01.jpg"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let names: Vec<_> = list_images(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["img_01.jpg", "img_02.PNG", "img_10.png"]);

        let detections =
            detect_folder(&SidecarDetector::new(DictionaryId::default()), dir.path()).unwrap();
        assert_eq!(detections.len(), 3);
        assert!(detections.iter().all(Detection::is_empty));
    }
}

//! Calibration artifacts: the intrinsics JSON, per-image pose text files and
//! the batch pose JSON.

use bordercal_core::{BrownConrady, CameraModel, PinholeIntrinsics, Pose};
use bordercal_optim::{EstimatedPose, IntrinsicResult};
use nalgebra::{DMatrix, Matrix3, Matrix4, Rotation3, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Tolerance on `RᵀR = I` when reading a rotation back.
const ORTHONORMAL_TOL: f64 = 1e-6;

/// A pose or record that does not have the shape of a rigid transform.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FormatError {
    #[error("bottom row must be [0, 0, 0, 1], got {0:?}")]
    BottomRow([f64; 4]),
    #[error("rotation must be 3x3, got {rows}x{cols}")]
    RotationShape { rows: usize, cols: usize },
    #[error("rotation is not orthonormal with det +1")]
    NotRotation,
    #[error("translation must have 3 components, got {0}")]
    TranslationLength(usize),
    #[error("rvec must have 3 components, got {0}")]
    RvecLength(usize),
    #[error("extrinsic must be 3x4 or 4x4")]
    ExtrinsicShape,
    #[error("pose contains non-finite values")]
    NonFinite,
    #[error("distortion must have 4 or 5 coefficients, got {0}")]
    DistortionLength(usize),
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
}

#[derive(thiserror::Error, Debug)]
pub enum IoError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{}: {source}", path.display())]
    Format { path: PathBuf, source: FormatError },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> IoError + '_ {
    move |source| IoError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn json_error(path: &Path) -> impl FnOnce(serde_json::Error) -> IoError + '_ {
    move |source| IoError::Json {
        path: path.to_path_buf(),
        source,
    }
}

/// Write through a sibling temp file so readers never see a partial file.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), IoError> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    let result = fs::write(&tmp, contents)
        .map_err(io_error(&tmp))
        .and_then(|()| fs::rename(&tmp, path).map_err(io_error(path)));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

// ---------------------------------------------------------------------------
// Intrinsics
// ---------------------------------------------------------------------------

/// On-disk intrinsics: `{"K": [[..]; 3], "dist": [k1, k2, p1, p2, k3], "rms", "image_size"}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicsArtifact {
    #[serde(rename = "K")]
    pub k: [[f64; 3]; 3],
    pub dist: Vec<f64>,
    pub rms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_size: Option<[u32; 2]>,
}

impl From<&IntrinsicResult> for IntrinsicsArtifact {
    fn from(result: &IntrinsicResult) -> Self {
        let m = &result.camera_matrix;
        Self {
            k: [0, 1, 2].map(|r| [m[(r, 0)], m[(r, 1)], m[(r, 2)]]),
            dist: result.distortion.to_vec(),
            rms: result.rms_error,
            image_size: result.image_size,
        }
    }
}

impl IntrinsicsArtifact {
    pub fn to_result(&self) -> Result<IntrinsicResult, FormatError> {
        let k = Matrix3::from_fn(|r, c| self.k[r][c]);
        if !k.iter().all(|v| v.is_finite()) {
            return Err(FormatError::NonFinite);
        }
        let distortion = BrownConrady::from_slice(&self.dist)
            .map_err(|e| FormatError::DistortionLength(e.0))?;
        let camera = CameraModel::new(PinholeIntrinsics::from_k_matrix(&k), distortion);
        Ok(IntrinsicResult::from_camera(&camera, self.rms, self.image_size))
    }
}

pub fn write_intrinsics(result: &IntrinsicResult, path: &Path) -> Result<(), IoError> {
    let json = serde_json::to_string_pretty(&IntrinsicsArtifact::from(result))
        .map_err(json_error(path))?;
    write_atomic(path, json.as_bytes())
}

pub fn read_intrinsics(path: &Path) -> Result<IntrinsicResult, IoError> {
    let text = fs::read_to_string(path).map_err(io_error(path))?;
    let artifact: IntrinsicsArtifact = serde_json::from_str(&text).map_err(json_error(path))?;
    artifact.to_result().map_err(|source| IoError::Format {
        path: path.to_path_buf(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Single pose (4x4 text)
// ---------------------------------------------------------------------------

/// Check that `m` is `[R | t; 0 0 0 1]` with finite entries.
pub fn validate_pose_matrix(m: &Matrix4<f64>) -> Result<(), FormatError> {
    let bottom = [m[(3, 0)], m[(3, 1)], m[(3, 2)], m[(3, 3)]];
    if bottom != [0.0, 0.0, 0.0, 1.0] {
        return Err(FormatError::BottomRow(bottom));
    }
    if !m.iter().all(|v| v.is_finite()) {
        return Err(FormatError::NonFinite);
    }
    Ok(())
}

/// Assemble a homogeneous pose from a dynamically sized rotation and
/// translation, checking their shapes.
pub fn compose_pose_matrix(
    rotation: &DMatrix<f64>,
    translation: &[f64],
) -> Result<Matrix4<f64>, FormatError> {
    if rotation.shape() != (3, 3) {
        return Err(FormatError::RotationShape {
            rows: rotation.nrows(),
            cols: rotation.ncols(),
        });
    }
    if translation.len() != 3 {
        return Err(FormatError::TranslationLength(translation.len()));
    }
    let mut m = Matrix4::identity();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation);
    m.fixed_view_mut::<3, 1>(0, 3).copy_from_slice(translation);
    validate_pose_matrix(&m)?;
    Ok(m)
}

/// Split a validated homogeneous matrix into a [`Pose`].
pub fn pose_from_matrix(m: &Matrix4<f64>) -> Result<Pose, FormatError> {
    validate_pose_matrix(m)?;
    let r: Matrix3<f64> = m.fixed_view::<3, 3>(0, 0).into_owned();
    let orthonormal = (r.transpose() * r - Matrix3::identity()).amax() <= ORTHONORMAL_TOL;
    if !orthonormal || r.determinant() <= 0.0 {
        return Err(FormatError::NotRotation);
    }
    let t = Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]);
    Ok(Pose::new(Rotation3::from_matrix_unchecked(r), t))
}

/// Write a 4x4 pose as four lines of space-separated `{:.17e}` values.
pub fn write_single(m: &Matrix4<f64>, path: &Path) -> Result<(), IoError> {
    validate_pose_matrix(m).map_err(|source| IoError::Format {
        path: path.to_path_buf(),
        source,
    })?;
    let mut text = String::with_capacity(4 * 4 * 26);
    for r in 0..4 {
        let row: Vec<String> = (0..4).map(|c| format!("{:.17e}", m[(r, c)])).collect();
        text.push_str(&row.join(" "));
        text.push('\n');
    }
    write_atomic(path, text.as_bytes())
}

pub fn write_pose(pose: &Pose, path: &Path) -> Result<(), IoError> {
    write_single(&pose.homogeneous(), path)
}

/// Parse a file written by [`write_single`].
pub fn read_single(path: &Path) -> Result<Pose, IoError> {
    let text = fs::read_to_string(path).map_err(io_error(path))?;
    let format_err = |source: FormatError| IoError::Format {
        path: path.to_path_buf(),
        source,
    };
    let m = parse_matrix4(&text).map_err(format_err)?;
    pose_from_matrix(&m).map_err(format_err)
}

fn parse_matrix4(text: &str) -> Result<Matrix4<f64>, FormatError> {
    let rows: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if rows.len() != 4 {
        return Err(FormatError::Parse {
            line: rows.len().min(4) + 1,
            message: format!("expected 4 rows, found {}", rows.len()),
        });
    }
    let mut m = Matrix4::zeros();
    for (r, line) in rows.iter().enumerate() {
        let values = line
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| FormatError::Parse {
                line: r + 1,
                message: e.to_string(),
            })?;
        if values.len() != 4 {
            return Err(FormatError::Parse {
                line: r + 1,
                message: format!("expected 4 values, found {}", values.len()),
            });
        }
        for (c, v) in values.into_iter().enumerate() {
            m[(r, c)] = v;
        }
    }
    Ok(m)
}

// ---------------------------------------------------------------------------
// Batch (JSON)
// ---------------------------------------------------------------------------

/// One image's pose in the batch artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoseRecord {
    pub image: String,
    /// Axis-angle rotation.
    pub rvec: Vec<f64>,
    pub tvec: Vec<f64>,
    /// `[R | t]` rows (a 4x4 with the homogeneous row is also accepted).
    pub extrinsic: Vec<Vec<f64>>,
}

impl From<&EstimatedPose> for PoseRecord {
    fn from(p: &EstimatedPose) -> Self {
        let e = p.pose.extrinsic();
        Self {
            image: p.image_id.clone(),
            rvec: p.pose.rvec().as_slice().to_vec(),
            tvec: p.pose.translation.as_slice().to_vec(),
            extrinsic: (0..3).map(|r| (0..4).map(|c| e[(r, c)]).collect()).collect(),
        }
    }
}

impl PoseRecord {
    /// Homogeneous matrix of the record, after shape checks.
    pub fn to_matrix(&self) -> Result<Matrix4<f64>, FormatError> {
        if self.rvec.len() != 3 {
            return Err(FormatError::RvecLength(self.rvec.len()));
        }
        if self.tvec.len() != 3 {
            return Err(FormatError::TranslationLength(self.tvec.len()));
        }
        let rows = self.extrinsic.len();
        if !(rows == 3 || rows == 4) || self.extrinsic.iter().any(|row| row.len() != 4) {
            return Err(FormatError::ExtrinsicShape);
        }
        let mut m = Matrix4::identity();
        for (r, row) in self.extrinsic.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                m[(r, c)] = *v;
            }
        }
        validate_pose_matrix(&m)?;
        Ok(m)
    }

    pub fn to_pose(&self) -> Result<Pose, FormatError> {
        pose_from_matrix(&self.to_matrix()?)
    }
}

/// A batch record left out of an artifact because it failed validation.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("record {index} ({image}): {source}")]
pub struct RejectedRecord {
    pub index: usize,
    pub image: String,
    pub source: FormatError,
}

/// Split `records` into the valid ones and the rejected ones, logging each
/// rejection.
fn partition_records(records: &[PoseRecord]) -> (Vec<&PoseRecord>, Vec<RejectedRecord>) {
    let mut valid = Vec::with_capacity(records.len());
    let mut rejected = Vec::new();
    for (index, record) in records.iter().enumerate() {
        match record.to_pose() {
            Ok(_) => valid.push(record),
            Err(source) => {
                let reject = RejectedRecord {
                    index,
                    image: record.image.clone(),
                    source,
                };
                log::warn!("{reject}; skipped");
                rejected.push(reject);
            }
        }
    }
    (valid, rejected)
}

/// Write the valid records as one JSON array, in order. Invalid records are
/// left out and returned.
pub fn write_batch(records: &[PoseRecord], path: &Path) -> Result<Vec<RejectedRecord>, IoError> {
    let (valid, rejected) = partition_records(records);
    let json = serde_json::to_string_pretty(&valid).map_err(json_error(path))?;
    write_atomic(path, json.as_bytes())?;
    log::info!("wrote {} poses to {}", valid.len(), path.display());
    Ok(rejected)
}

/// Read a batch artifact. Records that fail validation are dropped with a
/// warning.
pub fn read_batch(path: &Path) -> Result<Vec<PoseRecord>, IoError> {
    let text = fs::read_to_string(path).map_err(io_error(path))?;
    let records: Vec<PoseRecord> = serde_json::from_str(&text).map_err(json_error(path))?;
    let (valid, _) = partition_records(&records);
    Ok(valid.into_iter().cloned().collect())
}

/// Write one `<image stem>.txt` per valid record into `dir`.
pub fn export_batch_to_dir(records: &[PoseRecord], dir: &Path) -> Result<Vec<PathBuf>, IoError> {
    let (valid, _) = partition_records(records);
    fs::create_dir_all(dir).map_err(io_error(dir))?;
    let mut written = Vec::with_capacity(valid.len());
    for (index, record) in valid.into_iter().enumerate() {
        let stem = Path::new(&record.image)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("pose_{index:04}"));
        let path = dir.join(format!("{stem}.txt"));
        let pose = record.to_pose().map_err(|source| IoError::Format {
            path: path.clone(),
            source,
        })?;
        write_pose(&pose, &path)?;
        written.push(path);
    }
    log::info!("exported {} poses to {}", written.len(), dir.display());
    Ok(written)
}

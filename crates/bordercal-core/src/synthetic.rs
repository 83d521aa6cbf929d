//! Synthetic board views for tests, benchmarks and examples.
//!
//! Views are rendered by projecting every board corner through a known
//! camera; no noise is added unless the caller perturbs the output.

use crate::{BoardModel, CameraModel, DetectedMarker, Detection, Pose};
use nalgebra::{Point2, Point3, Rotation3, Unit, Vector3};

/// Deterministic set of tilted poses looking at the board centre.
///
/// View `i` tilts the board by `tilt_rad` about an in-plane axis that turns
/// by `2π / n_views` per view, and places the board centre at depth
/// `distance` (±10% alternating).
pub fn tilted_poses(board: &BoardModel, n_views: usize, tilt_rad: f64, distance: f64) -> Vec<Pose> {
    let centre = Point3::new(board.width() * 0.5, board.height() * 0.5, 0.0);
    (0..n_views)
        .map(|i| {
            let a = std::f64::consts::TAU * i as f64 / n_views.max(1) as f64;
            let axis = Unit::new_normalize(Vector3::new(a.cos(), a.sin(), 0.0));
            let tilt = Rotation3::from_axis_angle(&axis, tilt_rad);
            let roll = Rotation3::from_axis_angle(&Vector3::z_axis(), 0.1 * a.sin());
            let rotation = tilt * roll;

            let depth = distance * if i % 2 == 0 { 1.0 } else { 1.1 };
            let target = Vector3::new(0.02 * a.cos(), 0.015 * a.sin(), depth);
            let translation = target - rotation * centre.coords;
            Pose::new(rotation, translation)
        })
        .collect()
}

/// Project every marker of the board. Returns `None` when any corner falls
/// behind the camera.
pub fn render_detection(
    board: &BoardModel,
    camera: &CameraModel,
    pose: &Pose,
    image_id: impl Into<String>,
) -> Option<Detection> {
    let markers = board
        .markers()
        .iter()
        .map(|m| {
            let mut corners = [Point2::origin(); 4];
            for (dst, src) in corners.iter_mut().zip(m.corners.iter()) {
                *dst = camera.project(&pose.transform_point(src))?;
            }
            Some(DetectedMarker { id: m.id, corners })
        })
        .collect::<Option<Vec<_>>>()?;
    Some(Detection::new(image_id, markers))
}

/// Render one detection per pose, named `view_000`, `view_001`, ...
pub fn render_views(board: &BoardModel, camera: &CameraModel, poses: &[Pose]) -> Vec<Detection> {
    poses
        .iter()
        .enumerate()
        .filter_map(|(i, pose)| render_detection(board, camera, pose, format!("view_{i:03}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BoardSpec, BrownConrady, DictionaryId, PinholeIntrinsics};

    #[test]
    fn rendered_views_keep_every_marker() {
        let board = BoardModel::new(BoardSpec {
            markers_x: 5,
            markers_y: 7,
            marker_length: 0.04,
            marker_separation: 0.01,
            dictionary: DictionaryId::Dict6x6_250,
        })
        .unwrap();
        let camera = CameraModel::new(
            PinholeIntrinsics {
                fx: 800.0,
                fy: 800.0,
                cx: 640.0,
                cy: 480.0,
            },
            BrownConrady::default(),
        );
        let poses = tilted_poses(&board, 6, 0.3, 0.7);
        let views = render_views(&board, &camera, &poses);
        assert_eq!(views.len(), 6);
        for v in &views {
            assert_eq!(v.markers.len(), 20);
            for m in &v.markers {
                for c in &m.corners {
                    assert!(c.x > 0.0 && c.x < 1280.0 && c.y > 0.0 && c.y < 960.0);
                }
            }
        }
    }
}

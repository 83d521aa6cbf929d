use bordercal_core::synthetic::{render_views, tilted_poses};
use bordercal_core::{
    BoardModel, BoardSpec, BrownConrady, CameraModel, Detection, DictionaryId, PinholeIntrinsics,
};
use bordercal_optim::{ExtrinsicEstimator, IntrinsicCalibrator, IntrinsicOptions, PoseOutcome};
use nalgebra::Point2;

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

fn camera() -> CameraModel {
    CameraModel::new(
        PinholeIntrinsics {
            fx: 850.0,
            fy: 845.0,
            cx: 645.0,
            cy: 475.0,
        },
        BrownConrady {
            k1: -0.08,
            k2: 0.01,
            ..BrownConrady::default()
        },
    )
}

/// Deterministic sub-pixel jitter in `[-amp, amp]`.
fn jitter(views: &mut [Detection], amp: f64) {
    let mut state = 0x2545_f491_4f6c_dd1d_u64;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state as f64 / u64::MAX as f64) * 2.0 - 1.0
    };
    for view in views {
        for marker in &mut view.markers {
            for c in &mut marker.corners {
                *c = Point2::new(c.x + amp * next(), c.y + amp * next());
            }
        }
    }
}

#[test]
fn ten_images_one_empty_gives_nine_views_and_nine_poses() {
    let board = board();
    let cam = camera();
    let mut views = render_views(&board, &cam, &tilted_poses(&board, 10, 0.4, 0.7));
    assert_eq!(views.len(), 10);
    views[6].markers.clear();

    let calib = IntrinsicCalibrator::new(IntrinsicOptions::default())
        .calibrate(&board, views.clone(), [1280, 960])
        .expect("calibration");
    assert_eq!(calib.views.len(), 9);
    assert_eq!(calib.excluded_images, ["view_006"]);
    assert!(calib.rms_error < 1e-3, "rms {}", calib.rms_error);

    let k = calib.camera().intrinsics;
    assert!((k.fx - 850.0).abs() < 1.0, "fx {}", k.fx);
    assert!((k.fy - 845.0).abs() < 1.0, "fy {}", k.fy);

    let estimator = ExtrinsicEstimator::default();
    assert_eq!(
        estimator.estimate_pose(&board, &views[6], &calib),
        PoseOutcome::NoDetections
    );

    let poses = estimator.estimate_batch(&board, &views, &calib);
    assert_eq!(poses.len(), 9);
    assert!(poses.iter().all(|p| p.image_id != "view_006"));
    for p in &poses {
        let r = p.pose.rotation_matrix();
        assert!((r.determinant() - 1.0).abs() < 1e-9);
        assert!((r.transpose() * r - nalgebra::Matrix3::identity()).norm() < 1e-9);
        assert!(p.pose.translation.z > 0.0);
    }
}

#[test]
fn noisy_corners_give_subpixel_rms() {
    let board = board();
    let cam = camera();
    let mut views = render_views(&board, &cam, &tilted_poses(&board, 8, 0.4, 0.7));
    jitter(&mut views, 0.2);

    let calib = IntrinsicCalibrator::default()
        .calibrate(&board, views, [1280, 960])
        .expect("calibration");
    assert!(calib.rms_error > 0.0 && calib.rms_error < 0.3, "rms {}", calib.rms_error);
    let k = calib.camera().intrinsics;
    assert!((k.fx - 850.0).abs() / 850.0 < 0.02, "fx {}", k.fx);
    assert!((k.cx - 645.0).abs() < 15.0, "cx {}", k.cx);
}

#[test]
fn calibration_is_deterministic() {
    let board = board();
    let views = render_views(&board, &camera(), &tilted_poses(&board, 6, 0.35, 0.7));
    let a = IntrinsicCalibrator::default()
        .calibrate(&board, views.clone(), [1280, 960])
        .unwrap();
    let b = IntrinsicCalibrator::default()
        .calibrate(&board, views, [1280, 960])
        .unwrap();
    assert_eq!(a.camera_matrix, b.camera_matrix);
    assert_eq!(a.distortion, b.distortion);
}

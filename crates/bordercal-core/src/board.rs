//! Border-only marker board specification and layout.

use crate::detection::{Correspondences, Detection};
use crate::DictionaryId;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};

/// Static board specification.
///
/// `markers_x`/`markers_y` count marker *slots* of the full grid; only the
/// slots on the outer ring carry a marker. Lengths are in the user's unit
/// (typically meters) and define the unit of every estimated translation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoardSpec {
    pub markers_x: u32,
    pub markers_y: u32,
    pub marker_length: f64,
    pub marker_separation: f64,
    #[serde(default)]
    pub dictionary: DictionaryId,
}

/// Board specification validation errors.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BoardError {
    #[error("markers_x and markers_y must be >= 2 (got {markers_x}x{markers_y})")]
    InvalidGrid { markers_x: u32, markers_y: u32 },
    #[error("marker_length must be finite and > 0 (got {0})")]
    InvalidMarkerLength(f64),
    #[error("marker_separation must be finite and >= 0 (got {0})")]
    InvalidSeparation(f64),
    #[error("board needs {needed} markers, {dictionary} has {available}")]
    NotEnoughDictionaryCodes {
        dictionary: DictionaryId,
        needed: usize,
        available: usize,
    },
}

/// One physical marker on the board.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub id: u32,
    /// Grid slot `[col, row]` of the marker.
    pub cell: [u32; 2],
    /// Corners in the board frame (TL, TR, BR, BL), `z = 0`.
    ///
    /// The order matches the pixel-corner order reported by the detector.
    pub corners: [Point3<f64>; 4],
}

/// Validated, immutable board layout.
///
/// Board frame: origin at the top-left corner of marker 0, x to the right,
/// y downwards, z into the board.
#[derive(Clone, Debug)]
pub struct BoardModel {
    spec: BoardSpec,
    markers: Vec<Marker>,
}

impl BoardModel {
    /// Validate a spec and lay out its border markers.
    pub fn new(spec: BoardSpec) -> Result<Self, BoardError> {
        if spec.markers_x < 2 || spec.markers_y < 2 {
            return Err(BoardError::InvalidGrid {
                markers_x: spec.markers_x,
                markers_y: spec.markers_y,
            });
        }
        if !spec.marker_length.is_finite() || spec.marker_length <= 0.0 {
            return Err(BoardError::InvalidMarkerLength(spec.marker_length));
        }
        if !spec.marker_separation.is_finite() || spec.marker_separation < 0.0 {
            return Err(BoardError::InvalidSeparation(spec.marker_separation));
        }

        let cells = border_cells(spec.markers_x, spec.markers_y);
        let available = spec.dictionary.code_count();
        if available < cells.len() {
            return Err(BoardError::NotEnoughDictionaryCodes {
                dictionary: spec.dictionary,
                needed: cells.len(),
                available,
            });
        }

        let pitch = spec.marker_length + spec.marker_separation;
        let len = spec.marker_length;
        let markers = cells
            .into_iter()
            .zip(0u32..)
            .map(|([col, row], id)| {
                let x = col as f64 * pitch;
                let y = row as f64 * pitch;
                Marker {
                    id,
                    cell: [col, row],
                    corners: [
                        Point3::new(x, y, 0.0),
                        Point3::new(x + len, y, 0.0),
                        Point3::new(x + len, y + len, 0.0),
                        Point3::new(x, y + len, 0.0),
                    ],
                }
            })
            .collect();

        Ok(Self { spec, markers })
    }

    /// Return the underlying board specification.
    #[inline]
    pub fn spec(&self) -> BoardSpec {
        self.spec
    }

    /// All markers, ordered by id.
    #[inline]
    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    /// Number of markers on the board.
    #[inline]
    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }

    /// Marker with the given id, if it belongs to the board.
    #[inline]
    pub fn marker(&self, id: u32) -> Option<&Marker> {
        // ids are dense and equal to the index
        self.markers.get(id as usize)
    }

    /// Board-frame corners (TL, TR, BR, BL) of a marker.
    pub fn object_corners(&self, id: u32) -> Option<[Point3<f64>; 4]> {
        self.marker(id).map(|m| m.corners)
    }

    /// Grid slot `[col, row]` of a marker.
    ///
    /// Printers must place marker `id` at this slot for detected ids to map
    /// onto the geometry used by the calibrators.
    pub fn grid_cell(&self, id: u32) -> Option<[u32; 2]> {
        self.marker(id).map(|m| m.cell)
    }

    /// Physical width of the marker grid (x extent).
    pub fn width(&self) -> f64 {
        extent(self.spec.markers_x, &self.spec)
    }

    /// Physical height of the marker grid (y extent).
    pub fn height(&self) -> f64 {
        extent(self.spec.markers_y, &self.spec)
    }

    /// Pair every detected marker corner with its board-frame point.
    ///
    /// Ids that are not on the board are reported in
    /// [`Correspondences::unknown_ids`] and logged; repeated ids keep the
    /// first occurrence.
    pub fn correspondences(&self, detection: &Detection) -> Correspondences {
        let mut out = Correspondences::default();
        let mut seen = vec![false; self.markers.len()];

        for det in &detection.markers {
            let Some(marker) = self.marker(det.id) else {
                log::warn!(
                    "{}: marker id {} is not part of the board, dropped",
                    detection.image_id,
                    det.id
                );
                out.unknown_ids.push(det.id);
                continue;
            };
            let slot = &mut seen[det.id as usize];
            if *slot {
                log::warn!(
                    "{}: marker id {} detected twice, keeping the first",
                    detection.image_id,
                    det.id
                );
                continue;
            }
            *slot = true;

            out.marker_ids.push(det.id);
            out.object.extend_from_slice(&marker.corners);
            out.image.extend_from_slice(&det.corners);
        }
        out
    }
}

fn extent(count: u32, spec: &BoardSpec) -> f64 {
    count as f64 * spec.marker_length + (count.saturating_sub(1)) as f64 * spec.marker_separation
}

/// Row-major raster of the outer ring of a `markers_x × markers_y` grid.
fn border_cells(markers_x: u32, markers_y: u32) -> Vec<[u32; 2]> {
    let mut out = Vec::new();
    for row in 0..markers_y {
        for col in 0..markers_x {
            let on_border = row == 0 || row + 1 == markers_y || col == 0 || col + 1 == markers_x;
            if on_border {
                out.push([col, row]);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::DetectedMarker;
    use nalgebra::Point2;

    fn spec(markers_x: u32, markers_y: u32) -> BoardSpec {
        BoardSpec {
            markers_x,
            markers_y,
            marker_length: 0.04,
            marker_separation: 0.01,
            dictionary: DictionaryId::Dict6x6_250,
        }
    }

    #[test]
    fn five_by_seven_has_twenty_border_markers_in_raster_order() {
        let board = BoardModel::new(spec(5, 7)).expect("board");
        assert_eq!(board.marker_count(), 2 * 5 + 2 * (7 - 2));

        let ids: Vec<u32> = board.markers().iter().map(|m| m.id).collect();
        assert_eq!(ids, (0..20).collect::<Vec<_>>());

        // top row, then the two side slots of each middle row, then bottom row
        assert_eq!(board.grid_cell(0), Some([0, 0]));
        assert_eq!(board.grid_cell(4), Some([4, 0]));
        assert_eq!(board.grid_cell(5), Some([0, 1]));
        assert_eq!(board.grid_cell(6), Some([4, 1]));
        assert_eq!(board.grid_cell(14), Some([4, 5]));
        assert_eq!(board.grid_cell(15), Some([0, 6]));
        assert_eq!(board.grid_cell(19), Some([4, 6]));
        assert!(board.marker(20).is_none());
    }

    #[test]
    fn corners_follow_grid_pitch_and_tl_tr_br_bl_order() {
        let board = BoardModel::new(spec(5, 7)).expect("board");
        let c = board.object_corners(6).expect("marker 6");
        let pitch = 0.05;
        let (x, y) = (4.0 * pitch, pitch);
        assert_eq!(c[0], Point3::new(x, y, 0.0));
        assert_eq!(c[1], Point3::new(x + 0.04, y, 0.0));
        assert_eq!(c[2], Point3::new(x + 0.04, y + 0.04, 0.0));
        assert_eq!(c[3], Point3::new(x, y + 0.04, 0.0));
        assert!(board.markers().iter().all(|m| m.corners.iter().all(|p| p.z == 0.0)));
    }

    #[test]
    fn construction_is_deterministic() {
        let a = BoardModel::new(spec(6, 4)).unwrap();
        let b = BoardModel::new(spec(6, 4)).unwrap();
        assert_eq!(a.markers(), b.markers());
        assert!((a.width() - (6.0 * 0.04 + 5.0 * 0.01)).abs() < 1e-12);
        assert!((a.height() - (4.0 * 0.04 + 3.0 * 0.01)).abs() < 1e-12);
    }

    #[test]
    fn two_by_two_board_is_all_border() {
        let board = BoardModel::new(spec(2, 2)).unwrap();
        assert_eq!(board.marker_count(), 4);
    }

    #[test]
    fn rejects_degenerate_grids() {
        assert_eq!(
            BoardModel::new(spec(1, 7)).unwrap_err(),
            BoardError::InvalidGrid {
                markers_x: 1,
                markers_y: 7
            }
        );
        assert!(matches!(
            BoardModel::new(spec(5, 0)),
            Err(BoardError::InvalidGrid { .. })
        ));
    }

    #[test]
    fn rejects_bad_lengths() {
        let mut s = spec(5, 7);
        s.marker_length = 0.0;
        assert!(matches!(
            BoardModel::new(s),
            Err(BoardError::InvalidMarkerLength(_))
        ));
        let mut s = spec(5, 7);
        s.marker_separation = f64::NAN;
        assert!(matches!(
            BoardModel::new(s),
            Err(BoardError::InvalidSeparation(_))
        ));
    }

    #[test]
    fn rejects_boards_larger_than_dictionary() {
        let mut s = spec(20, 20);
        s.dictionary = DictionaryId::Dict4x4_50;
        assert_eq!(
            BoardModel::new(s).unwrap_err(),
            BoardError::NotEnoughDictionaryCodes {
                dictionary: DictionaryId::Dict4x4_50,
                needed: 76,
                available: 50
            }
        );
    }

    #[test]
    fn correspondences_drop_unknown_and_repeated_ids() {
        let board = BoardModel::new(spec(5, 7)).unwrap();
        let quad = |o: f64| {
            [
                Point2::new(o, o),
                Point2::new(o + 1.0, o),
                Point2::new(o + 1.0, o + 1.0),
                Point2::new(o, o + 1.0),
            ]
        };
        let detection = Detection {
            image_id: "img".into(),
            image_size: None,
            markers: vec![
                DetectedMarker { id: 3, corners: quad(0.0) },
                DetectedMarker { id: 42, corners: quad(5.0) },
                DetectedMarker { id: 3, corners: quad(9.0) },
                DetectedMarker { id: 10, corners: quad(20.0) },
            ],
        };

        let corr = board.correspondences(&detection);
        assert_eq!(corr.marker_ids, vec![3, 10]);
        assert_eq!(corr.unknown_ids, vec![42]);
        assert_eq!(corr.len(), 8);
        assert_eq!(corr.object[0], board.object_corners(3).unwrap()[0]);
        assert_eq!(corr.image[4], Point2::new(20.0, 20.0));
    }
}

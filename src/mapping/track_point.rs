//! Reconstructed points and the append-only cloud that owns them.

use nalgebra::Vector3;

/// A triangulated scene point.
///
/// `frame` is the later frame of the transition that created the point;
/// `keypoint` indexes that frame's keypoints and `source_keypoint` indexes
/// the keypoints of `frame - 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackPoint {
    pub position: Vector3<f64>,
    /// Packed `0xRRGGBB`.
    pub color: u32,
    pub frame: usize,
    pub keypoint: usize,
    pub source_keypoint: usize,
}

/// Ordered collection of every point ever triangulated in a run.
///
/// Points are only appended. Refinement may move them through
/// [`PointCloud::relocate`] but count and order never change.
#[derive(Debug, Clone, Default)]
pub struct PointCloud {
    points: Vec<TrackPoint>,
}

impl PointCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[TrackPoint] {
        &self.points
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TrackPoint> {
        self.points.iter()
    }

    /// Append points, returning the index range they occupy.
    pub fn extend(&mut self, points: impl IntoIterator<Item = TrackPoint>) -> std::ops::Range<usize> {
        let start = self.points.len();
        self.points.extend(points);
        start..self.points.len()
    }

    /// Overwrite every position. `positions` must cover the whole cloud.
    pub fn relocate(&mut self, positions: &[Vector3<f64>]) -> bool {
        if positions.len() != self.points.len() {
            return false;
        }
        for (point, position) in self.points.iter_mut().zip(positions) {
            point.position = *position;
        }
        true
    }

    pub fn into_points(self) -> Vec<TrackPoint> {
        self.points
    }
}

impl FromIterator<TrackPoint> for PointCloud {
    fn from_iter<I: IntoIterator<Item = TrackPoint>>(iter: I) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}

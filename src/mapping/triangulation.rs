//! Linear two-view triangulation of verified matches.

use nalgebra::{Matrix3x4, Matrix4, Point2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SfmError};
use crate::features::{Frame, MatchSet};
use crate::mapping::track_point::TrackPoint;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangulationConfig {
    /// Homogeneous solutions with |w| below this are points at infinity.
    pub min_homogeneous_w: f64,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self {
            min_homogeneous_w: 1e-10,
        }
    }
}

/// Points that survived one transition plus the number dropped.
#[derive(Debug, Default)]
pub struct TriangulationResult {
    pub points: Vec<TrackPoint>,
    pub discarded: usize,
}

pub struct Triangulator {
    config: TriangulationConfig,
}

impl Triangulator {
    pub fn new(config: TriangulationConfig) -> Self {
        Self { config }
    }

    /// Triangulate every match from `previous` to `current`. Both frames
    /// must already have projections.
    ///
    /// Points are colored from `previous`'s image and owned by `current`.
    pub fn triangulate(
        &self,
        previous: &Frame,
        current: &Frame,
        matches: &MatchSet,
    ) -> Result<TriangulationResult> {
        let p1 = previous.require_projection()?;
        let p2 = current.require_projection()?;

        let mut result = TriangulationResult::default();
        result.points.reserve(matches.len());

        for (source_keypoint, keypoint) in matches.iter() {
            let x1 = previous.keypoint(source_keypoint)?;
            let x2 = current.keypoint(keypoint)?;

            match triangulate_point(p1, p2, x1, x2, self.config.min_homogeneous_w) {
                Ok(position) => result.points.push(TrackPoint {
                    position,
                    color: previous.color_at(x1)?,
                    frame: current.id,
                    keypoint,
                    source_keypoint,
                }),
                Err(SfmError::DegenerateTriangulation) => result.discarded += 1,
                Err(e) => return Err(e),
            }
        }

        debug!(
            "triangulated {} -> {}: {} kept, {} discarded",
            previous.id,
            current.id,
            result.points.len(),
            result.discarded
        );
        Ok(result)
    }
}

/// DLT: each view contributes `x * P[2] - P[0]` and `y * P[2] - P[1]`; the
/// solution is the right singular vector of the smallest singular value.
pub fn triangulate_point(
    p1: &Matrix3x4<f64>,
    p2: &Matrix3x4<f64>,
    x1: &Point2<f64>,
    x2: &Point2<f64>,
    min_homogeneous_w: f64,
) -> Result<Vector3<f64>> {
    if !(x1.coords.iter().chain(x2.coords.iter()).all(|v| v.is_finite())) {
        return Err(SfmError::DegenerateTriangulation);
    }

    let mut a = Matrix4::<f64>::zeros();
    for j in 0..4 {
        a[(0, j)] = x1.x * p1[(2, j)] - p1[(0, j)];
        a[(1, j)] = x1.y * p1[(2, j)] - p1[(1, j)];
        a[(2, j)] = x2.x * p2[(2, j)] - p2[(0, j)];
        a[(3, j)] = x2.y * p2[(2, j)] - p2[(1, j)];
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(SfmError::DegenerateTriangulation)?;
    let h = v_t.row(svd.singular_values.imin());

    if h[3].abs() < min_homogeneous_w {
        return Err(SfmError::DegenerateTriangulation);
    }
    let point = Vector3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]);
    if !point.iter().all(|v| v.is_finite()) {
        return Err(SfmError::DegenerateTriangulation);
    }
    Ok(point)
}

//! Pinhole camera intrinsics.

use nalgebra::{Matrix3, Point2, Vector3};
use opencv::core::Mat;
use opencv::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Calibrated pinhole intrinsics with optional lens distortion.
///
/// Immutable once calibrated; the pipeline receives one value per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// OpenCV ordering: k1, k2, p1, p2[, k3, ...]. Empty means no distortion.
    #[serde(default)]
    pub distortion: Vec<f64>,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            distortion: Vec::new(),
        }
    }

    pub fn with_distortion(mut self, coefficients: Vec<f64>) -> Self {
        self.distortion = coefficients;
        self
    }

    /// The 3x3 K matrix.
    pub fn k(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Project a point given in camera coordinates. `None` behind the camera.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Point2<f64>> {
        if p_cam.z <= 0.0 {
            return None;
        }
        Some(Point2::new(
            self.fx * p_cam.x / p_cam.z + self.cx,
            self.fy * p_cam.y / p_cam.z + self.cy,
        ))
    }

    pub fn camera_matrix_mat(&self) -> Result<Mat> {
        Ok(Mat::from_slice_2d(&[
            [self.fx, 0.0, self.cx],
            [0.0, self.fy, self.cy],
            [0.0, 0.0, 1.0],
        ])?
        .try_clone()?)
    }

    /// Distortion coefficients as a 1xN `Mat` (zeros when uncalibrated).
    pub fn distortion_mat(&self) -> Result<Mat> {
        if self.distortion.is_empty() {
            return Ok(Mat::zeros(1, 5, opencv::core::CV_64F)?.to_mat()?);
        }
        Ok(Mat::from_slice(&self.distortion)?.try_clone()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_project_principal_axis() {
        let cam = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0);
        let uv = cam.project(&Vector3::new(0.0, 0.0, 4.0)).unwrap();
        assert_relative_eq!(uv.x, 320.0);
        assert_relative_eq!(uv.y, 240.0);
        assert!(cam.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_k_matches_projection() {
        let cam = CameraIntrinsics::new(700.0, 710.0, 300.0, 200.0);
        let p = Vector3::new(0.3, -0.2, 2.0);
        let h = cam.k() * p;
        let uv = cam.project(&p).unwrap();
        assert_relative_eq!(h.x / h.z, uv.x, epsilon = 1e-12);
        assert_relative_eq!(h.y / h.z, uv.y, epsilon = 1e-12);
    }
}

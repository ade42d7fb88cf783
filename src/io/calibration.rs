//! Persisted camera calibration (YAML).
//!
//! ```yaml
//! camera_matrix: [fx, 0, cx, 0, fy, cy, 0, 0, 1]   # row-major 3x3
//! distortion_coefficients: [k1, k2, p1, p2, k3]
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::camera::CameraIntrinsics;
use crate::error::SfmError;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CalibrationRecord {
    camera_matrix: Vec<f64>,
    #[serde(default)]
    distortion_coefficients: Vec<f64>,
}

/// Load intrinsics. A missing file is reported as
/// [`SfmError::CalibrationMissing`].
pub fn load_calibration(path: &Path) -> Result<CameraIntrinsics> {
    if !path.is_file() {
        return Err(SfmError::CalibrationMissing)
            .with_context(|| format!("no calibration file at {}", path.display()));
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read calibration {}", path.display()))?;
    let record: CalibrationRecord = serde_yaml::from_str(&text)
        .with_context(|| format!("Failed to parse calibration {}", path.display()))?;

    if record.camera_matrix.len() != 9 {
        bail!(
            "camera_matrix must have 9 entries, found {}",
            record.camera_matrix.len()
        );
    }
    let m = &record.camera_matrix;
    Ok(CameraIntrinsics::new(m[0], m[4], m[2], m[5]).with_distortion(record.distortion_coefficients))
}

pub fn save_calibration(path: &Path, camera: &CameraIntrinsics) -> Result<()> {
    let k = camera.k();
    let record = CalibrationRecord {
        camera_matrix: k.transpose().iter().copied().collect(),
        distortion_coefficients: camera.distortion.clone(),
    };
    let text = serde_yaml::to_string(&record)?;
    fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Pinhole intrinsics from a known focal length, principal point at the
/// image centre, no distortion.
pub fn intrinsics_from_focal_length(focal_px: f64, width: i32, height: i32) -> CameraIntrinsics {
    CameraIntrinsics::new(focal_px, focal_px, width as f64 / 2.0, height as f64 / 2.0)
}

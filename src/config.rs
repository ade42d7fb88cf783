//! Run configuration, loaded from YAML. Every field has a default, so an
//! empty file (or none at all) is a valid configuration.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::features::{ExtractionConfig, MatchingConfig};
use crate::mapping::TriangulationConfig;
use crate::optimizer::BundleAdjustmentConfig;
use crate::tracking::PoseConfig;
use crate::viz::ViewerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfmConfig {
    pub matching: MatchingConfig,
    pub pose: PoseConfig,
    pub triangulation: TriangulationConfig,
    pub bundle_adjustment: BundleAdjustmentConfig,
    pub extraction: ExtractionConfig,
    /// Calibration record; relative paths resolve against the image
    /// directory.
    pub calibration_path: PathBuf,
    /// Used instead of a calibration record when set: principal point at
    /// the image centre, no distortion.
    pub focal_length: Option<f64>,
    /// Written into the image directory.
    pub output_file: PathBuf,
    pub viewer: ViewerConfig,
}

impl Default for SfmConfig {
    fn default() -> Self {
        Self {
            matching: MatchingConfig::default(),
            pose: PoseConfig::default(),
            triangulation: TriangulationConfig::default(),
            bundle_adjustment: BundleAdjustmentConfig::default(),
            extraction: ExtractionConfig::default(),
            calibration_path: PathBuf::from("calibration.yaml"),
            focal_length: None,
            output_file: PathBuf::from("point_cloud.ply"),
            viewer: ViewerConfig::default(),
        }
    }
}

impl SfmConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }
}

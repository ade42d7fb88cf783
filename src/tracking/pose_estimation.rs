//! Camera pose estimation for the reconstruction loop.
//!
//! The first pair is posed from an essential matrix (relative, up to
//! scale); every later frame is posed by RANSAC PnP against points already
//! in the cloud.

use nalgebra::{Point2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::camera::CameraIntrinsics;
use crate::error::{Result, SfmError};
use crate::geometry::{
    EssentialParams, PnpParams, PnpResult, Pose, find_essential, mean_reprojection_error,
    recover_relative_pose, solve_pnp_ransac,
};

/// How a PnP estimate becomes the frame's pose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseChaining {
    /// Use the estimate as is. PnP against world-frame points already
    /// yields a world-to-camera pose.
    #[default]
    Direct,
    /// Treat the estimate as relative to the previous frame and compose it
    /// with that frame's pose.
    Accumulate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseConfig {
    pub essential_confidence: f64,
    pub essential_threshold_px: f64,
    pub essential_max_iterations: i32,
    /// Five-point minimum for the essential matrix.
    pub min_essential_matches: usize,
    pub pnp_iterations: i32,
    pub pnp_reprojection_px: f32,
    pub pnp_confidence: f64,
    pub min_correspondences: usize,
    pub chaining: PoseChaining,
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self {
            essential_confidence: 0.9,
            essential_threshold_px: 3.0,
            essential_max_iterations: 1000,
            min_essential_matches: 5,
            pnp_iterations: 300,
            pnp_reprojection_px: 3.0,
            pnp_confidence: 0.99,
            min_correspondences: 6,
            chaining: PoseChaining::Direct,
        }
    }
}

/// Pose of the second view of a pair relative to the first.
#[derive(Debug, Clone)]
pub struct RelativePose {
    pub pose: Pose,
    /// Correspondences that passed RANSAC and the chirality check.
    pub inliers: usize,
}

pub struct PoseEstimator {
    config: PoseConfig,
    relative_calls: usize,
    absolute_calls: usize,
}

impl PoseEstimator {
    pub fn new(config: PoseConfig) -> Self {
        Self {
            config,
            relative_calls: 0,
            absolute_calls: 0,
        }
    }

    pub fn config(&self) -> &PoseConfig {
        &self.config
    }

    pub fn relative_calls(&self) -> usize {
        self.relative_calls
    }

    pub fn absolute_calls(&self) -> usize {
        self.absolute_calls
    }

    /// Pose of the view observing `points2` relative to the view observing
    /// `points1`. The translation has unit norm.
    pub fn relative_pose(
        &mut self,
        points1: &[Point2<f64>],
        points2: &[Point2<f64>],
        camera: &CameraIntrinsics,
    ) -> Result<RelativePose> {
        self.relative_calls += 1;

        let found = points1.len().min(points2.len());
        if found < self.config.min_essential_matches {
            return Err(SfmError::InsufficientMatches {
                found,
                required: self.config.min_essential_matches,
            });
        }

        let params = EssentialParams {
            confidence: self.config.essential_confidence,
            threshold_px: self.config.essential_threshold_px,
            max_iterations: self.config.essential_max_iterations,
        };
        let mut fit = find_essential(points1, points2, camera, &params)?;
        let ransac_inliers = fit.num_inliers();
        let (pose, inliers) = recover_relative_pose(&mut fit, points1, points2, camera)?;

        debug!(
            "relative pose: {} correspondences, {} RANSAC inliers, {} in front of both views",
            found, ransac_inliers, inliers
        );
        Ok(RelativePose { pose, inliers })
    }

    /// World-to-camera pose from 2D-3D correspondences, chained onto
    /// `previous` according to [`PoseChaining`].
    pub fn absolute_pose(
        &mut self,
        points3d: &[Vector3<f64>],
        points2d: &[Point2<f64>],
        camera: &CameraIntrinsics,
        previous: &Pose,
    ) -> Result<PnpResult> {
        self.absolute_calls += 1;

        let params = PnpParams {
            iterations: self.config.pnp_iterations,
            reprojection_px: self.config.pnp_reprojection_px,
            confidence: self.config.pnp_confidence,
            min_correspondences: self.config.min_correspondences,
        };
        let estimate = solve_pnp_ransac(points3d, points2d, camera, &params)?;

        debug!(
            "absolute pose: {} correspondences, {} inliers, mean reprojection error {:.3} px",
            points3d.len(),
            estimate.num_inliers,
            mean_reprojection_error(&estimate.pose, points3d, points2d, camera)
        );

        let pose = match self.config.chaining {
            PoseChaining::Direct => estimate.pose,
            PoseChaining::Accumulate => estimate.pose.compose(previous),
        };
        Ok(PnpResult {
            pose,
            num_inliers: estimate.num_inliers,
        })
    }
}

//! Two-view relative pose from an essential matrix (OpenCV).

use nalgebra::{Matrix3, Point2, Vector3};
use opencv::calib3d;
use opencv::core::{Mat, Point2d, Rect, Vector};
use opencv::prelude::*;

use crate::camera::CameraIntrinsics;
use crate::error::{Result, SfmError};
use crate::geometry::Pose;

/// RANSAC parameters for essential-matrix fitting.
#[derive(Debug, Clone, Copy)]
pub struct EssentialParams {
    /// Desired probability that the estimate is outlier-free.
    pub confidence: f64,
    /// Max distance from a point to its epipolar line, in pixels.
    pub threshold_px: f64,
    pub max_iterations: i32,
}

/// Robust essential matrix plus per-correspondence inlier flags.
pub struct EssentialFit {
    pub essential: Mat,
    pub inlier_mask: Mat,
    pub inliers: Vec<bool>,
}

impl EssentialFit {
    pub fn num_inliers(&self) -> usize {
        self.inliers.iter().filter(|&&b| b).count()
    }
}

/// Fit an essential matrix with RANSAC.
///
/// `points1[i]` and `points2[i]` are pixel coordinates of the same scene
/// point in the two views.
pub fn find_essential(
    points1: &[Point2<f64>],
    points2: &[Point2<f64>],
    camera: &CameraIntrinsics,
    params: &EssentialParams,
) -> Result<EssentialFit> {
    let pts1 = to_cv_points(points1);
    let pts2 = to_cv_points(points2);
    let k = camera.camera_matrix_mat()?;

    let mut mask = Mat::default();
    let e = calib3d::find_essential_mat(
        &pts1,
        &pts2,
        &k,
        calib3d::RANSAC,
        params.confidence,
        params.threshold_px,
        params.max_iterations,
        &mut mask,
    )?;

    if e.empty() || e.cols() != 3 || e.rows() < 3 {
        return Err(SfmError::PoseEstimation(
            "essential matrix estimation returned no solution".to_string(),
        ));
    }
    // The five-point solver may stack several candidate solutions.
    let essential = if e.rows() > 3 {
        Mat::roi(&e, Rect::new(0, 0, 3, 3))?.try_clone()?
    } else {
        e
    };

    let inliers = mask_to_flags(&mask, points1.len())?;

    Ok(EssentialFit {
        essential,
        inlier_mask: mask,
        inliers,
    })
}

/// Decompose `fit.essential` into the pose of view 2 relative to view 1,
/// keeping the solution that puts the inliers in front of both cameras.
///
/// Returns the pose together with the number of correspondences that passed
/// the chirality check. The translation has unit norm.
pub fn recover_relative_pose(
    fit: &mut EssentialFit,
    points1: &[Point2<f64>],
    points2: &[Point2<f64>],
    camera: &CameraIntrinsics,
) -> Result<(Pose, usize)> {
    let pts1 = to_cv_points(points1);
    let pts2 = to_cv_points(points2);
    let k = camera.camera_matrix_mat()?;

    let mut r = Mat::default();
    let mut t = Mat::default();
    let n_good = calib3d::recover_pose_estimated(
        &fit.essential,
        &pts1,
        &pts2,
        &k,
        &mut r,
        &mut t,
        &mut fit.inlier_mask,
    )?;

    if n_good <= 0 {
        return Err(SfmError::PoseEstimation(
            "no correspondence passed the chirality check".to_string(),
        ));
    }

    let rotation = mat3_to_matrix3(&r)?;
    let translation = Vector3::new(
        *t.at::<f64>(0i32)?,
        *t.at::<f64>(1i32)?,
        *t.at::<f64>(2i32)?,
    );
    Ok((Pose::from_rt(rotation, translation), n_good as usize))
}

pub(crate) fn to_cv_points(points: &[Point2<f64>]) -> Vector<Point2d> {
    points.iter().map(|p| Point2d::new(p.x, p.y)).collect()
}

/// Read an OpenCV Nx1 u8 mask into flags. An empty mask means "all inliers".
pub(crate) fn mask_to_flags(mask: &Mat, n: usize) -> Result<Vec<bool>> {
    if mask.empty() {
        return Ok(vec![true; n]);
    }
    let mut flags = Vec::with_capacity(n);
    for i in 0..n {
        flags.push(*mask.at::<u8>(i as i32)? != 0);
    }
    Ok(flags)
}

/// Convert an OpenCV 3x3 f64 Mat to nalgebra.
pub(crate) fn mat3_to_matrix3(mat: &Mat) -> Result<Matrix3<f64>> {
    let mut arr = [0.0f64; 9];
    for (i, v) in arr.iter_mut().enumerate() {
        *v = *mat.at::<f64>(i as i32)?;
    }
    Ok(Matrix3::from_row_slice(&arr))
}

//! PnP (Perspective-n-Point) solver using OpenCV.

use nalgebra::{Point2, Vector3};
use opencv::calib3d;
use opencv::core::{Mat, Point3d, Vector};
use opencv::prelude::*;

use crate::camera::CameraIntrinsics;
use crate::error::{Result, SfmError};
use crate::geometry::Pose;
use crate::geometry::essential::{mat3_to_matrix3, to_cv_points};

/// RANSAC parameters for PnP.
#[derive(Debug, Clone, Copy)]
pub struct PnpParams {
    pub iterations: i32,
    /// Inlier threshold on reprojection error, in pixels.
    pub reprojection_px: f32,
    pub confidence: f64,
    /// Below this many correspondences the linear system is underdetermined.
    pub min_correspondences: usize,
}

/// Result of PnP solving.
pub struct PnpResult {
    /// Estimated world-to-camera pose.
    pub pose: Pose,
    /// Number of RANSAC inliers.
    pub num_inliers: usize,
}

/// Solve PnP with RANSAC given 3D-2D correspondences.
///
/// # Arguments
/// * `points3d` - World points
/// * `points2d` - Corresponding pixel observations
/// * `camera` - Intrinsics, distortion included
pub fn solve_pnp_ransac(
    points3d: &[Vector3<f64>],
    points2d: &[Point2<f64>],
    camera: &CameraIntrinsics,
    params: &PnpParams,
) -> Result<PnpResult> {
    let found = points3d.len().min(points2d.len());
    if found < params.min_correspondences {
        return Err(SfmError::InsufficientCorrespondences {
            found,
            required: params.min_correspondences,
        });
    }

    let obj_points: Vector<Point3d> = points3d
        .iter()
        .map(|p| Point3d::new(p.x, p.y, p.z))
        .collect();
    let img_points = to_cv_points(points2d);

    let camera_matrix = camera.camera_matrix_mat()?;
    let dist_coeffs = camera.distortion_mat()?;

    let mut rvec = Mat::default();
    let mut tvec = Mat::default();
    let mut inliers = Mat::default();
    let ok = calib3d::solve_pnp_ransac(
        &obj_points,
        &img_points,
        &camera_matrix,
        &dist_coeffs,
        &mut rvec,
        &mut tvec,
        false,
        params.iterations,
        params.reprojection_px,
        params.confidence,
        &mut inliers,
        calib3d::SOLVEPNP_ITERATIVE,
    )?;
    if !ok || rvec.empty() || tvec.empty() {
        return Err(SfmError::PoseEstimation(
            "PnP RANSAC found no consensus".to_string(),
        ));
    }

    // Axis-angle to rotation matrix
    let mut rot_mat = Mat::default();
    calib3d::rodrigues(&rvec, &mut rot_mat, &mut opencv::core::no_array())?;
    let rotation = mat3_to_matrix3(&rot_mat)?;
    let translation = Vector3::new(
        *tvec.at::<f64>(0i32)?,
        *tvec.at::<f64>(1i32)?,
        *tvec.at::<f64>(2i32)?,
    );

    Ok(PnpResult {
        pose: Pose::from_rt(rotation, translation),
        num_inliers: inliers.rows().max(0) as usize,
    })
}

/// Mean reprojection error of `points3d` under `pose`, in pixels.
/// Points behind the camera are skipped.
pub fn mean_reprojection_error(
    pose: &Pose,
    points3d: &[Vector3<f64>],
    points2d: &[Point2<f64>],
    camera: &CameraIntrinsics,
) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for (p3, p2) in points3d.iter().zip(points2d) {
        if let Some(uv) = camera.project(&pose.transform_point(p3)) {
            sum += (uv - p2).norm();
            n += 1;
        }
    }
    if n == 0 { f64::INFINITY } else { sum / n as f64 }
}

//! Rigid camera pose (world to camera) and projection matrices.

use nalgebra::{Matrix3, Matrix3x4, Rotation3, Vector3};

use crate::camera::CameraIntrinsics;

/// Camera pose as the world-to-camera transform `p_cam = R * p_world + t`.
///
/// This is the convention OpenCV's `recoverPose` and `solvePnP` return, so
/// estimates are stored without inversion.
#[derive(Debug, Clone, PartialEq)]
pub struct Pose {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn identity() -> Self {
        Self {
            rotation: Rotation3::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build from a raw 3x3 matrix, projecting it back onto SO(3).
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: orthonormalize(&rotation),
            translation,
        }
    }

    /// Build from an axis-angle (Rodrigues) vector.
    pub fn from_axis_angle(rvec: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: Rotation3::new(rvec),
            translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// `self ∘ other`: apply `other` first, then `self`.
    pub fn compose(&self, other: &Pose) -> Pose {
        let rotation = self.rotation.matrix() * other.rotation.matrix();
        Pose::from_rt(rotation, self.rotation * other.translation + self.translation)
    }

    pub fn inverse(&self) -> Pose {
        let r_inv = self.rotation.inverse();
        Pose {
            rotation: r_inv,
            translation: -(r_inv * self.translation),
        }
    }

    /// Camera centre in world coordinates, `-Rᵀ t`.
    pub fn center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }

    /// `[R | t]`.
    pub fn extrinsic_matrix(&self) -> Matrix3x4<f64> {
        let mut m = Matrix3x4::zeros();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(self.rotation.matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// `K * [R | t]`.
    pub fn projection(&self, camera: &CameraIntrinsics) -> Matrix3x4<f64> {
        camera.k() * self.extrinsic_matrix()
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

/// Nearest rotation to `m`.
fn orthonormalize(m: &Matrix3<f64>) -> Rotation3<f64> {
    Rotation3::from_matrix(m)
}

/// Skew-symmetric matrix `[v]×` with `[v]× u = v × u`.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

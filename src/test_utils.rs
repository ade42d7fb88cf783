//! Synthetic multi-view scenes for tests.

use nalgebra::{Point2, Rotation3, Vector3};
use opencv::core::{CV_8UC3, Mat, Scalar};
use opencv::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::camera::CameraIntrinsics;
use crate::features::{Frame, MatchSet};
use crate::geometry::Pose;

pub const DESCRIPTOR_DIM: usize = 64;
pub const IMAGE_BGR: (u8, u8, u8) = (30, 60, 90);

/// Random points in front of a camera rig moving sideways along +x.
pub struct SyntheticScene {
    pub camera: CameraIntrinsics,
    pub points: Vec<Vector3<f64>>,
    /// World-to-camera poses; `poses[0]` is the identity.
    pub poses: Vec<Pose>,
    /// One descriptor per scene point, shared by every view of that point.
    pub descriptors: Vec<Vec<f32>>,
}

impl SyntheticScene {
    pub fn new(n_points: usize, n_frames: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let camera = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0);

        let points = (0..n_points)
            .map(|_| {
                Vector3::new(
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(5.0..9.0),
                )
            })
            .collect();

        let poses = (0..n_frames)
            .map(|j| {
                let center = Vector3::new(0.5 * j as f64, 0.02 * j as f64, 0.0);
                let rotation = Rotation3::from_euler_angles(0.01 * j as f64, -0.04 * j as f64, 0.0);
                Pose {
                    translation: -(rotation * center),
                    rotation,
                }
            })
            .collect();

        let descriptors = (0..n_points)
            .map(|_| (0..DESCRIPTOR_DIM).map(|_| rng.gen_range(0.0..1.0)).collect())
            .collect();

        Self {
            camera,
            points,
            poses,
            descriptors,
        }
    }

    /// Pixel projections of every scene point in `frame`.
    pub fn observations(&self, frame: usize) -> Vec<Point2<f64>> {
        let pose = &self.poses[frame];
        self.points
            .iter()
            .map(|p| {
                self.camera
                    .project(&pose.transform_point(p))
                    .expect("synthetic point behind camera")
            })
            .collect()
    }

    pub fn correspondences(&self, a: usize, b: usize) -> (Vec<Point2<f64>>, Vec<Point2<f64>>) {
        (self.observations(a), self.observations(b))
    }

    /// Frames whose keypoint `k` observes scene point `k`.
    pub fn frames(&self) -> Vec<Frame> {
        (0..self.poses.len())
            .map(|j| {
                Frame::new(
                    j,
                    solid_image(),
                    self.observations(j),
                    descriptor_mat(&self.descriptors),
                )
            })
            .collect()
    }

    /// Ground-truth identity matches between consecutive frames.
    pub fn store_identity_matches(&self, frames: &mut [Frame]) {
        let all: Vec<usize> = (0..self.points.len()).collect();
        for frame in frames.iter_mut().take(self.poses.len().saturating_sub(1)) {
            frame.matches_to_next = Some(MatchSet::new(all.clone(), all.clone()).unwrap());
        }
    }
}

pub fn descriptor_mat(rows: &[Vec<f32>]) -> Mat {
    Mat::from_slice_2d(rows).unwrap()
}

pub fn random_descriptors(n: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..DESCRIPTOR_DIM).map(|_| rng.gen_range(0.0..1.0)).collect())
        .collect()
}

pub fn solid_image() -> Mat {
    let (b, g, r) = IMAGE_BGR;
    Mat::new_rows_cols_with_default(
        480,
        640,
        CV_8UC3,
        Scalar::new(b as f64, g as f64, r as f64, 0.0),
    )
    .unwrap()
}

pub fn packed_image_color() -> u32 {
    let (b, g, r) = IMAGE_BGR;
    (r as u32) << 16 | (g as u32) << 8 | b as u32
}

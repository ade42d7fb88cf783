//! Per-image reconstruction state: keypoints, descriptors, pose, matches.

use nalgebra::{Matrix3x4, Point2};
use opencv::core::{CV_8UC1, CV_8UC3, Mat, Vec3b, Vector};
use opencv::prelude::*;

use crate::camera::CameraIntrinsics;
use crate::error::{Result, SfmError};
use crate::geometry::Pose;

/// Verified correspondences between frame i (`current`) and frame i+1
/// (`other`). `current[k]` and `other[k]` are keypoint indices of the same
/// scene point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSet {
    current: Vec<usize>,
    other: Vec<usize>,
}

impl MatchSet {
    pub fn new(current: Vec<usize>, other: Vec<usize>) -> Result<Self> {
        if current.len() != other.len() {
            return Err(SfmError::MismatchedMatchArrays {
                current: current.len(),
                other: other.len(),
            });
        }
        Ok(Self { current, other })
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (usize, usize)>) -> Self {
        let (current, other) = pairs.into_iter().unzip();
        Self { current, other }
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    pub fn current(&self) -> &[usize] {
        &self.current
    }

    pub fn other(&self) -> &[usize] {
        &self.other
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.current.iter().copied().zip(self.other.iter().copied())
    }

    /// Fail unless every index addresses a keypoint of its frame.
    pub fn check_bounds(&self, current_len: usize, other_len: usize) -> Result<()> {
        check_indices(self.current.iter().copied(), current_len)?;
        check_indices(self.other.iter().copied(), other_len)
    }
}

/// First index `>= len`, as `InvalidMatch`.
pub fn check_indices(indices: impl IntoIterator<Item = usize>, len: usize) -> Result<()> {
    match indices.into_iter().find(|&i| i >= len) {
        Some(index) => Err(SfmError::InvalidMatch { index, len }),
        None => Ok(()),
    }
}

/// One image of the sequence.
pub struct Frame {
    pub id: usize,
    /// Source image, BGR or grayscale. Only read for color sampling.
    pub image: Mat,
    pub keypoints: Vec<Point2<f64>>,
    /// One descriptor row per keypoint.
    pub descriptors: Mat,
    /// Verified matches to frame `id + 1`, filled by `match_sequence`.
    pub matches_to_next: Option<MatchSet>,
    pose: Option<Pose>,
    projection: Option<Matrix3x4<f64>>,
}

impl Frame {
    pub fn new(id: usize, image: Mat, keypoints: Vec<Point2<f64>>, descriptors: Mat) -> Self {
        Self {
            id,
            image,
            keypoints,
            descriptors,
            matches_to_next: None,
            pose: None,
            projection: None,
        }
    }

    pub fn pose(&self) -> Option<&Pose> {
        self.pose.as_ref()
    }

    pub fn projection(&self) -> Option<&Matrix3x4<f64>> {
        self.projection.as_ref()
    }

    /// Projection matrix, or an error if the pose is not known yet.
    pub fn require_projection(&self) -> Result<&Matrix3x4<f64>> {
        self.projection
            .as_ref()
            .ok_or(SfmError::MissingProjection { frame: self.id })
    }

    /// Fix this frame's pose and derive `K [R | t]` from it.
    pub fn set_pose(&mut self, pose: Pose, camera: &CameraIntrinsics) {
        self.projection = Some(pose.projection(camera));
        self.pose = Some(pose);
    }

    pub fn keypoint(&self, index: usize) -> Result<&Point2<f64>> {
        self.keypoints.get(index).ok_or(SfmError::InvalidMatch {
            index,
            len: self.keypoints.len(),
        })
    }

    pub fn points_at(&self, indices: &[usize]) -> Vec<Point2<f64>> {
        indices.iter().map(|&i| self.keypoints[i]).collect()
    }

    /// Stack the descriptor rows at `indices` into a new, owned `Mat`.
    pub fn descriptor_rows(&self, indices: &[usize]) -> Result<Mat> {
        let mut out = Mat::default();
        if indices.is_empty() {
            return Ok(out);
        }
        let mut rows = Vector::<Mat>::new();
        for &i in indices {
            rows.push(self.descriptors.row(i as i32)?.try_clone()?);
        }
        opencv::core::vconcat(&rows, &mut out)?;
        Ok(out)
    }

    /// Image color under `p`, packed as `0xRRGGBB`. Coordinates are
    /// truncated to the pixel grid and clamped to the image.
    pub fn color_at(&self, p: &Point2<f64>) -> Result<u32> {
        if self.image.empty() {
            return Ok(0);
        }
        let col = (p.x as i32).clamp(0, self.image.cols() - 1);
        let row = (p.y as i32).clamp(0, self.image.rows() - 1);

        match self.image.typ() {
            CV_8UC3 => {
                let bgr = self.image.at_2d::<Vec3b>(row, col)?;
                Ok(pack_rgb(bgr[2], bgr[1], bgr[0]))
            }
            CV_8UC1 => {
                let v = *self.image.at_2d::<u8>(row, col)?;
                Ok(pack_rgb(v, v, v))
            }
            _ => Ok(0),
        }
    }
}

#[inline]
pub fn pack_rgb(r: u8, g: u8, b: u8) -> u32 {
    (r as u32) << 16 | (g as u32) << 8 | b as u32
}

#[inline]
pub fn unpack_rgb(rgb: u32) -> (u8, u8, u8) {
    ((rgb >> 16) as u8, (rgb >> 8) as u8, rgb as u8)
}

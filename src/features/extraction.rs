//! SIFT keypoint/descriptor extraction (OpenCV), parallel across images.

use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use nalgebra::Point2;
use opencv::core::{KeyPoint, Mat, Ptr, Vector};
use opencv::features2d::SIFT;
use opencv::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::features::frame::Frame;
use crate::io::images::load_image;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Images are shrunk by this factor before extraction (values <= 1 keep
    /// the original size).
    pub down_scale: f64,
    /// Sort input images by file name.
    pub sort_images: bool,
    /// Worker threads; 0 picks the available parallelism.
    pub workers: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            down_scale: 1.0,
            sort_images: true,
            workers: 0,
        }
    }
}

pub struct SiftExtractor {
    sift: Ptr<SIFT>,
}

impl SiftExtractor {
    pub fn new() -> Result<Self> {
        let sift = SIFT::create_def().context("Failed to create SIFT detector")?;
        Ok(Self { sift })
    }

    pub fn detect(&mut self, image: &Mat) -> Result<(Vec<Point2<f64>>, Mat)> {
        let mut keypoints = Vector::<KeyPoint>::new();
        let mut descriptors = Mat::default();
        let mask = Mat::default();
        self.sift
            .detect_and_compute(image, &mask, &mut keypoints, &mut descriptors, false)?;
        Ok((keypoints_to_points(&keypoints), descriptors))
    }
}

/// Convert OpenCV keypoints to pixel coordinates.
fn keypoints_to_points(keypoints: &Vector<KeyPoint>) -> Vec<Point2<f64>> {
    keypoints
        .iter()
        .map(|kp| Point2::new(kp.pt().x as f64, kp.pt().y as f64))
        .collect()
}

/// Load and describe every image. Images that cannot be read are skipped;
/// frame ids are assigned in input order over the remaining images.
pub fn extract_frames(paths: &[PathBuf], config: &ExtractionConfig) -> Result<Vec<Frame>> {
    let workers = match config.workers {
        0 => thread::available_parallelism().map_or(1, |n| n.get()),
        n => n,
    }
    .min(paths.len().max(1));
    let chunk_size = paths.len().div_ceil(workers).max(1);

    let described: Vec<Option<(Mat, Vec<Point2<f64>>, Mat)>> = thread::scope(|scope| {
        let handles: Vec<_> = paths
            .chunks(chunk_size)
            .map(|chunk| {
                scope.spawn(move || -> Result<Vec<_>> {
                    let mut extractor = SiftExtractor::new()?;
                    let mut out = Vec::with_capacity(chunk.len());
                    for path in chunk {
                        out.push(describe_one(&mut extractor, path, config.down_scale)?);
                    }
                    Ok(out)
                })
            })
            .collect();

        let mut all = Vec::with_capacity(paths.len());
        for handle in handles {
            let chunk = handle
                .join()
                .map_err(|_| anyhow::anyhow!("feature extraction worker panicked"))??;
            all.extend(chunk);
        }
        Ok::<_, anyhow::Error>(all)
    })?;

    let frames: Vec<Frame> = described
        .into_iter()
        .flatten()
        .enumerate()
        .map(|(id, (image, keypoints, descriptors))| Frame::new(id, image, keypoints, descriptors))
        .collect();

    info!("Features were extracted from {} / {} images", frames.len(), paths.len());
    Ok(frames)
}

fn describe_one(
    extractor: &mut SiftExtractor,
    path: &Path,
    down_scale: f64,
) -> Result<Option<(Mat, Vec<Point2<f64>>, Mat)>> {
    let image = match load_image(path, down_scale)? {
        Some(image) => image,
        None => {
            warn!("Skipping unreadable image {:?}", path);
            return Ok(None);
        }
    };
    let (keypoints, descriptors) = extractor
        .detect(&image)
        .with_context(|| format!("Failed to extract features from {:?}", path))?;
    info!(
        "{} {} features were extracted",
        path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
        keypoints.len()
    );
    Ok(Some((image, keypoints, descriptors)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{CV_8UC3, Point, Scalar};
    use opencv::imgproc;

    fn textured_image() -> Mat {
        let mut img =
            Mat::new_rows_cols_with_default(240, 320, CV_8UC3, Scalar::all(0.0)).unwrap();
        for i in 0..12 {
            let center = Point::new(20 + 23 * i, 40 + (i * 37) % 160);
            let color = Scalar::new(255.0, (i * 20) as f64, 128.0, 0.0);
            imgproc::circle(&mut img, center, 6 + i % 5, color, -1, imgproc::LINE_8, 0).unwrap();
        }
        img
    }

    #[test]
    fn test_sift_descriptors_align_with_keypoints() {
        let mut extractor = SiftExtractor::new().unwrap();
        let (keypoints, descriptors) = extractor.detect(&textured_image()).unwrap();

        assert!(!keypoints.is_empty());
        assert_eq!(descriptors.rows() as usize, keypoints.len());
        assert_eq!(descriptors.cols(), 128);
    }

    #[test]
    fn test_extract_frames_skips_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("a.png");
        opencv::imgcodecs::imwrite(good.to_str().unwrap(), &textured_image(), &Vector::new())
            .unwrap();
        let missing = dir.path().join("b.png");

        let frames = extract_frames(&[good, missing], &ExtractionConfig::default()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, 0);
    }
}

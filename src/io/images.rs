//! Image discovery and loading.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use opencv::core::{Mat, Size};
use opencv::prelude::*;
use opencv::{imgcodecs, imgproc};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tif", "tiff"];

/// Image files directly inside `dir`, optionally sorted by file name.
pub fn list_images(dir: &Path, sort: bool) -> Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to open image directory {}", dir.display()))?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if path.is_file() && is_image {
            paths.push(path);
        }
    }
    if sort {
        paths.sort();
    }
    Ok(paths)
}

/// Read a color image and shrink it by `down_scale`. `Ok(None)` when the
/// file cannot be decoded.
pub fn load_image(path: &Path, down_scale: f64) -> Result<Option<Mat>> {
    let name = path
        .to_str()
        .with_context(|| format!("Non UTF-8 image path {:?}", path))?;
    let image = imgcodecs::imread(name, imgcodecs::IMREAD_COLOR)
        .with_context(|| format!("Failed to read image {:?}", path))?;
    if image.empty() {
        return Ok(None);
    }
    if down_scale <= 1.0 {
        return Ok(Some(image));
    }

    let size = Size::new(
        ((image.cols() as f64 / down_scale) as i32).max(1),
        ((image.rows() as f64 / down_scale) as i32).max(1),
    );
    let mut resized = Mat::default();
    imgproc::resize(&image, &mut resized, size, 0.0, 0.0, imgproc::INTER_AREA)?;
    Ok(Some(resized))
}

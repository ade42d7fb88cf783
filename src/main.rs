use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use opencv::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sparse_sfm::features::{OpenCvMatcher, extract_frames, match_sequence};
use sparse_sfm::io::{intrinsics_from_focal_length, list_images, load_calibration};
use sparse_sfm::mapping::CloudHandle;
use sparse_sfm::optimizer::LmBundleAdjuster;
use sparse_sfm::viz::{CloudViewer, RerunVisualizer};
use sparse_sfm::{CameraIntrinsics, Reconstructor, SfmConfig};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sparse_sfm=info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(images_dir) = args.next().map(PathBuf::from) else {
        bail!("usage: sparse-sfm <images_dir> [config.yaml]");
    };
    let config = match args.next() {
        Some(path) => SfmConfig::load(Path::new(&path))?,
        None => SfmConfig::default(),
    };

    let paths = list_images(&images_dir, config.extraction.sort_images)?;
    info!("Found {} images in {}", paths.len(), images_dir.display());

    let mut frames = extract_frames(&paths, &config.extraction)?;
    if frames.len() < 2 {
        bail!("need at least 2 readable images, found {}", frames.len());
    }

    let camera = resolve_camera(&config, &images_dir, &frames[0].image)?;
    info!(
        "Camera: fx {:.1} fy {:.1} cx {:.1} cy {:.1}",
        camera.fx, camera.fy, camera.cx, camera.cy
    );

    let matcher = OpenCvMatcher::new(config.matching.clone())?;
    match_sequence(&matcher, &mut frames, &camera)?;

    let cloud = CloudHandle::new();
    let viewer = if config.viewer.enabled {
        match RerunVisualizer::spawn(&config.viewer) {
            Ok(viz) => Some(CloudViewer::start(
                cloud.clone(),
                viz,
                Duration::from_millis(config.viewer.poll_interval_ms),
            )),
            Err(e) => {
                warn!("Viewer disabled: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    let refiner = LmBundleAdjuster::new(config.bundle_adjustment.clone());
    let output = images_dir.join(&config.output_file);
    let result = Reconstructor::new(frames, camera, matcher, refiner, &config)
        .with_cloud_handle(cloud)
        .run_to_file(&output);

    if let Some(viewer) = viewer {
        viewer.finish();
    }
    let reconstruction = result.context("reconstruction failed")?;

    if reconstruction.refinement_warning() {
        warn!("Saved cloud is unrefined");
    }
    info!(
        "Done: {} points from {} frames",
        reconstruction.cloud.len(),
        reconstruction.poses.len()
    );
    Ok(())
}

/// Configured focal length if set, otherwise the calibration record.
fn resolve_camera(config: &SfmConfig, images_dir: &Path, first_image: &Mat) -> Result<CameraIntrinsics> {
    if let Some(focal) = config.focal_length {
        return Ok(intrinsics_from_focal_length(
            focal,
            first_image.cols(),
            first_image.rows(),
        ));
    }
    let path = if config.calibration_path.is_absolute() {
        config.calibration_path.clone()
    } else {
        images_dir.join(&config.calibration_path)
    };
    let mut camera = load_calibration(&path)?;

    // Calibration is for full-size images.
    let scale = config.extraction.down_scale;
    if scale > 1.0 {
        camera.fx /= scale;
        camera.fy /= scale;
        camera.cx /= scale;
        camera.cy /= scale;
    }
    Ok(camera)
}

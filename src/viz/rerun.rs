//! Live point-cloud viewer fed from published snapshots.
//!
//! Entity hierarchy:
//!     world/
//!         points       - Reconstructed points, colored from the images
//!         trajectory   - Camera centres in frame order
//!         cameras      - One small box per posed frame

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use nalgebra::Vector3;
use rerun::RecordingStream;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::features::unpack_rgb;
use crate::mapping::{CloudHandle, CloudSnapshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub enabled: bool,
    pub app_id: String,
    pub point_radius: f32,
    /// How often the viewer thread checks for a new snapshot.
    pub poll_interval_ms: u64,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            app_id: "sparse-sfm".to_string(),
            point_radius: 0.01,
            poll_interval_ms: 100,
        }
    }
}

/// Anything that can display a cloud snapshot.
pub trait SnapshotSink: Send + 'static {
    fn show(&mut self, snapshot: &CloudSnapshot);
}

pub struct RerunVisualizer {
    rec: RecordingStream,
    point_radius: f32,
}

impl RerunVisualizer {
    /// Spawn a rerun viewer process and connect to it.
    pub fn spawn(config: &ViewerConfig) -> Result<Self> {
        let rec = rerun::RecordingStreamBuilder::new(config.app_id.as_str())
            .spawn()
            .context("Failed to spawn rerun viewer")?;
        Ok(Self::with_stream(rec, config.point_radius))
    }

    pub fn with_stream(rec: RecordingStream, point_radius: f32) -> Self {
        // OpenCV camera convention: x right, y down, z forward.
        rec.log_static("world", &rerun::ViewCoordinates::RDF()).ok();
        Self { rec, point_radius }
    }

    pub fn log_points(&self, snapshot: &CloudSnapshot) {
        let positions: Vec<[f32; 3]> = snapshot
            .points
            .iter()
            .map(|p| to_f32(&p.position))
            .collect();
        let colors: Vec<[u8; 3]> = snapshot
            .points
            .iter()
            .map(|p| {
                let (r, g, b) = unpack_rgb(p.color);
                [r, g, b]
            })
            .collect();

        if let Err(e) = self.rec.log(
            "world/points",
            &rerun::Points3D::new(positions)
                .with_colors(colors)
                .with_radii([self.point_radius]),
        ) {
            warn!("Failed to log points: {}", e);
        }
    }

    /// Camera centres as a thin line plus one box per frame.
    pub fn log_trajectory(&self, centers: &[Vector3<f64>]) {
        if centers.is_empty() {
            return;
        }
        let pts: Vec<[f32; 3]> = centers.iter().map(to_f32).collect();

        if pts.len() >= 2 {
            self.rec
                .log(
                    "world/trajectory",
                    &rerun::LineStrips3D::new([pts.clone()])
                        .with_colors([[255u8, 200, 0]])
                        .with_radii([0.005f32]),
                )
                .ok();
        }
        let size = 4.0 * self.point_radius;
        self.rec
            .log(
                "world/cameras",
                &rerun::Boxes3D::from_centers_and_sizes(
                    pts.iter().copied(),
                    pts.iter().map(|_| [size, size, size]),
                )
                .with_colors([[0u8, 100, 255]]),
            )
            .ok();
    }
}

impl SnapshotSink for RerunVisualizer {
    fn show(&mut self, snapshot: &CloudSnapshot) {
        self.rec.set_time_sequence("snapshot", snapshot.version as i64);
        self.log_points(snapshot);
        self.log_trajectory(&snapshot.camera_centers);
    }
}

fn to_f32(p: &Vector3<f64>) -> [f32; 3] {
    [p.x as f32, p.y as f32, p.z as f32]
}

/// Background thread that redraws whenever the cloud version changes.
///
/// Only ever reads published snapshots, so the reconstructor never waits on
/// it. Stops when [`CloudViewer::finish`] is called or the viewer is
/// dropped.
pub struct CloudViewer {
    stop: Sender<()>,
    handle: Option<JoinHandle<usize>>,
}

impl CloudViewer {
    pub fn start<S: SnapshotSink>(cloud: Arc<CloudHandle>, sink: S, poll: Duration) -> Self {
        let (stop, stop_rx) = bounded::<()>(1);
        let handle = thread::spawn(move || viewer_loop(cloud, sink, stop_rx, poll));
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal completion, draw the final snapshot and wait for the thread.
    /// Returns how many snapshots were drawn.
    pub fn finish(mut self) -> usize {
        self.shutdown()
    }

    fn shutdown(&mut self) -> usize {
        self.stop.try_send(()).ok();
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                warn!("viewer thread panicked");
                0
            }),
            None => 0,
        }
    }
}

impl Drop for CloudViewer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn viewer_loop<S: SnapshotSink>(
    cloud: Arc<CloudHandle>,
    mut sink: S,
    stop: Receiver<()>,
    poll: Duration,
) -> usize {
    let mut seen = 0;
    let mut drawn = 0;
    let mut draw_if_changed = |sink: &mut S| {
        if cloud.version() != seen {
            let snapshot = cloud.load();
            sink.show(&snapshot);
            seen = snapshot.version;
            drawn += 1;
        }
    };

    loop {
        draw_if_changed(&mut sink);
        match stop.recv_timeout(poll) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    draw_if_changed(&mut sink);
    debug!("viewer stopped after {} redraws", drawn);
    drawn
}

//! Live visualization.

pub mod rerun;

pub use self::rerun::{CloudViewer, RerunVisualizer, SnapshotSink, ViewerConfig};

//! Per-frame pose estimation and the state of the reconstruction loop.

pub mod pose_estimation;
pub mod result;
pub mod state;

pub use pose_estimation::{PoseChaining, PoseConfig, PoseEstimator, RelativePose};
pub use result::{RunStats, TransitionReport};
pub use state::PipelineState;

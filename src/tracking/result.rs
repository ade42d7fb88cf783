//! Per-transition diagnostics.

use crate::tracking::PipelineState;

/// What happened while processing the transition `frame - 1 -> frame`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionReport {
    pub frame: usize,
    /// State the transition was processed in.
    pub state: PipelineState,
    /// Verified 2D-2D matches of the pair.
    pub matches: usize,
    /// 2D-3D correspondences fed to PnP (0 for the first pair).
    pub correspondences: usize,
    /// Pose inliers (essential-matrix chirality or PnP RANSAC).
    pub pose_inliers: usize,
    pub triangulated: usize,
    pub discarded: usize,
}

/// Aggregate over a whole run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub relative_pose_calls: usize,
    pub absolute_pose_calls: usize,
    pub transitions: Vec<TransitionReport>,
}

impl RunStats {
    pub fn triangulated(&self) -> usize {
        self.transitions.iter().map(|t| t.triangulated).sum()
    }

    pub fn discarded(&self) -> usize {
        self.transitions.iter().map(|t| t.discarded).sum()
    }
}

//! Reconstruction state machine.

/// Which step the reconstructor takes for the next frame transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    /// Frames 0 and 1: relative pose, no 3D points yet.
    #[default]
    FirstPair,
    /// Later frames: absolute pose against the active points.
    Incremental,
    /// Every frame has been posed.
    Done,
}

impl PipelineState {
    /// State after the transition ending at `frame` out of `n_frames`.
    pub fn after(frame: usize, n_frames: usize) -> Self {
        if frame + 1 >= n_frames {
            PipelineState::Done
        } else {
            PipelineState::Incremental
        }
    }
}

//! Error types for the reconstruction pipeline.
//!
//! Fatal errors stop the run (`SfmError`). Refinement failures are reported
//! separately (`RefineError`) because the pipeline recovers from them.

use std::fmt;

use thiserror::Error;

/// Pipeline stage in which a frame transition failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// 2D-2D matching of the (i-1, i) pair.
    MatchPair,
    /// Essential matrix + decomposition for the first pair.
    RelativePose,
    /// Descriptor matching of the active tracks against frame i.
    Match3d2d,
    /// RANSAC PnP for frame i.
    AbsolutePose,
    /// Linear triangulation between frame i-1 and i.
    Triangulation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::MatchPair => "match_pair",
            Stage::RelativePose => "relative_pose",
            Stage::Match3d2d => "match_3d_2d",
            Stage::AbsolutePose => "absolute_pose",
            Stage::Triangulation => "triangulation",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SfmError {
    #[error("camera calibration is missing")]
    CalibrationMissing,

    #[error("insufficient matches: {found} found, at least {required} required")]
    InsufficientMatches { found: usize, required: usize },

    #[error("insufficient 2D-3D correspondences: {found} found, at least {required} required")]
    InsufficientCorrespondences { found: usize, required: usize },

    /// Point at infinity or non-finite coordinates. Never escalates past the
    /// triangulator; kept here so per-point results share the error type.
    #[error("degenerate triangulation (point at infinity or non-finite)")]
    DegenerateTriangulation,

    #[error("pose estimation failed: {0}")]
    PoseEstimation(String),

    #[error("frame {frame} has no projection matrix yet")]
    MissingProjection { frame: usize },

    #[error("match index arrays differ in length ({current} vs {other})")]
    MismatchedMatchArrays { current: usize, other: usize },

    #[error("match index {index} out of range ({len} entries)")]
    InvalidMatch { index: usize, len: usize },

    #[error("at least 2 frames are required, got {0}")]
    NotEnoughFrames(usize),

    #[error("frame {frame} failed during {stage}: {source}")]
    Transition {
        frame: usize,
        stage: Stage,
        #[source]
        source: Box<SfmError>,
    },

    #[error(transparent)]
    OpenCv(#[from] opencv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SfmError {
    /// Attach the failing frame index and stage to a per-transition error.
    pub fn at(self, frame: usize, stage: Stage) -> Self {
        SfmError::Transition {
            frame,
            stage,
            source: Box::new(self),
        }
    }

    /// The innermost error, unwrapping any transition context.
    pub fn root(&self) -> &SfmError {
        match self {
            SfmError::Transition { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, SfmError>;

/// Bundle adjustment did not produce a usable refinement.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RefineError {
    #[error("nothing to refine: {0}")]
    EmptyProblem(String),

    #[error("refinement did not converge within {iterations} iterations")]
    NotConverged { iterations: usize },

    #[error("refinement produced non-finite parameters")]
    NonFinite,

    #[error("refined solution does not fit the reconstruction: {0}")]
    Mismatch(String),
}

//! Frames, feature extraction and descriptor matching.

pub mod extraction;
pub mod frame;
pub mod matcher;

pub use extraction::{ExtractionConfig, SiftExtractor, extract_frames};
pub use frame::{Frame, MatchSet, check_indices, pack_rgb, unpack_rgb};
pub use matcher::{
    FeatureMatcher, MatcherEngine, MatchingConfig, OpenCvMatcher, match_sequence, ratio_test,
};

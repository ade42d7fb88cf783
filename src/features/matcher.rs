//! Descriptor matching: 2D-2D pairs with epipolar verification, and 2D-3D
//! matching of tracked points against a new frame.

use opencv::core::{CV_32F, DMatch, Mat, Ptr, Vector};
use opencv::features2d::DescriptorMatcher;
use opencv::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::camera::CameraIntrinsics;
use crate::error::{Result, SfmError, Stage};
use crate::features::frame::{Frame, MatchSet};
use crate::geometry::{EssentialParams, find_essential};

/// Nearest-neighbour search backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherEngine {
    /// Approximate kd-tree search (FLANN). Faster, may miss neighbours.
    Flann,
    /// Exhaustive search. Exact.
    BruteForce,
}

impl MatcherEngine {
    fn opencv_name(self) -> &'static str {
        match self {
            MatcherEngine::Flann => "FlannBased",
            MatcherEngine::BruteForce => "BruteForce",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Lowe ratio: accept when best < ratio * second best.
    pub ratio_threshold: f32,
    /// Backend for matching tracked points against a new frame.
    pub engine: MatcherEngine,
    /// Backend for consecutive image pairs.
    pub pair_engine: MatcherEngine,
    /// RANSAC confidence of the epipolar verification.
    pub verify_confidence: f64,
    /// Epipolar inlier threshold in pixels.
    pub verify_threshold_px: f64,
    pub verify_max_iterations: i32,
    /// Fewest ratio-test survivors the essential-matrix fit accepts.
    pub min_matches: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            ratio_threshold: 0.7,
            engine: MatcherEngine::Flann,
            pair_engine: MatcherEngine::BruteForce,
            verify_confidence: 0.9999999999999999,
            verify_threshold_px: 1.0,
            verify_max_iterations: 1000,
            min_matches: 5,
        }
    }
}

/// Source of 2D-2D and 2D-3D correspondences for the reconstructor.
pub trait FeatureMatcher {
    /// Ratio-tested, epipolar-verified matches from `a` to `b`.
    fn match_pair(&self, a: &Frame, b: &Frame, camera: &CameraIntrinsics) -> Result<MatchSet>;

    /// Match tracked-point descriptors (one row per track) against `frame`.
    /// Returns `(track_idx, keypoint_idx)` pairs.
    fn match_3d_2d(&self, tracked_descriptors: &Mat, frame: &Frame) -> Result<Vec<(usize, usize)>>;
}

/// One OpenCV `DescriptorMatcher` and the backend it was created for.
struct Backend {
    engine: MatcherEngine,
    matcher: Ptr<DescriptorMatcher>,
}

impl Backend {
    fn new(engine: MatcherEngine) -> Result<Self> {
        let matcher = DescriptorMatcher::create(engine.opencv_name())?;
        Ok(Self { engine, matcher })
    }

    /// Two nearest neighbours per query row, filtered by the ratio test.
    fn knn_ratio(&self, query: &Mat, train: &Mat, ratio: f32) -> Result<Vec<DMatch>> {
        if query.empty() || train.empty() {
            return Ok(Vec::new());
        }
        let query_f32 = self.float_copy(query)?;
        let train_f32 = self.float_copy(train)?;
        let query = query_f32.as_ref().unwrap_or(query);
        let train = train_f32.as_ref().unwrap_or(train);

        let mut knn = Vector::<Vector<DMatch>>::new();
        self.matcher
            .knn_train_match(query, train, &mut knn, 2, &Mat::default(), false)?;

        Ok(ratio_test(&knn, ratio))
    }

    /// FLANN's kd-tree index only accepts float descriptors. `None` when
    /// the input can be used as is.
    fn float_copy(&self, descriptors: &Mat) -> Result<Option<Mat>> {
        if self.engine != MatcherEngine::Flann || descriptors.depth() == CV_32F {
            return Ok(None);
        }
        let mut converted = Mat::default();
        descriptors.convert_to(&mut converted, CV_32F, 1.0, 0.0)?;
        Ok(Some(converted))
    }
}

/// `FeatureMatcher` backed by OpenCV `DescriptorMatcher`s, one for image
/// pairs and one for tracked points.
pub struct OpenCvMatcher {
    config: MatchingConfig,
    pair: Backend,
    tracks: Backend,
}

impl OpenCvMatcher {
    pub fn new(config: MatchingConfig) -> Result<Self> {
        let pair = Backend::new(config.pair_engine)?;
        let tracks = Backend::new(config.engine)?;
        Ok(Self {
            config,
            pair,
            tracks,
        })
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }
}

impl FeatureMatcher for OpenCvMatcher {
    fn match_pair(&self, a: &Frame, b: &Frame, camera: &CameraIntrinsics) -> Result<MatchSet> {
        let candidates = self
            .pair
            .knn_ratio(&a.descriptors, &b.descriptors, self.config.ratio_threshold)?;
        if candidates.len() < self.config.min_matches {
            return Err(SfmError::InsufficientMatches {
                found: candidates.len(),
                required: self.config.min_matches,
            });
        }

        let idx_a: Vec<usize> = candidates.iter().map(|m| m.query_idx as usize).collect();
        let idx_b: Vec<usize> = candidates.iter().map(|m| m.train_idx as usize).collect();

        // Discard candidates inconsistent with the epipolar geometry
        let params = EssentialParams {
            confidence: self.config.verify_confidence,
            threshold_px: self.config.verify_threshold_px,
            max_iterations: self.config.verify_max_iterations,
        };
        let fit = find_essential(&a.points_at(&idx_a), &b.points_at(&idx_b), camera, &params)?;

        let verified = MatchSet::from_pairs(
            idx_a
                .into_iter()
                .zip(idx_b)
                .zip(&fit.inliers)
                .filter_map(|(pair, &inlier)| inlier.then_some(pair)),
        );

        debug!(
            "match_pair {} -> {}: {} ratio-test candidates, {} verified",
            a.id,
            b.id,
            candidates.len(),
            verified.len()
        );
        Ok(verified)
    }

    fn match_3d_2d(&self, tracked_descriptors: &Mat, frame: &Frame) -> Result<Vec<(usize, usize)>> {
        let matches = self.tracks.knn_ratio(
            tracked_descriptors,
            &frame.descriptors,
            self.config.ratio_threshold,
        )?;
        Ok(matches
            .iter()
            .map(|m| (m.query_idx as usize, m.train_idx as usize))
            .collect())
    }
}

/// Keep the best neighbour of each query when it beats the second best by
/// `ratio`. Queries with fewer than two neighbours are dropped.
pub fn ratio_test(knn: &Vector<Vector<DMatch>>, ratio: f32) -> Vec<DMatch> {
    knn.iter()
        .filter_map(|pair| {
            if pair.len() < 2 {
                return None;
            }
            let best = pair.get(0).ok()?;
            let second = pair.get(1).ok()?;
            (best.distance < ratio * second.distance).then_some(best)
        })
        .collect()
}

/// Compute and store verified matches for every consecutive frame pair that
/// does not have them yet.
pub fn match_sequence<M: FeatureMatcher + ?Sized>(
    matcher: &M,
    frames: &mut [Frame],
    camera: &CameraIntrinsics,
) -> Result<()> {
    for i in 0..frames.len().saturating_sub(1) {
        if frames[i].matches_to_next.is_some() {
            continue;
        }
        let matches = matcher
            .match_pair(&frames[i], &frames[i + 1], camera)
            .map_err(|e| e.at(i + 1, Stage::MatchPair))?;
        info!("Feature matching {} / {}, good matches {}", i, i + 1, matches.len());
        frames[i].matches_to_next = Some(matches);
    }
    Ok(())
}

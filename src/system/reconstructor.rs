//! The reconstruction loop.
//!
//! Frames are processed strictly in order. Transition `i` (frames i-1 and
//! i) poses frame i, triangulates the verified matches of the pair, appends
//! the survivors to the cloud and makes them the active set for
//! transition i+1. After the last transition the whole reconstruction is
//! bundle-adjusted; a failed refinement keeps the unrefined result.

use std::path::Path;
use std::sync::Arc;

use nalgebra::{Point2, Vector3};
use tracing::{info, warn};

use crate::camera::CameraIntrinsics;
use crate::config::SfmConfig;
use crate::error::{RefineError, Result, SfmError, Stage};
use crate::features::{FeatureMatcher, Frame, MatchSet, check_indices};
use crate::geometry::Pose;
use crate::io::write_ply;
use crate::mapping::{CloudHandle, PointCloud, TrackStore, Triangulator};
use crate::optimizer::{BundleAdjustmentRefiner, RefinementOutcome, apply_solution, collect_problem};
use crate::tracking::{PipelineState, PoseEstimator, RunStats, TransitionReport};

/// Result of a completed run.
pub struct Reconstruction {
    pub cloud: PointCloud,
    /// World-to-camera pose per frame.
    pub poses: Vec<Pose>,
    pub stats: RunStats,
    pub refinement: RefinementOutcome,
}

impl Reconstruction {
    /// Write the cloud as binary PLY, one vertex per point in cloud order.
    pub fn save_point_cloud(&self, path: impl AsRef<Path>) -> Result<()> {
        write_ply(path, self.cloud.iter())?;
        Ok(())
    }

    /// Refinement was attempted and discarded.
    pub fn refinement_warning(&self) -> bool {
        self.refinement.warning()
    }
}

pub struct Reconstructor<M: FeatureMatcher, R: BundleAdjustmentRefiner> {
    frames: Vec<Frame>,
    camera: CameraIntrinsics,
    matcher: M,
    refiner: R,
    estimator: PoseEstimator,
    triangulator: Triangulator,
    store: TrackStore,
    state: PipelineState,
    refine_enabled: bool,
    stats: RunStats,
}

impl<M: FeatureMatcher, R: BundleAdjustmentRefiner> Reconstructor<M, R> {
    pub fn new(
        frames: Vec<Frame>,
        camera: CameraIntrinsics,
        matcher: M,
        refiner: R,
        config: &SfmConfig,
    ) -> Self {
        Self {
            frames,
            camera,
            matcher,
            refiner,
            estimator: PoseEstimator::new(config.pose.clone()),
            triangulator: Triangulator::new(config.triangulation.clone()),
            store: TrackStore::new(),
            state: PipelineState::FirstPair,
            refine_enabled: config.bundle_adjustment.enabled,
            stats: RunStats::default(),
        }
    }

    /// Publish cloud snapshots into `handle` (e.g. one a viewer watches).
    pub fn with_cloud_handle(mut self, handle: Arc<CloudHandle>) -> Self {
        self.store = TrackStore::with_handle(handle);
        self
    }

    pub fn cloud_handle(&self) -> Arc<CloudHandle> {
        self.store.handle()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Process every frame, then refine.
    pub fn run(mut self) -> Result<Reconstruction> {
        let n = self.frames.len();
        if n < 2 {
            return Err(SfmError::NotEnoughFrames(n));
        }

        for i in 1..n {
            let report = self.process_transition(i)?;
            info!(
                "Frame {} / {}: {} matches, {} new points ({} discarded), cloud size {}",
                i,
                n - 1,
                report.matches,
                report.triangulated,
                report.discarded,
                self.store.len()
            );
            self.stats.transitions.push(report);
            self.state = PipelineState::after(i, n);
        }

        self.stats.relative_pose_calls = self.estimator.relative_calls();
        self.stats.absolute_pose_calls = self.estimator.absolute_calls();

        let refinement = self.refine();
        info!(
            "Reconstruction finished: {} frames, {} points, {} discarded",
            n,
            self.store.len(),
            self.stats.discarded()
        );

        let poses = self
            .frames
            .iter()
            .map(|f| f.pose().cloned().ok_or(SfmError::MissingProjection { frame: f.id }))
            .collect::<Result<Vec<_>>>()?;

        Ok(Reconstruction {
            cloud: self.store.into_cloud(),
            poses,
            stats: self.stats,
            refinement,
        })
    }

    /// Run and, only on success, write the cloud to `path`.
    pub fn run_to_file(self, path: impl AsRef<Path>) -> Result<Reconstruction> {
        let reconstruction = self.run()?;
        reconstruction.save_point_cloud(&path)?;
        info!("Point cloud saved to {}", path.as_ref().display());
        Ok(reconstruction)
    }

    fn process_transition(&mut self, i: usize) -> Result<TransitionReport> {
        let matches = self.pair_matches(i)?;
        let state = self.state;

        let (correspondences, pose_inliers) = match state {
            PipelineState::FirstPair => {
                let (current, other) = self.pair_points(i, &matches);
                let relative = self
                    .estimator
                    .relative_pose(&current, &other, &self.camera)
                    .map_err(|e| e.at(i, Stage::RelativePose))?;

                self.set_pose(i - 1, Pose::identity());
                self.set_pose(i, relative.pose);
                (0, relative.inliers)
            }
            PipelineState::Incremental => self.absolute_step(i)?,
            PipelineState::Done => unreachable!("no transitions remain after Done"),
        };

        let triangulated = self
            .triangulator
            .triangulate(&self.frames[i - 1], &self.frames[i], &matches)
            .map_err(|e| e.at(i, Stage::Triangulation))?;
        let discarded = triangulated.discarded;
        let added = self.store.commit(triangulated.points);

        Ok(TransitionReport {
            frame: i,
            state,
            matches: matches.len(),
            correspondences,
            pose_inliers,
            triangulated: added,
            discarded,
        })
    }

    /// Stored matches of (i-1, i), computed through the matcher when absent.
    fn pair_matches(&mut self, i: usize) -> Result<MatchSet> {
        let matches = match &self.frames[i - 1].matches_to_next {
            Some(matches) => matches.clone(),
            None => {
                let matches = self
                    .matcher
                    .match_pair(&self.frames[i - 1], &self.frames[i], &self.camera)
                    .map_err(|e| e.at(i, Stage::MatchPair))?;
                self.frames[i - 1].matches_to_next = Some(matches.clone());
                matches
            }
        };
        matches
            .check_bounds(self.frames[i - 1].keypoints.len(), self.frames[i].keypoints.len())
            .map_err(|e| e.at(i, Stage::MatchPair))?;
        Ok(matches)
    }

    fn pair_points(&self, i: usize, matches: &MatchSet) -> (Vec<Point2<f64>>, Vec<Point2<f64>>) {
        (
            self.frames[i - 1].points_at(matches.current()),
            self.frames[i].points_at(matches.other()),
        )
    }

    /// Pose frame i against the points of the previous transition.
    fn absolute_step(&mut self, i: usize) -> Result<(usize, usize)> {
        let tracked = self
            .frames[i - 1]
            .descriptor_rows(&self.store.active_keypoints())
            .map_err(|e| e.at(i, Stage::Match3d2d))?;
        let pairs = self
            .matcher
            .match_3d_2d(&tracked, &self.frames[i])
            .map_err(|e| e.at(i, Stage::Match3d2d))?;

        let active = self.store.active();
        let keypoints = self.frames[i].keypoints.len();
        check_indices(pairs.iter().map(|&(t, _)| t), active.len())
            .and_then(|_| check_indices(pairs.iter().map(|&(_, k)| k), keypoints))
            .map_err(|e| e.at(i, Stage::Match3d2d))?;
        let points3d: Vec<Vector3<f64>> = pairs.iter().map(|&(t, _)| active[t].position).collect();
        let points2d: Vec<Point2<f64>> = pairs
            .iter()
            .map(|&(_, k)| self.frames[i].keypoints[k])
            .collect();

        let previous = self.frames[i - 1]
            .pose()
            .cloned()
            .ok_or(SfmError::MissingProjection { frame: i - 1 })?;
        let estimate = self
            .estimator
            .absolute_pose(&points3d, &points2d, &self.camera, &previous)
            .map_err(|e| e.at(i, Stage::AbsolutePose))?;

        self.set_pose(i, estimate.pose);
        Ok((pairs.len(), estimate.num_inliers))
    }

    fn set_pose(&mut self, frame: usize, pose: Pose) {
        self.store.record_camera(pose.center());
        self.frames[frame].set_pose(pose, &self.camera);
    }

    fn refine(&mut self) -> RefinementOutcome {
        if !self.refine_enabled {
            return RefinementOutcome::Skipped;
        }

        let attempt = collect_problem(&self.frames, self.store.cloud(), &self.camera)
            .and_then(|problem| self.refiner.refine(&problem));

        let outcome = match attempt {
            Ok(solution) => {
                if apply_solution(&solution, &mut self.frames, &mut self.store, &self.camera) {
                    RefinementOutcome::Refined {
                        iterations: solution.iterations,
                        initial_error: solution.initial_error,
                        final_error: solution.final_error,
                    }
                } else {
                    RefinementOutcome::Failed(RefineError::Mismatch(format!(
                        "{} poses / {} points for {} frames / {} points",
                        solution.poses.len(),
                        solution.points.len(),
                        self.frames.len(),
                        self.store.len()
                    )))
                }
            }
            Err(e) => RefinementOutcome::Failed(e),
        };

        if let RefinementOutcome::Failed(e) = &outcome {
            warn!("Bundle adjustment failed ({}); keeping the unrefined cloud", e);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{MatcherEngine, MatchingConfig, OpenCvMatcher};
    use crate::optimizer::{BaProblem, BaSolution, BundleAdjustmentConfig, LmBundleAdjuster};
    use crate::test_utils::{SyntheticScene, descriptor_mat, random_descriptors};
    use approx::assert_relative_eq;

    fn matcher() -> OpenCvMatcher {
        OpenCvMatcher::new(MatchingConfig {
            engine: MatcherEngine::BruteForce,
            ..MatchingConfig::default()
        })
        .unwrap()
    }

    fn config(refine: bool) -> SfmConfig {
        let mut config = SfmConfig::default();
        config.bundle_adjustment.enabled = refine;
        config
    }

    fn scene_frames(n_points: usize, n_frames: usize, seed: u64) -> (SyntheticScene, Vec<Frame>) {
        let scene = SyntheticScene::new(n_points, n_frames, seed);
        let mut frames = scene.frames();
        scene.store_identity_matches(&mut frames);
        (scene, frames)
    }

    fn lm() -> LmBundleAdjuster {
        LmBundleAdjuster::new(BundleAdjustmentConfig::default())
    }

    struct FailingRefiner(RefineError);

    impl BundleAdjustmentRefiner for FailingRefiner {
        fn refine(&self, _: &BaProblem) -> std::result::Result<BaSolution, RefineError> {
            Err(self.0.clone())
        }
    }

    /// Delegates pair matching and reports one track against a keypoint
    /// the frame does not have.
    struct OutOfRangeMatcher(OpenCvMatcher);

    impl FeatureMatcher for OutOfRangeMatcher {
        fn match_pair(&self, a: &Frame, b: &Frame, camera: &CameraIntrinsics) -> Result<MatchSet> {
            self.0.match_pair(a, b, camera)
        }

        fn match_3d_2d(&self, _: &opencv::core::Mat, frame: &Frame) -> Result<Vec<(usize, usize)>> {
            Ok(vec![(0, frame.keypoints.len())])
        }
    }

    /// Returns a solution that no longer matches the cloud.
    struct TruncatingRefiner;

    impl BundleAdjustmentRefiner for TruncatingRefiner {
        fn refine(&self, problem: &BaProblem) -> std::result::Result<BaSolution, RefineError> {
            Ok(BaSolution {
                poses: problem.poses.clone(),
                points: problem.points[1..].to_vec(),
                iterations: 1,
                initial_error: 0.0,
                final_error: 0.0,
                converged: true,
            })
        }
    }

    #[test]
    fn test_two_frames_use_only_relative_pose() {
        let (scene, frames) = scene_frames(40, 2, 41);
        let result = Reconstructor::new(frames, scene.camera.clone(), matcher(), lm(), &config(false))
            .run()
            .unwrap();

        assert_eq!(result.stats.relative_pose_calls, 1);
        assert_eq!(result.stats.absolute_pose_calls, 0);
        assert_eq!(result.cloud.len(), 40);
        assert_eq!(result.poses[0], Pose::identity());
        assert_eq!(result.refinement, RefinementOutcome::Skipped);
    }

    #[test]
    fn test_three_frames_use_one_absolute_pose() {
        let (scene, frames) = scene_frames(40, 3, 42);
        let result = Reconstructor::new(frames, scene.camera.clone(), matcher(), lm(), &config(false))
            .run()
            .unwrap();

        assert_eq!(result.stats.relative_pose_calls, 1);
        assert_eq!(result.stats.absolute_pose_calls, 1);
        assert_eq!(result.stats.transitions[1].correspondences, 40);
        assert_eq!(result.stats.transitions[1].state, PipelineState::Incremental);
    }

    #[test]
    fn test_cloud_is_union_of_transitions() {
        let (scene, frames) = scene_frames(30, 4, 43);
        let result = Reconstructor::new(frames, scene.camera.clone(), matcher(), lm(), &config(false))
            .run()
            .unwrap();

        assert_eq!(result.cloud.len(), result.stats.triangulated());
        for report in &result.stats.transitions {
            let owned = result.cloud.iter().filter(|p| p.frame == report.frame).count();
            assert_eq!(owned, report.triangulated);
        }
        // Cloud order follows transition order.
        assert!(result.cloud.points().windows(2).all(|w| w[0].frame <= w[1].frame));
    }

    #[test]
    fn test_recovered_trajectory_matches_scene_up_to_scale() {
        let (scene, frames) = scene_frames(50, 4, 44);
        let result = Reconstructor::new(frames, scene.camera.clone(), matcher(), lm(), &config(false))
            .run()
            .unwrap();

        // The first baseline is normalised to 1.
        let scale = scene.poses[1].center().norm();
        for (pose, truth) in result.poses.iter().zip(&scene.poses) {
            assert_relative_eq!(pose.center() * scale, truth.center(), epsilon = 1e-3);
        }
    }

    #[test]
    fn test_matches_are_computed_when_missing() {
        let scene = SyntheticScene::new(40, 2, 45);
        let frames = scene.frames();
        let result = Reconstructor::new(frames, scene.camera.clone(), matcher(), lm(), &config(false))
            .run()
            .unwrap();
        assert_eq!(result.stats.transitions[0].matches, 40);
    }

    #[test]
    fn test_too_few_correspondences_aborts_without_output() {
        let (scene, mut frames) = scene_frames(30, 3, 46);
        // Only five tracked descriptors reappear in frame 2.
        let mut rows = scene.descriptors[..5].to_vec();
        rows.extend(random_descriptors(25, 99));
        frames[2].descriptors = descriptor_mat(&rows);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("point_cloud.ply");
        let err = Reconstructor::new(frames, scene.camera.clone(), matcher(), lm(), &config(true))
            .run_to_file(&path)
            .err()
            .unwrap();

        assert!(matches!(
            err,
            SfmError::Transition { frame: 2, stage: Stage::AbsolutePose, .. }
        ));
        assert!(matches!(
            err.root(),
            SfmError::InsufficientCorrespondences { found: 5, required: 6 }
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_single_frame_is_rejected() {
        let (scene, frames) = scene_frames(10, 1, 47);
        let err = Reconstructor::new(frames, scene.camera.clone(), matcher(), lm(), &config(false))
            .run()
            .err()
            .unwrap();
        assert!(matches!(err, SfmError::NotEnoughFrames(1)));
    }

    #[test]
    fn test_refinement_failure_keeps_unrefined_cloud() {
        let (scene, frames) = scene_frames(30, 3, 48);
        let baseline = Reconstructor::new(
            frames,
            scene.camera.clone(),
            matcher(),
            lm(),
            &config(false),
        )
        .run()
        .unwrap();

        let (_, frames) = scene_frames(30, 3, 48);
        let failed = Reconstructor::new(
            frames,
            scene.camera.clone(),
            matcher(),
            FailingRefiner(RefineError::NotConverged { iterations: 3 }),
            &config(true),
        )
        .run()
        .unwrap();

        assert!(failed.refinement_warning());
        assert_eq!(failed.cloud.len(), baseline.cloud.len());
        for (a, b) in failed.cloud.iter().zip(baseline.cloud.iter()) {
            assert_relative_eq!(a.position, b.position, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_mismatched_solution_is_rejected() {
        let (scene, frames) = scene_frames(20, 2, 49);
        let result = Reconstructor::new(
            frames,
            scene.camera.clone(),
            matcher(),
            TruncatingRefiner,
            &config(true),
        )
        .run()
        .unwrap();

        assert!(matches!(
            result.refinement,
            RefinementOutcome::Failed(RefineError::Mismatch(_))
        ));
        assert_eq!(result.cloud.len(), 20);
    }

    #[test]
    fn test_refined_run_writes_ply() {
        let (scene, frames) = scene_frames(30, 3, 50);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("point_cloud.ply");

        let result = Reconstructor::new(frames, scene.camera.clone(), matcher(), lm(), &config(true))
            .run_to_file(&path)
            .unwrap();

        assert!(matches!(result.refinement, RefinementOutcome::Refined { .. }));
        let vertices = crate::io::read_ply(&path).unwrap();
        assert_eq!(vertices.len(), result.cloud.len());
    }

    #[test]
    fn test_snapshots_follow_the_run() {
        let (scene, frames) = scene_frames(20, 3, 51);
        let handle = CloudHandle::new();
        let result = Reconstructor::new(frames, scene.camera.clone(), matcher(), lm(), &config(false))
            .with_cloud_handle(Arc::clone(&handle))
            .run()
            .unwrap();

        let snapshot = handle.load();
        assert_eq!(snapshot.points.len(), result.cloud.len());
        assert_eq!(snapshot.camera_centers.len(), 3);
    }

    #[test]
    fn test_out_of_range_track_match_is_a_transition_error() {
        let (scene, frames) = scene_frames(30, 3, 52);
        let err = Reconstructor::new(
            frames,
            scene.camera.clone(),
            OutOfRangeMatcher(matcher()),
            lm(),
            &config(false),
        )
        .run()
        .err()
        .unwrap();

        assert!(matches!(
            err,
            SfmError::Transition { frame: 2, stage: Stage::Match3d2d, .. }
        ));
        assert!(matches!(
            err.root(),
            SfmError::InvalidMatch { index: 30, len: 30 }
        ));
    }

    #[test]
    fn test_out_of_range_stored_match_is_a_transition_error() {
        let (scene, mut frames) = scene_frames(20, 2, 53);
        frames[0].matches_to_next = Some(MatchSet::from_pairs((0..20).map(|k| (k, k + 1))));

        let err = Reconstructor::new(frames, scene.camera.clone(), matcher(), lm(), &config(false))
            .run()
            .err()
            .unwrap();

        assert!(matches!(
            err,
            SfmError::Transition { frame: 1, stage: Stage::MatchPair, .. }
        ));
        assert!(matches!(
            err.root(),
            SfmError::InvalidMatch { index: 20, len: 20 }
        ));
    }
}

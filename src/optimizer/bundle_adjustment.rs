//! Bundle adjustment over the finished reconstruction.
//!
//! Three phases: collect the problem from frames and cloud, solve it with a
//! block Levenberg-Marquardt, and apply the refined poses and points. Frame
//! 0 is held fixed as the gauge anchor.
//!
//! Every track point has exactly two observations (the frames of the
//! transition that created it), so instead of one dense system the solver
//! alternates between independent 3x3 point blocks and 6x6 camera blocks.
//! A step is only accepted if it lowers the total cost, so the final cost
//! never exceeds the initial one.

use nalgebra::{Matrix2x3, Matrix2x6, Matrix3, Matrix6, Rotation3, Vector2, Vector3, Vector6};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::camera::CameraIntrinsics;
use crate::error::RefineError;
use crate::features::Frame;
use crate::geometry::{Pose, skew};
use crate::mapping::{PointCloud, TrackStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleAdjustmentConfig {
    pub enabled: bool,
    pub max_iterations: usize,
    /// Converged when the relative cost decrease of an iteration falls
    /// below this.
    pub function_tolerance: f64,
    /// Converged when the largest parameter step falls below this.
    pub param_tolerance: f64,
    /// Converged when the gradient norm falls below this.
    pub gradient_tolerance: f64,
    /// Huber kernel threshold (pixels).
    pub huber_threshold: f64,
    /// Initial LM damping.
    pub initial_damping: f64,
    /// Treat hitting `max_iterations` as a failure.
    pub require_convergence: bool,
}

impl Default for BundleAdjustmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: 50,
            function_tolerance: 1e-6,
            param_tolerance: 1e-8,
            gradient_tolerance: 1e-8,
            huber_threshold: 5.991_f64.sqrt(),
            initial_damping: 1e-3,
            require_convergence: false,
        }
    }
}

/// One pixel observation of `point` in camera `camera`.
#[derive(Debug, Clone, Copy)]
pub struct BaObservation {
    pub camera: usize,
    pub point: usize,
    pub uv: Vector2<f64>,
}

#[derive(Debug, Clone)]
pub struct BaProblem {
    pub camera: CameraIntrinsics,
    /// World-to-camera pose per frame, indexed by frame id.
    pub poses: Vec<Pose>,
    pub points: Vec<Vector3<f64>>,
    pub observations: Vec<BaObservation>,
    /// The first `fixed_cameras` poses are not optimized.
    pub fixed_cameras: usize,
}

#[derive(Debug, Clone)]
pub struct BaSolution {
    pub poses: Vec<Pose>,
    pub points: Vec<Vector3<f64>>,
    pub iterations: usize,
    /// RMS of the robust reprojection cost, in pixels.
    pub initial_error: f64,
    pub final_error: f64,
    pub converged: bool,
}

/// Joint refinement of camera poses and points.
pub trait BundleAdjustmentRefiner {
    fn refine(&self, problem: &BaProblem) -> Result<BaSolution, RefineError>;
}

/// What refinement did to a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RefinementOutcome {
    /// Disabled in the configuration.
    Skipped,
    Refined {
        iterations: usize,
        initial_error: f64,
        final_error: f64,
    },
    /// The unrefined cloud was kept.
    Failed(RefineError),
}

impl RefinementOutcome {
    /// Set when refinement was attempted but its result discarded.
    pub fn warning(&self) -> bool {
        matches!(self, RefinementOutcome::Failed(_))
    }
}

/// PHASE 1: build the problem from posed frames and the cloud.
pub fn collect_problem(
    frames: &[Frame],
    cloud: &PointCloud,
    camera: &CameraIntrinsics,
) -> Result<BaProblem, RefineError> {
    if cloud.is_empty() {
        return Err(RefineError::EmptyProblem("the cloud has no points".into()));
    }

    let poses = frames
        .iter()
        .map(|f| {
            f.pose()
                .cloned()
                .ok_or_else(|| RefineError::EmptyProblem(format!("frame {} has no pose", f.id)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut points = Vec::with_capacity(cloud.len());
    let mut observations = Vec::with_capacity(cloud.len() * 2);
    for (idx, track) in cloud.iter().enumerate() {
        if track.frame == 0 || track.frame >= frames.len() {
            return Err(RefineError::EmptyProblem(format!(
                "point {} references frame {} outside the run",
                idx, track.frame
            )));
        }
        let (Some(source), Some(target)) = (
            frames[track.frame - 1].keypoints.get(track.source_keypoint),
            frames[track.frame].keypoints.get(track.keypoint),
        ) else {
            return Err(RefineError::Mismatch(format!(
                "point {} references a keypoint outside frame {} or {}",
                idx,
                track.frame - 1,
                track.frame
            )));
        };

        points.push(track.position);
        observations.push(BaObservation {
            camera: track.frame - 1,
            point: idx,
            uv: source.coords,
        });
        observations.push(BaObservation {
            camera: track.frame,
            point: idx,
            uv: target.coords,
        });
    }

    Ok(BaProblem {
        camera: camera.clone(),
        poses,
        points,
        observations,
        fixed_cameras: 1,
    })
}

/// PHASE 3: write a solution back. Returns false if the cloud rejected the
/// point update (length mismatch), in which case nothing was changed.
pub fn apply_solution(
    solution: &BaSolution,
    frames: &mut [Frame],
    store: &mut TrackStore,
    camera: &CameraIntrinsics,
) -> bool {
    if solution.poses.len() != frames.len() || !store.relocate(&solution.points) {
        return false;
    }
    for (frame, pose) in frames.iter_mut().zip(&solution.poses) {
        frame.set_pose(pose.clone(), camera);
    }
    store.replace_camera_centers(solution.poses.iter().map(Pose::center).collect());
    true
}

/// PHASE 2 solver: alternating block Levenberg-Marquardt with a Huber
/// kernel.
pub struct LmBundleAdjuster {
    config: BundleAdjustmentConfig,
}

impl LmBundleAdjuster {
    pub fn new(config: BundleAdjustmentConfig) -> Self {
        Self { config }
    }
}

impl BundleAdjustmentRefiner for LmBundleAdjuster {
    fn refine(&self, problem: &BaProblem) -> Result<BaSolution, RefineError> {
        if problem.observations.is_empty() || problem.points.is_empty() {
            return Err(RefineError::EmptyProblem("no observations".into()));
        }
        let n_obs = problem.observations.len() as f64;

        let mut poses = problem.poses.clone();
        let mut points = problem.points.clone();

        let initial_cost = total_cost(problem, &poses, &points, self.config.huber_threshold);
        if !initial_cost.is_finite() {
            return Err(RefineError::NonFinite);
        }

        let mut cost = initial_cost;
        let mut lambda_points = self.config.initial_damping;
        let mut lambda_poses = self.config.initial_damping;
        let mut iterations = 0;
        let mut converged = false;

        for iter in 0..self.config.max_iterations {
            iterations = iter + 1;
            let start_cost = cost;

            // Points, cameras fixed.
            let (point_steps, point_grad) = point_blocks(
                problem,
                &poses,
                &points,
                self.config.huber_threshold,
                lambda_points,
            );
            let trial: Vec<Vector3<f64>> = points
                .iter()
                .zip(&point_steps)
                .map(|(p, d)| p + d)
                .collect();
            let trial_cost = total_cost(problem, &poses, &trial, self.config.huber_threshold);
            let mut max_step = 0.0_f64;
            if trial_cost < cost {
                points = trial;
                cost = trial_cost;
                lambda_points = (lambda_points * 0.1).max(1e-10);
                max_step = point_steps.iter().map(|d| d.amax()).fold(max_step, f64::max);
            } else {
                lambda_points = (lambda_points * 10.0).min(1e10);
            }

            // Cameras, points fixed.
            let (pose_steps, pose_grad) =
                pose_blocks(problem, &poses, &points, self.config.huber_threshold, lambda_poses);
            let trial: Vec<Pose> = poses
                .iter()
                .zip(&pose_steps)
                .map(|(pose, d)| apply_pose_step(pose, d))
                .collect();
            let trial_cost = total_cost(problem, &trial, &points, self.config.huber_threshold);
            if trial_cost < cost {
                poses = trial;
                cost = trial_cost;
                lambda_poses = (lambda_poses * 0.1).max(1e-10);
                max_step = pose_steps.iter().map(|d| d.amax()).fold(max_step, f64::max);
            } else {
                lambda_poses = (lambda_poses * 10.0).min(1e10);
            }

            if !cost.is_finite() {
                return Err(RefineError::NonFinite);
            }

            let gradient = (point_grad + pose_grad).sqrt();
            let decrease = (start_cost - cost) / start_cost.max(f64::MIN_POSITIVE);
            debug!(
                "BA iteration {}: cost {:.6} -> {:.6}, |g| {:.3e}",
                iterations, start_cost, cost, gradient
            );

            if gradient < self.config.gradient_tolerance
                || (max_step > 0.0 && max_step < self.config.param_tolerance)
                || (cost < start_cost && decrease < self.config.function_tolerance)
                || cost == 0.0
            {
                converged = true;
                break;
            }
        }

        let initial_error = (initial_cost / n_obs).sqrt();
        let final_error = (cost / n_obs).sqrt();

        if !points.iter().all(|p| p.iter().all(|v| v.is_finite())) {
            return Err(RefineError::NonFinite);
        }
        if !converged && self.config.require_convergence {
            return Err(RefineError::NotConverged { iterations });
        }

        info!(
            "Bundle adjustment: {} iterations, error {:.4} -> {:.4} px{}",
            iterations,
            initial_error,
            final_error,
            if converged { "" } else { " (iteration limit)" }
        );

        Ok(BaSolution {
            poses,
            points,
            iterations,
            initial_error,
            final_error,
            converged,
        })
    }
}

/// Sum of Huber costs of all reprojection residuals.
fn total_cost(problem: &BaProblem, poses: &[Pose], points: &[Vector3<f64>], huber: f64) -> f64 {
    problem
        .observations
        .iter()
        .map(|obs| {
            let p_cam = poses[obs.camera].transform_point(&points[obs.point]);
            match residual(&problem.camera, &p_cam, &obs.uv) {
                Some(e) => huber_cost(e.norm(), huber),
                // Behind the camera: flat penalty so steps that cross the
                // image plane are rejected.
                None => huber_cost(1e3, huber),
            }
        })
        .sum()
}

/// Predicted minus observed pixel, or `None` behind the camera.
fn residual(camera: &CameraIntrinsics, p_cam: &Vector3<f64>, uv: &Vector2<f64>) -> Option<Vector2<f64>> {
    camera.project(p_cam).map(|p| p.coords - uv)
}

fn huber_cost(norm: f64, k: f64) -> f64 {
    if norm <= k {
        norm * norm
    } else {
        2.0 * k * norm - k * k
    }
}

fn huber_weight(norm: f64, k: f64) -> f64 {
    if norm <= k { 1.0 } else { k / norm }
}

/// d(pixel)/d(camera-frame point).
fn projection_jacobian(camera: &CameraIntrinsics, p_cam: &Vector3<f64>) -> Matrix2x3<f64> {
    let inv_z = 1.0 / p_cam.z;
    let inv_z2 = inv_z * inv_z;
    Matrix2x3::new(
        camera.fx * inv_z,
        0.0,
        -camera.fx * p_cam.x * inv_z2,
        0.0,
        camera.fy * inv_z,
        -camera.fy * p_cam.y * inv_z2,
    )
}

/// Damped Gauss-Newton step for every point. Returns the steps and the
/// squared norm of the point gradient.
fn point_blocks(
    problem: &BaProblem,
    poses: &[Pose],
    points: &[Vector3<f64>],
    huber: f64,
    lambda: f64,
) -> (Vec<Vector3<f64>>, f64) {
    let mut h = vec![Matrix3::<f64>::zeros(); points.len()];
    let mut g = vec![Vector3::<f64>::zeros(); points.len()];

    for obs in &problem.observations {
        let pose = &poses[obs.camera];
        let p_cam = pose.transform_point(&points[obs.point]);
        let Some(e) = residual(&problem.camera, &p_cam, &obs.uv) else {
            continue;
        };
        let w = huber_weight(e.norm(), huber);
        let j = projection_jacobian(&problem.camera, &p_cam) * pose.rotation.matrix();
        h[obs.point] += w * j.transpose() * j;
        g[obs.point] += w * j.transpose() * e;
    }

    let grad_sq = g.iter().map(|v| v.norm_squared()).sum();
    let steps = h
        .iter()
        .zip(&g)
        .map(|(h, g)| {
            let mut damped = *h;
            for i in 0..3 {
                damped[(i, i)] += lambda * h[(i, i)].max(1e-6);
            }
            damped.lu().solve(&(-g)).unwrap_or_else(Vector3::zeros)
        })
        .collect();
    (steps, grad_sq)
}

/// Damped Gauss-Newton step `[ω, δt]` for every free camera (zero for fixed
/// ones), using a left perturbation of the world-to-camera pose.
fn pose_blocks(
    problem: &BaProblem,
    poses: &[Pose],
    points: &[Vector3<f64>],
    huber: f64,
    lambda: f64,
) -> (Vec<Vector6<f64>>, f64) {
    let mut h = vec![Matrix6::<f64>::zeros(); poses.len()];
    let mut g = vec![Vector6::<f64>::zeros(); poses.len()];

    for obs in &problem.observations {
        if obs.camera < problem.fixed_cameras {
            continue;
        }
        let p_cam = poses[obs.camera].transform_point(&points[obs.point]);
        let Some(e) = residual(&problem.camera, &p_cam, &obs.uv) else {
            continue;
        };
        let w = huber_weight(e.norm(), huber);
        let dproj = projection_jacobian(&problem.camera, &p_cam);

        let mut j = Matrix2x6::<f64>::zeros();
        j.fixed_view_mut::<2, 3>(0, 0).copy_from(&(dproj * -skew(&p_cam)));
        j.fixed_view_mut::<2, 3>(0, 3).copy_from(&dproj);

        h[obs.camera] += w * j.transpose() * j;
        g[obs.camera] += w * j.transpose() * e;
    }

    let grad_sq = g.iter().map(|v| v.norm_squared()).sum();
    let steps = h
        .iter()
        .zip(&g)
        .enumerate()
        .map(|(cam, (h, g))| {
            if cam < problem.fixed_cameras || g.iter().all(|v| *v == 0.0) {
                return Vector6::zeros();
            }
            let mut damped = *h;
            for i in 0..6 {
                damped[(i, i)] += lambda * h[(i, i)].max(1e-6);
            }
            damped.lu().solve(&(-g)).unwrap_or_else(Vector6::zeros)
        })
        .collect();
    (steps, grad_sq)
}

/// `exp(ω) * [R | t] + [0 | δt]`.
fn apply_pose_step(pose: &Pose, step: &Vector6<f64>) -> Pose {
    let omega = Rotation3::new(Vector3::new(step[0], step[1], step[2]));
    let delta_t = Vector3::new(step[3], step[4], step[5]);
    Pose::from_rt(
        omega.matrix() * pose.rotation.matrix(),
        omega * pose.translation + delta_t,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::SyntheticScene;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Two observations per point (frames f-1 and f), as produced by the
    /// reconstructor.
    fn scene_problem(scene: &SyntheticScene) -> BaProblem {
        let mut observations = Vec::new();
        let mut points = Vec::new();
        for frame in 1..scene.poses.len() {
            let prev = scene.observations(frame - 1);
            let cur = scene.observations(frame);
            for (k, p) in scene.points.iter().enumerate() {
                let idx = points.len();
                points.push(*p);
                observations.push(BaObservation {
                    camera: frame - 1,
                    point: idx,
                    uv: prev[k].coords,
                });
                observations.push(BaObservation {
                    camera: frame,
                    point: idx,
                    uv: cur[k].coords,
                });
            }
        }
        BaProblem {
            camera: scene.camera.clone(),
            poses: scene.poses.clone(),
            points,
            observations,
            fixed_cameras: 1,
        }
    }

    fn perturb_points(problem: &mut BaProblem, sigma: f64, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        for p in &mut problem.points {
            *p += Vector3::new(
                rng.gen_range(-sigma..sigma),
                rng.gen_range(-sigma..sigma),
                rng.gen_range(-sigma..sigma),
            );
        }
    }

    #[test]
    fn test_config_default() {
        let config = BundleAdjustmentConfig::default();
        assert!(config.enabled);
        assert!(!config.require_convergence);
        assert_eq!(config.max_iterations, 50);
    }

    #[test]
    fn test_refine_reduces_reprojection_error() {
        let scene = SyntheticScene::new(40, 3, 31);
        let mut problem = scene_problem(&scene);
        perturb_points(&mut problem, 0.05, 1);
        problem.poses[2].translation.x += 0.01;

        let solution = LmBundleAdjuster::new(BundleAdjustmentConfig::default())
            .refine(&problem)
            .unwrap();

        assert!(solution.initial_error > 0.5);
        assert!(solution.final_error < 0.1 * solution.initial_error);
        assert_eq!(solution.points.len(), problem.points.len());
        // Gauge anchor untouched.
        assert_eq!(solution.poses[0], problem.poses[0]);
    }

    #[test]
    fn test_exact_problem_converges_immediately() {
        let scene = SyntheticScene::new(20, 2, 32);
        let problem = scene_problem(&scene);

        let solution = LmBundleAdjuster::new(BundleAdjustmentConfig::default())
            .refine(&problem)
            .unwrap();
        assert!(solution.converged);
        assert!(solution.final_error < 1e-6);
    }

    #[test]
    fn test_empty_problem_fails() {
        let scene = SyntheticScene::new(5, 2, 33);
        let mut problem = scene_problem(&scene);
        problem.observations.clear();

        let err = LmBundleAdjuster::new(BundleAdjustmentConfig::default())
            .refine(&problem)
            .unwrap_err();
        assert!(matches!(err, RefineError::EmptyProblem(_)));
    }

    #[test]
    fn test_non_finite_input_fails() {
        let scene = SyntheticScene::new(5, 2, 34);
        let mut problem = scene_problem(&scene);
        problem.points[0].x = f64::NAN;

        let err = LmBundleAdjuster::new(BundleAdjustmentConfig::default())
            .refine(&problem)
            .unwrap_err();
        assert_eq!(err, RefineError::NonFinite);
    }

    #[test]
    fn test_iteration_limit_fails_when_convergence_required() {
        let scene = SyntheticScene::new(30, 3, 35);
        let mut problem = scene_problem(&scene);
        perturb_points(&mut problem, 0.05, 2);

        let config = BundleAdjustmentConfig {
            max_iterations: 1,
            function_tolerance: 0.0,
            param_tolerance: 0.0,
            gradient_tolerance: 0.0,
            require_convergence: true,
            ..BundleAdjustmentConfig::default()
        };
        let err = LmBundleAdjuster::new(config).refine(&problem).unwrap_err();
        assert_eq!(err, RefineError::NotConverged { iterations: 1 });
    }

    #[test]
    fn test_pose_step_stays_orthonormal() {
        let pose = Pose::from_axis_angle(Vector3::new(0.1, -0.2, 0.05), Vector3::new(1.0, 2.0, 3.0));
        let stepped = apply_pose_step(&pose, &Vector6::new(0.01, 0.02, -0.03, 0.1, 0.0, 0.0));
        let r = stepped.rotation.matrix();
        assert!((r.transpose() * r - Matrix3::identity()).norm() < 1e-12);
    }

    #[test]
    fn test_outcome_warning_flag() {
        assert!(RefinementOutcome::Failed(RefineError::NonFinite).warning());
        assert!(!RefinementOutcome::Skipped.warning());
    }

    #[test]
    fn test_collect_rejects_unknown_keypoint() {
        let scene = SyntheticScene::new(4, 2, 36);
        let mut frames = scene.frames();
        for (frame, pose) in frames.iter_mut().zip(&scene.poses) {
            frame.set_pose(pose.clone(), &scene.camera);
        }
        let cloud: PointCloud = [crate::mapping::TrackPoint {
            position: scene.points[0],
            color: 0,
            frame: 1,
            keypoint: 4,
            source_keypoint: 0,
        }]
        .into_iter()
        .collect();

        let err = collect_problem(&frames, &cloud, &scene.camera).unwrap_err();
        assert!(matches!(err, RefineError::Mismatch(_)));
    }

    #[test]
    fn test_refined_cost_never_exceeds_initial() {
        let scene = SyntheticScene::new(25, 3, 37);
        let mut problem = scene_problem(&scene);
        perturb_points(&mut problem, 0.5, 3);
        problem.poses[1].translation.y -= 0.2;

        let solution = LmBundleAdjuster::new(BundleAdjustmentConfig {
            max_iterations: 5,
            ..BundleAdjustmentConfig::default()
        })
        .refine(&problem)
        .unwrap();
        assert!(solution.final_error <= solution.initial_error);
    }
}

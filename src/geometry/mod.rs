//! Geometry utilities: camera poses, two-view and PnP solving.

pub mod essential;
pub mod pnp;
pub mod pose;

pub use essential::{EssentialFit, EssentialParams, find_essential, recover_relative_pose};
pub use pnp::{PnpParams, PnpResult, mean_reprojection_error, solve_pnp_ransac};
pub use pose::{Pose, skew};

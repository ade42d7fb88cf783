pub mod camera;
pub mod config;
pub mod error;
pub mod features;
pub mod geometry;
pub mod io;
pub mod mapping;
pub mod optimizer;
pub mod system;
pub mod tracking;
pub mod viz;

#[cfg(test)]
pub(crate) mod test_utils;

pub use camera::CameraIntrinsics;
pub use config::SfmConfig;
pub use error::{RefineError, Result, SfmError, Stage};
pub use system::{Reconstruction, Reconstructor};

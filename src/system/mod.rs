//! Run orchestration.

mod reconstructor;

pub use reconstructor::{Reconstruction, Reconstructor};

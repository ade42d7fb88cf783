//! Input images, calibration records and point-cloud files.

pub mod calibration;
pub mod images;
pub mod ply;

pub use calibration::{intrinsics_from_focal_length, load_calibration, save_calibration};
pub use images::{list_images, load_image};
pub use ply::{PlyVertex, read_ply, write_ply};

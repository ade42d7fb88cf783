//! Triangulation and point storage.

pub mod track_point;
pub mod track_store;
pub mod triangulation;

pub use track_point::{PointCloud, TrackPoint};
pub use track_store::{CloudHandle, CloudSnapshot, TrackStore};
pub use triangulation::{TriangulationConfig, TriangulationResult, Triangulator, triangulate_point};

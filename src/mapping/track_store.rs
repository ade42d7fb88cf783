//! Point storage for a run: the permanent cloud, the active set used for
//! the next 2D-3D matching step, and read-only snapshots for observers.
//!
//! Only points triangulated in the most recent transition are active, so a
//! track can be continued one frame later but never re-identified after
//! that.

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use nalgebra::Vector3;
use parking_lot::RwLock;

use crate::mapping::track_point::{PointCloud, TrackPoint};

/// Immutable copy of the cloud at one point in time.
#[derive(Debug, Clone, Default)]
pub struct CloudSnapshot {
    pub version: u64,
    pub points: Vec<TrackPoint>,
    /// Camera centres of every posed frame, in frame order.
    pub camera_centers: Vec<Vector3<f64>>,
}

/// Publication point shared between the store and any reader thread.
///
/// Writers swap in a fresh `Arc` under a short write lock; readers clone
/// the `Arc` and never block the writer for longer than that.
pub struct CloudHandle {
    current: RwLock<Arc<CloudSnapshot>>,
    version: AtomicU64,
}

impl CloudHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(Arc::new(CloudSnapshot::default())),
            version: AtomicU64::new(0),
        })
    }

    /// Version of the latest published snapshot. Cheap; poll this before
    /// calling [`CloudHandle::load`].
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn load(&self) -> Arc<CloudSnapshot> {
        Arc::clone(&self.current.read())
    }

    fn publish(&self, points: Vec<TrackPoint>, camera_centers: Vec<Vector3<f64>>) {
        let mut current = self.current.write();
        let version = current.version + 1;
        *current = Arc::new(CloudSnapshot {
            version,
            points,
            camera_centers,
        });
        self.version.store(version, Ordering::Release);
    }
}

pub struct TrackStore {
    cloud: PointCloud,
    active: Range<usize>,
    camera_centers: Vec<Vector3<f64>>,
    handle: Arc<CloudHandle>,
}

impl TrackStore {
    pub fn new() -> Self {
        Self::with_handle(CloudHandle::new())
    }

    /// Store that publishes into an existing handle (e.g. one a viewer
    /// already holds).
    pub fn with_handle(handle: Arc<CloudHandle>) -> Self {
        Self {
            cloud: PointCloud::new(),
            active: 0..0,
            camera_centers: Vec::new(),
            handle,
        }
    }

    pub fn handle(&self) -> Arc<CloudHandle> {
        Arc::clone(&self.handle)
    }

    pub fn cloud(&self) -> &PointCloud {
        &self.cloud
    }

    pub fn len(&self) -> usize {
        self.cloud.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cloud.is_empty()
    }

    /// Points of the latest transition.
    pub fn active(&self) -> &[TrackPoint] {
        &self.cloud.points()[self.active.clone()]
    }

    /// Keypoint indices (in the owning frame) of the active points, in
    /// active order.
    pub fn active_keypoints(&self) -> Vec<usize> {
        self.active().iter().map(|p| p.keypoint).collect()
    }

    /// Record the camera centre of a newly posed frame.
    pub fn record_camera(&mut self, center: Vector3<f64>) {
        self.camera_centers.push(center);
        self.publish();
    }

    /// Append the survivors of one transition and make them the active set.
    /// Returns how many points were added.
    pub fn commit(&mut self, points: Vec<TrackPoint>) -> usize {
        self.active = self.cloud.extend(points);
        self.publish();
        self.active.len()
    }

    /// Move every point to refined coordinates. Rejected (returns false)
    /// unless `positions` matches the cloud length.
    pub fn relocate(&mut self, positions: &[Vector3<f64>]) -> bool {
        let moved = self.cloud.relocate(positions);
        if moved {
            self.publish();
        }
        moved
    }

    pub fn replace_camera_centers(&mut self, centers: Vec<Vector3<f64>>) {
        self.camera_centers = centers;
        self.publish();
    }

    pub fn into_cloud(self) -> PointCloud {
        self.cloud
    }

    /// Skipped while nobody else holds the handle; the next write after a
    /// reader subscribes publishes the full state.
    fn publish(&self) {
        if Arc::strong_count(&self.handle) == 1 {
            return;
        }
        self.handle
            .publish(self.cloud.points().to_vec(), self.camera_centers.clone());
    }
}

impl Default for TrackStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(frame: usize, n: usize) -> Vec<TrackPoint> {
        (0..n)
            .map(|k| TrackPoint {
                position: Vector3::new(k as f64, 0.0, 4.0),
                color: 0x102030,
                frame,
                keypoint: 10 * frame + k,
                source_keypoint: k,
            })
            .collect()
    }

    #[test]
    fn test_commit_replaces_active_set() {
        let mut store = TrackStore::new();
        assert_eq!(store.commit(points(1, 3)), 3);
        assert_eq!(store.active_keypoints(), vec![10, 11, 12]);

        assert_eq!(store.commit(points(2, 2)), 2);
        assert_eq!(store.len(), 5);
        assert!(store.active().iter().all(|p| p.frame == 2));
        assert_eq!(store.active_keypoints(), vec![20, 21]);
    }

    #[test]
    fn test_empty_commit_clears_active_set() {
        let mut store = TrackStore::new();
        store.commit(points(1, 3));
        store.commit(Vec::new());
        assert!(store.active().is_empty());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_snapshots_are_isolated_from_later_writes() {
        let mut store = TrackStore::new();
        let handle = store.handle();
        assert_eq!(handle.version(), 0);

        store.commit(points(1, 2));
        let first = handle.load();
        assert_eq!(first.version, 1);

        store.record_camera(Vector3::new(1.0, 0.0, 0.0));
        store.commit(points(2, 4));
        assert_eq!(handle.version(), 3);
        assert_eq!(first.points.len(), 2);

        let latest = handle.load();
        assert_eq!(latest.points.len(), 6);
        assert_eq!(latest.camera_centers.len(), 1);
    }

    #[test]
    fn test_relocate_publishes_only_on_success() {
        let mut store = TrackStore::new();
        let handle = store.handle();
        store.commit(points(1, 2));
        let before = handle.version();

        assert!(!store.relocate(&[Vector3::zeros()]));
        assert_eq!(handle.version(), before);

        assert!(store.relocate(&[Vector3::zeros(), Vector3::x()]));
        assert_eq!(handle.version(), before + 1);
        assert_eq!(store.cloud().points()[1].position, Vector3::x());
    }

    #[test]
    fn test_no_snapshots_without_readers() {
        let mut store = TrackStore::new();
        store.commit(points(1, 3));
        store.record_camera(Vector3::zeros());

        let handle = store.handle();
        assert_eq!(handle.version(), 0);
        assert!(handle.load().points.is_empty());

        // First write after subscribing carries everything so far.
        store.commit(points(2, 1));
        assert_eq!(handle.version(), 1);
        assert_eq!(handle.load().points.len(), 4);
        assert_eq!(handle.load().camera_centers.len(), 1);
    }
}

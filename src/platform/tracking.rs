//! Tracking session interfaces

use crate::core::{LocalTransform, SurfaceHit, TrackingQualitySignals};
use crate::validation::PlatformResult;
use nalgebra::Vector3;

/// Completion for a snapshot application; `true` when the session relocalized
pub type RelocalizationCallback = Box<dyn FnOnce(bool) + Send>;

/// Horizontal plane hit test against the live session
pub trait TrackingSurfaceQuery: Send + Sync {
    /// Hits of horizontal surfaces along a ray, as world positions
    /// An empty result means nothing was hit.
    fn raycast_horizontal_surfaces(&self, origin: Vector3<f64>, direction: Vector3<f64>) -> Vec<SurfaceHit>;
}

/// The device's AR tracking session
pub trait TrackingSession: Send + Sync {
    /// Current pose of the observer (camera) in local space
    fn current_observer_pose(&self) -> LocalTransform;

    /// Signals used to score how well the current map would relocalize
    fn current_tracking_quality_signals(&self) -> TrackingQualitySignals;

    /// Serialize the session's tracking map
    fn capture_snapshot_blob(&self) -> PlatformResult<Vec<u8>>;

    /// Feed a previous map to the session as an initialization hint
    ///
    /// `completion` is invoked at most once. Implementations may call it on
    /// any thread, or never if the attempt is abandoned.
    fn apply_snapshot_blob(&self, blob: Vec<u8>, completion: RelocalizationCallback);
}

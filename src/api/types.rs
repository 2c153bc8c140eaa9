//! Types exchanged with the surrounding application

use crate::algorithms::DriftReport;
use crate::persistence::RelocalizationOutcome;
use crate::platform::{PersistentKv, TrackingSession, TrackingSurfaceQuery};
use std::sync::Arc;

/// External collaborators a session is built from
#[derive(Clone)]
pub struct Collaborators {
    pub surface_query: Arc<dyn TrackingSurfaceQuery>,
    pub tracking: Arc<dyn TrackingSession>,
    /// Backing store for the anchor table
    pub anchor_storage: Arc<dyn PersistentKv>,
    /// Backing store for world snapshots; may be the same store
    pub snapshot_storage: Arc<dyn PersistentKv>,
}

impl Collaborators {
    /// Collaborators sharing one key-value store
    pub fn new(
        surface_query: Arc<dyn TrackingSurfaceQuery>,
        tracking: Arc<dyn TrackingSession>,
        storage: Arc<dyn PersistentKv>,
    ) -> Self {
        Self {
            surface_query,
            tracking,
            anchor_storage: Arc::clone(&storage),
            snapshot_storage: storage,
        }
    }
}

/// What happened during `on_session_start`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStartReport {
    pub snapshot_restored: bool,
    pub relocalization: Option<RelocalizationOutcome>,
    pub anchors_loaded: usize,
    /// Set when the anchor table could not be read; the session continues empty
    pub load_error: Option<String>,
    pub drift: Option<DriftReport>,
}

impl SessionStartReport {
    /// Whether the previous session's local frame was re-established
    pub fn relocalized(&self) -> bool {
        self.relocalization.map_or(false, |outcome| outcome.is_success())
    }
}

/// What happened during `on_session_end`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionEndReport {
    pub anchors_saved: usize,
    /// Quality of the snapshot captured on the way out, if any
    pub snapshot_quality: Option<f64>,
    pub capture_error: Option<String>,
}

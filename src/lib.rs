//! Geo-Anchoring for AR Sessions
//!
//! Places virtual objects at stable physical locations across sessions and
//! across observers, reconciling GPS, each device's drifting local tracking
//! frame and the anchors shared between peers.

pub mod core;
pub mod algorithms;
pub mod processing;
pub mod persistence;
pub mod sync;
pub mod platform;
pub mod validation;
pub mod utils;
pub mod api;

// Re-export commonly used types
pub use core::{Anchor, GeoPoint, LocalTransform, ObjectClass, OriginBinding, SyncBundle, WorldSnapshot, EARTH_RADIUS_M};
pub use algorithms::{gps_to_local_offset, local_offset_to_gps, DriftCorrector, DriftReport, SurfaceGroundingEngine};
pub use persistence::{AnchorStore, PutOutcome, RelocalizationOutcome, WorldSnapshotService};
pub use sync::{AnchorSyncCoordinator, ImportReport, PeerSyncState};
pub use platform::{PersistentKv, TrackingSession, TrackingSurfaceQuery, Transport};
pub use validation::{SessionError, SessionResult, StoreError, SyncError};
pub use utils::AnchoringConfig;
pub use api::{AnchoringSession, Collaborators, Diagnostics, SessionEndReport, SessionStartReport};

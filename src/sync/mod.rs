//! Peer synchronization of anchors and world snapshots

pub mod bundle;
pub mod coordinator;

pub use bundle::{decode_bundle, encode_bundle, BUNDLE_FORMAT_VERSION};
pub use coordinator::{AnchorSyncCoordinator, ImportReport, PeerSyncState, SyncContext};

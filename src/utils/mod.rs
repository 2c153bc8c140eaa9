//! Configuration

pub mod config;

pub use config::{
    AnchoringConfig, DriftConfig, GroundingConfig, SessionConfig, SnapshotConfig, StoreConfig, SyncConfig,
};
